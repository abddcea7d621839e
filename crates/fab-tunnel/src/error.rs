//! Error types for tunnel operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while talking to the IPsec daemon.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The control protocol was violated or the session broke.
    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon does not know the command or event.
    #[error("daemon does not support '{0}'")]
    Unsupported(String),

    /// The daemon executed the command and reported failure.
    #[error("'{command}' failed: {message}")]
    CommandFailed {
        /// Command that failed.
        command: String,
        /// Error message reported by the daemon.
        message: String,
    },

    /// The named connection is not loaded in the daemon.
    #[error("connection '{0}' is not loaded")]
    UnknownConnection(String),

    /// A packet on the wire could not be decoded.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A certificate could not be loaded.
    #[error("certificate '{path}': {reason}")]
    Certificate {
        /// Resolved path of the certificate.
        path: PathBuf,
        /// Why the certificate was rejected.
        reason: String,
    },

    /// Socket or file system failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;
