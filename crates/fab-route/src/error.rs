//! Error types for route operations.

use thiserror::Error;

/// Errors that can occur while managing kernel routes.
#[derive(Debug, Error)]
pub enum RouteError {
    /// A routing command exited with an error.
    #[error("{program} {args} failed: {stderr}")]
    Command {
        /// Program that was run.
        program: String,
        /// Arguments, space separated.
        args: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A destination could not be parsed.
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// No default route exists for the address family.
    #[error("no default gateway for {0}")]
    NoDefaultGateway(String),

    /// Command output could not be parsed.
    #[error("unexpected output from {program}: {reason}")]
    UnexpectedOutput {
        /// Program that produced the output.
        program: String,
        /// Parse failure.
        reason: String,
    },

    /// The membership channel failed.
    #[error("membership error: {0}")]
    Membership(String),

    /// Failed to spawn a command or use a socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for route operations.
pub type Result<T> = std::result::Result<T, RouteError>;
