//! Error types for the peer endpoint store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading, persisting or discovering endpoints.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The topology file could not be read or parsed.
    #[error("invalid network config '{path}': {reason}")]
    Config {
        /// Path of the offending file.
        path: PathBuf,
        /// Why the file was rejected.
        reason: String,
    },

    /// The local endpoints file could not be read or written.
    #[error("local endpoints file '{path}': {reason}")]
    Persistence {
        /// Path of the persistence file.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// A gossip message carried the wrong token.
    #[error("gossip message from '{name}' rejected: token mismatch")]
    GossipAuth {
        /// Name announced by the sender.
        name: String,
    },

    /// A gossip message could not be decoded.
    #[error("malformed gossip message: {0}")]
    MalformedMessage(String),

    /// Socket or file system failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for endpoint operations.
pub type Result<T> = std::result::Result<T, EndpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = EndpointError::Config {
            path: PathBuf::from("/etc/fabedge/tunnels.yaml"),
            reason: "missing field `name`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid network config '/etc/fabedge/tunnels.yaml': missing field `name`"
        );
    }

    #[test]
    fn test_gossip_auth_display() {
        let err = EndpointError::GossipAuth {
            name: "edge1".to_string(),
        };
        assert!(err.to_string().contains("edge1"));
        assert!(err.to_string().contains("token mismatch"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EndpointError = io_err.into();
        assert!(err.to_string().starts_with("io error"));
    }
}
