//! Error types for rule synchronization.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while managing firewall and load balancer rules.
#[derive(Debug, Error)]
pub enum RuleError {
    /// A kernel tool exited with an error.
    #[error("{program} {args} failed: {stderr}")]
    Command {
        /// Program that was run.
        program: String,
        /// Arguments, space separated.
        args: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A subnet could not be parsed.
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// The services file is unreadable or malformed.
    #[error("services config '{path}': {reason}")]
    ServicesConfig {
        /// Path of the services file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Tool output could not be parsed.
    #[error("unexpected output from {program}: {reason}")]
    UnexpectedOutput {
        /// Program that produced the output.
        program: String,
        /// Parse failure.
        reason: String,
    },

    /// Failed to spawn a tool.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;
