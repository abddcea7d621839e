//! Error types for the agent.

use thiserror::Error;

/// Errors that can occur while running the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// The topology is not usable yet.
    #[error("topology not loaded: {0}")]
    Topology(String),

    /// Tunnels are down, so peer routes were withdrawn.
    #[error("no active tunnels")]
    TunnelsInactive,

    /// Some connections of a pass failed.
    #[error("{failed} of {total} connections failed, first: {first}")]
    Connections {
        /// Number of failed connections.
        failed: usize,
        /// Number of connections in the pass.
        total: usize,
        /// First failure.
        first: fab_tunnel::TunnelError,
    },

    /// File watcher setup failed.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Endpoint store failure.
    #[error(transparent)]
    Endpoint(#[from] fab_endpoint::EndpointError),

    /// Tunnel daemon failure.
    #[error(transparent)]
    Tunnel(#[from] fab_tunnel::TunnelError),

    /// Routing table failure.
    #[error(transparent)]
    Route(#[from] fab_route::RouteError),

    /// Firewall or load balancer failure.
    #[error(transparent)]
    Rule(#[from] fab_rules::RuleError),

    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
