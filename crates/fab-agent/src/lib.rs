//! FabEdge node agent.
//!
//! Converges the tunnels, routes and firewall rules of a node to the peer
//! topology. The [`Manager`] debounces change triggers and runs one retrying
//! task per [`Reconciler`] in every round.

pub mod bootstrap;
pub mod config;
pub mod debounce;
pub mod error;
pub mod manager;
pub mod reconcile;
pub mod retry;
pub mod watch;

pub use config::AgentConfig;
pub use debounce::Notifier;
pub use error::{AgentError, Result};
pub use manager::{Manager, Round};
pub use reconcile::{
    LoadBalancerReconciler, Reconciler, RouteReconciler, RuleReconciler, TunnelReconciler,
    plan_connections,
};
pub use retry::{RetryOutcome, retry_forever};
