//! IPsec tunnel management for the FabEdge overlay.
//!
//! The [`TunnelManager`] converges the connections loaded in strongSwan to a
//! set of [`ConnConfig`]s. It talks to the daemon through the [`IpsecDaemon`]
//! trait, implemented over the VICI socket by [`ViciDaemon`] and in memory by
//! [`FakeIpsecDaemon`].

pub mod certs;
pub mod conn;
pub mod daemon;
pub mod error;
pub mod fake;
pub mod manager;
pub mod vici;

pub use conn::{ConnConfig, MEDIATION_SUFFIX, are_subnets_identical};
pub use daemon::{
    ActiveSa, ChildDescriptor, ConnectionDescriptor, DaemonStats, IpsecDaemon, ViciDaemon,
};
pub use error::{Result, TunnelError};
pub use fake::FakeIpsecDaemon;
pub use manager::{TunnelManager, TunnelManagerConfig};
