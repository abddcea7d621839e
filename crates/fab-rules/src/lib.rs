//! Host firewall and load balancer rules for the FabEdge overlay.
//!
//! [`RuleSynchronizer`] keeps the `FABEDGE-*` iptables chains and the peer
//! CIDR ipsets in line with the endpoint store. [`IpvsSynchronizer`] converges
//! the kernel IPVS table to the services file on connector nodes.

pub mod error;
pub mod family;
pub mod ipset;
pub mod iptables;
pub mod ipvs;
pub mod sync;

pub use error::{Result, RuleError};
pub use family::{CHAIN_FORWARD, CHAIN_INPUT, CHAIN_NAT_OUTGOING, IpFamily};
pub use ipset::{CommandIpSet, FakeIpSet, IpSet};
pub use iptables::{CommandIpTables, FakeIpTables, IpTables, Table};
pub use ipvs::{
    CommandIpvs, FakeIpvs, Ipvs, IpvsSynchronizer, Protocol, RealServer, VirtualServer,
    load_services,
};
pub use sync::{DesiredRules, RuleSynchronizer};
