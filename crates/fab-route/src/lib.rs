//! Overlay route management for the FabEdge overlay.
//!
//! The [`RouteSynchronizer`] keeps a dedicated routing table in line with the
//! loaded tunnel connections. [`CniRouter`] discovers the prefixes a node owns
//! for the configured network plugin, and [`PrefixPropagator`] shares them
//! with sibling nodes.

pub mod cni;
pub mod error;
pub mod propagate;
pub mod sync;
pub mod table;

pub use cni::{CniRouter, CniType, PrefixDiscovery};
pub use error::{Result, RouteError};
pub use propagate::{
    ClusterMembership, FakeMembership, MembershipEvent, PrefixAnnouncement, PrefixPropagator,
    PropagationConfig, UdpMembership, UdpMembershipConfig,
};
pub use sync::RouteSynchronizer;
pub use table::{
    AddressFamily, DEFAULT_TABLE, FakeRouteTable, IpRouteTable, MAIN_TABLE, Route, RouteKind,
    RouteTable,
};
