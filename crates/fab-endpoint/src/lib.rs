//! Peer endpoint directory for the FabEdge overlay.
//!
//! Provides the topology file types, the thread-safe peer endpoint store,
//! persistence of discovered endpoints and multicast endpoint discovery.

pub mod error;
pub mod gossip;
pub mod persist;
pub mod store;
pub mod types;

pub use error::{EndpointError, Result};
pub use gossip::{GossipConfig, GossipMessage, spawn_broadcaster, spawn_receiver};
pub use persist::SavedEndpoint;
pub use store::{PeerEndpointEntry, PeerEndpointStore, Snapshot, UpsertOutcome};
pub use types::{Endpoint, EndpointType, NetworkConf};
