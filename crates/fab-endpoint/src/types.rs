//! Endpoint and topology types.
//!
//! The topology file is produced by the operator layer and describes this node
//! (flattened at the top level), its peers and an optional mediator:
//!
//! ```yaml
//! id: C=CN, O=fabedge.io, CN=edge1
//! name: edge1
//! publicAddresses: [10.20.8.12]
//! subnets: [2.2.1.0/26]
//! nodeSubnets: [10.20.8.12]
//! type: EdgeNode
//! peers:
//!   - id: C=CN, O=fabedge.io, CN=cloud-connector
//!     name: cloud-connector
//!     publicAddresses: [10.20.8.169]
//!     subnets: [2.2.0.0/26]
//!     nodeSubnets: [10.20.8.169]
//!     type: Connector
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EndpointError, Result};

/// Role of an endpoint in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EndpointType {
    /// The cloud-side tunnel terminator of a cluster.
    Connector,
    /// An edge node.
    #[default]
    EdgeNode,
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connector => write!(f, "Connector"),
            Self::EdgeNode => write!(f, "EdgeNode"),
        }
    }
}

/// A tunnel endpoint: this node or one of its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// IKE identity, usually the certificate subject.
    pub id: String,
    /// Globally unique endpoint name.
    pub name: String,
    /// Addresses the peer can be reached on.
    #[serde(default)]
    pub public_addresses: Vec<String>,
    /// Pod CIDRs behind the endpoint.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Host IPs or CIDRs of the endpoint's nodes.
    #[serde(default)]
    pub node_subnets: Vec<String>,
    /// Role of the endpoint.
    #[serde(rename = "type", default)]
    pub endpoint_type: EndpointType,
    /// IKE port, when not the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Endpoint {
    /// Creates an endpoint with the given identity and name.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        endpoint_type: EndpointType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            public_addresses: Vec::new(),
            subnets: Vec::new(),
            node_subnets: Vec::new(),
            endpoint_type,
            port: None,
        }
    }

    /// Adds a public address.
    #[must_use]
    pub fn with_public_address(mut self, address: impl Into<String>) -> Self {
        self.public_addresses.push(address.into());
        self
    }

    /// Adds a pod subnet.
    #[must_use]
    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnets.push(subnet.into());
        self
    }

    /// Adds a node subnet.
    #[must_use]
    pub fn with_node_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.node_subnets.push(subnet.into());
        self
    }

    /// Sets the IKE port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Returns true if this endpoint is a connector.
    #[must_use]
    pub fn is_connector(&self) -> bool {
        self.endpoint_type == EndpointType::Connector
    }

    /// Pod subnets followed by node subnets.
    pub fn all_cidrs(&self) -> impl Iterator<Item = &String> {
        self.subnets.iter().chain(self.node_subnets.iter())
    }
}

/// Topology description for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConf {
    /// This node's own endpoint.
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Peers to connect to; the first is conventionally the connector.
    #[serde(default)]
    pub peers: Vec<Endpoint>,
    /// Optional mediator used for edge-to-edge hole punching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mediator: Option<Endpoint>,
}

impl NetworkConf {
    /// Loads and validates a topology file.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Config`] if the file is unreadable, malformed
    /// or inconsistent.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EndpointError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&content).map_err(|reason| EndpointError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parses and validates a topology document.
    pub fn from_yaml(content: &str) -> std::result::Result<Self, String> {
        let conf: Self = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
        conf.validate()?;
        Ok(conf)
    }

    /// Checks names are present and unique.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.endpoint.name.is_empty() {
            return Err("endpoint name cannot be empty".to_string());
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.name.is_empty() {
                return Err("peer name cannot be empty".to_string());
            }
            if peer.name == self.endpoint.name {
                return Err(format!("peer '{}' has the same name as this node", peer.name));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(format!("duplicate peer '{}'", peer.name));
            }
        }

        Ok(())
    }
}
