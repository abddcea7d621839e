//! Tunnel connection configuration.

use std::collections::BTreeSet;
use std::net::IpAddr;

use fab_endpoint::{Endpoint, EndpointType};
use ipnet::IpNet;

use crate::daemon::{ChildDescriptor, ConnectionDescriptor};

/// Appended to the peer name to form the mediation connection name.
pub const MEDIATION_SUFFIX: &str = "-mediation";

/// Desired state of one tunnel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnConfig {
    /// Connection name, the tunnel identifier in the daemon.
    pub name: String,

    /// Local IKE identity.
    pub local_id: String,
    /// Local addresses.
    pub local_address: Vec<String>,
    /// Local pod subnets.
    pub local_subnets: Vec<String>,
    /// Local node subnets.
    pub local_node_subnets: Vec<String>,
    /// Certificate files, relative to the certs directory unless absolute.
    pub local_certs: Vec<String>,
    /// Role of this node.
    pub local_type: EndpointType,

    /// Remote IKE identity.
    pub remote_id: String,
    /// Remote addresses.
    pub remote_address: Vec<String>,
    /// Remote pod subnets.
    pub remote_subnets: Vec<String>,
    /// Remote node subnets.
    pub remote_node_subnets: Vec<String>,
    /// Role of the peer.
    pub remote_type: EndpointType,
    /// Remote IKE port.
    pub remote_port: Option<u16>,

    /// The peer is a mediation server.
    pub mediation: bool,
    /// The peer is reached through a mediator.
    pub need_mediation: bool,
    /// Name of the mediation connection.
    pub mediated_by: Option<String>,
    /// Identity of the peer at the mediator.
    pub mediation_peer: Option<String>,
}

impl ConnConfig {
    /// Describes a connection from `local` to `remote`, named after the peer.
    #[must_use]
    pub fn new(local: &Endpoint, remote: &Endpoint) -> Self {
        Self {
            name: remote.name.clone(),
            local_id: local.id.clone(),
            local_address: local.public_addresses.clone(),
            local_subnets: local.subnets.clone(),
            local_node_subnets: local.node_subnets.clone(),
            local_certs: Vec::new(),
            local_type: local.endpoint_type,
            remote_id: remote.id.clone(),
            remote_address: remote.public_addresses.clone(),
            remote_subnets: remote.subnets.clone(),
            remote_node_subnets: remote.node_subnets.clone(),
            remote_type: remote.endpoint_type,
            remote_port: remote.port,
            mediation: false,
            need_mediation: false,
            mediated_by: None,
            mediation_peer: None,
        }
    }

    /// Sets the certificate files.
    #[must_use]
    pub fn with_certs(mut self, certs: Vec<String>) -> Self {
        self.local_certs = certs;
        self
    }

    /// Marks the peer as a mediation server.
    ///
    /// The connection is renamed to `<peer>-mediation` so it can coexist with
    /// the regular connection to the same peer.
    #[must_use]
    pub fn as_mediation(mut self) -> Self {
        self.mediation = true;
        self.name = format!("{}{MEDIATION_SUFFIX}", self.name);
        self
    }

    /// Routes the connection through the mediation connection `mediator`.
    #[must_use]
    pub fn via_mediator(mut self, mediator: impl Into<String>) -> Self {
        self.need_mediation = true;
        self.mediated_by = Some(mediator.into());
        self
    }

    /// Name of the pod to pod child.
    #[must_use]
    pub fn p2p_child(&self) -> String {
        format!("{}-p2p", self.name)
    }

    /// Name of the local node to remote pod child.
    #[must_use]
    pub fn n2p_child(&self) -> String {
        format!("{}-n2p", self.name)
    }

    /// Name of the local pod to remote node child.
    #[must_use]
    pub fn p2n_child(&self) -> String {
        format!("{}-p2n", self.name)
    }

    /// Child SAs of this connection. Mediation connections carry none.
    #[must_use]
    pub fn children(&self) -> Vec<ChildDescriptor> {
        if self.mediation {
            return Vec::new();
        }
        vec![
            ChildDescriptor {
                name: self.p2p_child(),
                local_ts: self.local_subnets.clone(),
                remote_ts: self.remote_subnets.clone(),
            },
            ChildDescriptor {
                name: self.n2p_child(),
                local_ts: self.local_node_subnets.clone(),
                remote_ts: self.remote_subnets.clone(),
            },
            ChildDescriptor {
                name: self.p2n_child(),
                local_ts: self.local_subnets.clone(),
                remote_ts: self.remote_node_subnets.clone(),
            },
        ]
    }

    /// Builds the daemon descriptor with already loaded certificates.
    #[must_use]
    pub fn to_descriptor(&self, certs: Vec<String>) -> ConnectionDescriptor {
        let (mediated_by, mediation_peer) = if self.need_mediation {
            (
                self.mediated_by.clone(),
                Some(
                    self.mediation_peer
                        .clone()
                        .unwrap_or_else(|| self.remote_id.clone()),
                ),
            )
        } else {
            (None, None)
        };

        ConnectionDescriptor {
            name: self.name.clone(),
            local_id: self.local_id.clone(),
            local_addrs: self.local_address.clone(),
            local_certs: certs,
            remote_id: self.remote_id.clone(),
            remote_addrs: self.remote_address.clone(),
            remote_port: self.remote_port,
            mediation: self.mediation,
            mediated_by,
            mediation_peer,
            children: self.children(),
        }
    }
}

/// Normalizes a CIDR or bare address; bare addresses become host routes.
fn normalize(value: &str) -> String {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return net.trunc().to_string();
    }
    if let Ok(addr) = value.parse::<IpAddr>() {
        return IpNet::from(addr).to_string();
    }
    value.to_string()
}

/// Compares two subnet lists as sets after normalization.
///
/// `10.0.0.1` equals `10.0.0.1/32`, while `fd00::1` and `fd00::1/64` differ.
#[must_use]
pub fn are_subnets_identical(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<String> = a.iter().map(|s| normalize(s)).collect();
    let b: BTreeSet<String> = b.iter().map(|s| normalize(s)).collect();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    fn edge(name: &str, subnet: &str, node: &str) -> Endpoint {
        Endpoint::new(format!("CN={name}"), name, EndpointType::EdgeNode)
            .with_public_address(node)
            .with_subnet(subnet)
            .with_node_subnet(node)
    }

    #[test_case(&["10.0.0.1"], &["10.0.0.1/32"], true ; "bare ipv4 is host route")]
    #[test_case(&["fd00::1"], &["fd00::1/128"], true ; "bare ipv6 is host route")]
    #[test_case(&["fd00::1"], &["fd00::1/64"], false ; "ipv6 prefix differs")]
    #[test_case(&["10.1.0.0/24", "10.2.0.0/24"], &["10.2.0.0/24", "10.1.0.0/24"], true ; "order ignored")]
    #[test_case(&["10.1.0.0/24", "10.1.0.0/24"], &["10.1.0.0/24"], true ; "duplicates ignored")]
    #[test_case(&["10.1.0.0/24"], &["10.1.0.0/25"], false ; "different prefix")]
    #[test_case(&[], &[], true ; "empty")]
    fn test_are_subnets_identical(a: &[&str], b: &[&str], expected: bool) {
        assert_eq!(are_subnets_identical(&strings(a), &strings(b)), expected);
    }

    #[test]
    fn test_three_children_with_expected_selectors() {
        let cfg = ConnConfig::new(
            &edge("edge1", "10.1.0.0/24", "192.168.0.1"),
            &edge("edge2", "10.2.0.0/24", "192.168.0.2"),
        );
        let children = cfg.children();

        assert_eq!(children.len(), 3);
        assert_eq!(children[0].name, "edge2-p2p");
        assert_eq!(children[0].local_ts, strings(&["10.1.0.0/24"]));
        assert_eq!(children[0].remote_ts, strings(&["10.2.0.0/24"]));
        assert_eq!(children[1].name, "edge2-n2p");
        assert_eq!(children[1].local_ts, strings(&["192.168.0.1"]));
        assert_eq!(children[1].remote_ts, strings(&["10.2.0.0/24"]));
        assert_eq!(children[2].name, "edge2-p2n");
        assert_eq!(children[2].local_ts, strings(&["10.1.0.0/24"]));
        assert_eq!(children[2].remote_ts, strings(&["192.168.0.2"]));
    }

    #[test]
    fn test_mediation_conn_has_no_children() {
        let mediator = Endpoint::new("CN=mediator", "mediator", EndpointType::Connector);
        let cfg = ConnConfig::new(&edge("edge1", "10.1.0.0/24", "192.168.0.1"), &mediator)
            .as_mediation();
        let descriptor = cfg.to_descriptor(Vec::new());
        assert_eq!(descriptor.name, "mediator-mediation");
        assert!(descriptor.mediation);
        assert!(descriptor.children.is_empty());
    }

    #[test]
    fn test_mediated_conn_defaults_peer_to_remote_id() {
        let cfg = ConnConfig::new(
            &edge("edge1", "10.1.0.0/24", "192.168.0.1"),
            &edge("edge2", "10.2.0.0/24", "192.168.0.2"),
        )
        .via_mediator("mediator");
        let descriptor = cfg.to_descriptor(Vec::new());

        assert_eq!(descriptor.mediated_by.as_deref(), Some("mediator"));
        assert_eq!(descriptor.mediation_peer.as_deref(), Some("CN=edge2"));
    }

    #[test]
    fn test_unmediated_conn_drops_mediation_fields() {
        let mut cfg = ConnConfig::new(
            &edge("edge1", "10.1.0.0/24", "192.168.0.1"),
            &edge("edge2", "10.2.0.0/24", "192.168.0.2"),
        );
        cfg.mediated_by = Some("stale".to_string());
        assert_eq!(cfg.to_descriptor(Vec::new()).mediated_by, None);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;
        use std::net::Ipv4Addr;

        proptest! {
            #[test]
            fn host_bits_do_not_matter(addr in any::<u32>(), prefix in 0u8..=32) {
                let net = ipnet::Ipv4Net::new(Ipv4Addr::from(addr), prefix).expect("prefix");
                let raw = vec![net.to_string()];
                let truncated = vec![net.trunc().to_string()];
                prop_assert!(are_subnets_identical(&raw, &truncated));
            }

            #[test]
            fn order_and_duplicates_do_not_matter(
                addrs in proptest::collection::vec(any::<u32>(), 1..8),
            ) {
                let bare: Vec<String> =
                    addrs.iter().map(|a| Ipv4Addr::from(*a).to_string()).collect();
                let mut hosts: Vec<String> = bare.iter().rev().map(|a| format!("{a}/32")).collect();
                hosts.push(hosts[0].clone());
                prop_assert!(are_subnets_identical(&bare, &hosts));
            }
        }
    }
}
