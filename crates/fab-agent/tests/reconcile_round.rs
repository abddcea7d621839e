//! One full reconciliation round against in-memory backends.

use std::path::Path;
use std::sync::Arc;

use fab_agent::config::TunnelConfig;
use fab_agent::{
    AgentConfig, Manager, RetryOutcome, RouteReconciler, RuleReconciler, TunnelReconciler,
};
use fab_endpoint::PeerEndpointStore;
use fab_route::{DEFAULT_TABLE, FakeRouteTable, RouteKind, RouteSynchronizer};
use fab_rules::{FakeIpSet, FakeIpTables, RuleSynchronizer, Table};
use fab_tunnel::{FakeIpsecDaemon, TunnelManager, TunnelManagerConfig};

const TOPOLOGY: &str = "\
id: C=CN, O=fabedge.io, CN=edge1
name: edge1
publicAddresses: [192.168.0.10]
subnets: [10.1.0.0/24]
nodeSubnets: [192.168.0.10]
type: EdgeNode
peers:
  - id: C=CN, O=fabedge.io, CN=connector
    name: connector
    publicAddresses: [10.20.8.169]
    subnets: [10.2.0.0/16]
    nodeSubnets: [192.168.1.1/32]
    type: Connector
";

struct Node {
    daemon: FakeIpsecDaemon,
    table: Arc<FakeRouteTable>,
    iptables: FakeIpTables,
    ipset: Arc<FakeIpSet>,
    manager: Manager,
}

fn node(dir: &Path) -> Node {
    let mut config = AgentConfig::default();
    config.paths.network_conf = dir.join("tunnels.yaml");
    config.tunnel = TunnelConfig {
        local_certs: Vec::new(),
        ..TunnelConfig::default()
    };
    let config = Arc::new(config);

    let daemon = FakeIpsecDaemon::new();
    let tunnels = Arc::new(TunnelManager::new(
        daemon.clone(),
        TunnelManagerConfig::default(),
    ));
    let table = Arc::new(FakeRouteTable::new());
    table.set_default_gateway("192.168.0.1".parse().expect("gateway"));
    let iptables = FakeIpTables::new();
    let ipset = Arc::new(FakeIpSet::new());

    let manager = Manager::new(Arc::clone(&config), Arc::new(PeerEndpointStore::new()))
        .with_reconciler(Arc::new(TunnelReconciler::new(
            Arc::clone(&tunnels),
            config.tunnel.clone(),
        )))
        .with_reconciler(Arc::new(RouteReconciler::new(
            tunnels,
            RouteSynchronizer::new(Arc::clone(&table), DEFAULT_TABLE),
            config.tunnel.clone(),
            None,
        )))
        .with_reconciler(Arc::new(RuleReconciler::new(RuleSynchronizer::new(
            iptables.clone(),
            FakeIpTables::new(),
            Arc::clone(&ipset),
        ))));

    Node {
        daemon,
        table,
        iptables,
        ipset,
        manager,
    }
}

#[tokio::test(start_paused = true)]
async fn test_round_converges_node_to_topology() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("tunnels.yaml"), TOPOLOGY).expect("write topology");
    let node = node(dir.path());

    let outcomes = node.manager.start_round(1).wait().await;
    assert_eq!(outcomes.len(), 3);
    assert!(
        outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, RetryOutcome::Succeeded { .. })),
        "{outcomes:?}"
    );

    // One connection with three children.
    assert_eq!(node.daemon.connection_names(), vec!["connector"]);
    let conn = node.daemon.connection("connector").expect("connection");
    let children: Vec<&str> = conn.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(children, vec!["connector-p2p", "connector-n2p", "connector-p2n"]);

    // Peer set holds the peer's subnets and node subnets.
    let members: Vec<String> = node.ipset.entries("FABEDGE-PEER-CIDR").into_iter().collect();
    assert_eq!(members, vec!["10.2.0.0/16", "192.168.1.1/32"]);
    assert!(node.iptables.rules(Table::Filter, "FABEDGE-FORWARD").is_some());

    // A route to the peer subnet via the default gateway.
    let routes = node.table.routes_in(DEFAULT_TABLE);
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].kind, RouteKind::Unicast);
    assert_eq!(routes[0].destination.to_string(), "10.2.0.0/16");
    assert_eq!(
        routes[0].gateway,
        Some("192.168.0.1".parse().expect("gateway"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_round_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("tunnels.yaml"), TOPOLOGY).expect("write topology");
    let node = node(dir.path());

    node.manager.start_round(1).wait().await;
    let loads = node.daemon.load_calls();
    let initiates = node.daemon.initiate_calls();
    let adds = node.ipset.add_calls();

    node.manager.start_round(2).wait().await;
    assert_eq!(node.daemon.load_calls(), loads);
    assert_eq!(node.daemon.initiate_calls(), initiates);
    assert_eq!(node.ipset.add_calls(), adds);
}

#[tokio::test(start_paused = true)]
async fn test_removed_peer_is_torn_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tunnels.yaml");
    std::fs::write(&path, TOPOLOGY).expect("write topology");
    let node = node(dir.path());
    node.manager.start_round(1).wait().await;

    let alone = TOPOLOGY
        .split("peers:")
        .next()
        .expect("self section")
        .to_string();
    std::fs::write(&path, alone).expect("rewrite topology");
    node.manager.start_round(2).wait().await;

    assert!(node.daemon.connection_names().is_empty());
    assert!(node.ipset.entries("FABEDGE-PEER-CIDR").is_empty());
    assert!(node.table.routes_in(DEFAULT_TABLE).is_empty());
}
