//! Wires the kernel and daemon backed components into a [`Manager`].

use std::sync::Arc;

use fab_endpoint::PeerEndpointStore;
use fab_route::{CniRouter, IpRouteTable, PrefixPropagator, RouteSynchronizer, UdpMembership};
use fab_rules::{
    CommandIpSet, CommandIpTables, CommandIpvs, IpFamily, IpvsSynchronizer, RuleSynchronizer,
};
use fab_tunnel::{TunnelManager, ViciDaemon};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::manager::Manager;
use crate::reconcile::{LoadBalancerReconciler, RouteReconciler, RuleReconciler, TunnelReconciler};

/// Builds a manager driving strongSwan, iproute2, iptables, ipset and ipvsadm.
pub fn build_manager(config: Arc<AgentConfig>) -> Manager {
    let store = Arc::new(PeerEndpointStore::new());
    let tunnels = Arc::new(TunnelManager::new(
        ViciDaemon::new(&config.tunnel.vici_socket),
        config.tunnel_manager_config(),
    ));
    let routes = RouteSynchronizer::new(Arc::new(IpRouteTable::new()), config.route.table);
    let rules = RuleSynchronizer::new(
        CommandIpTables::new(IpFamily::V4),
        CommandIpTables::new(IpFamily::V6),
        Arc::new(CommandIpSet::new()),
    );

    let mut manager = Manager::new(Arc::clone(&config), store)
        .with_reconciler(Arc::new(TunnelReconciler::new(
            Arc::clone(&tunnels),
            config.tunnel.clone(),
        )))
        .with_reconciler(Arc::new(RouteReconciler::new(
            tunnels,
            routes,
            config.tunnel.clone(),
            config.route.blackhole_cidr,
        )))
        .with_reconciler(Arc::new(RuleReconciler::new(rules)));

    if config.proxy.enabled {
        manager = manager.with_reconciler(Arc::new(LoadBalancerReconciler::new(
            IpvsSynchronizer::new(CommandIpvs::new()),
            &config.paths.services_conf,
        )));
    }
    manager
}

/// Starts prefix propagation when enabled.
pub async fn spawn_propagation(
    config: &AgentConfig,
    cancel: CancellationToken,
) -> Result<Option<JoinHandle<()>>> {
    let section = &config.propagation;
    if !section.enabled {
        return Ok(None);
    }

    let table = Arc::new(IpRouteTable::new());
    let discovery = Arc::new(CniRouter::new(
        config.route.cni,
        Arc::clone(&table),
        config.route.table,
    ));
    let membership = UdpMembership::bind(&section.to_membership_config()).await?;
    info!(addr = %membership.local_addr()?, node = %section.node, "prefix propagation enabled");

    let (_receiver, events) = membership.spawn_receiver(cancel.child_token());
    let propagator =
        PrefixPropagator::new(section.to_propagation_config(), discovery, table, membership);

    Ok(Some(tokio::spawn(async move {
        propagator.run(events, cancel).await;
    })))
}
