//! Per-resource reconcilers.
//!
//! Each reconciler derives its desired state from one [`Snapshot`] and hands
//! it to its synchronizer. The control loop treats them uniformly through the
//! object-safe [`Reconciler`] trait.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use fab_endpoint::{EndpointType, Snapshot};
use fab_route::{RouteSynchronizer, RouteTable};
use fab_rules::{DesiredRules, IpSet, IpTables, Ipvs, IpvsSynchronizer, RuleSynchronizer};
use fab_tunnel::{ConnConfig, IpsecDaemon, TunnelManager};
use ipnet::IpNet;
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::error::{AgentError, Result};

/// Boxed future returned by [`Reconciler::reconcile`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One kind of node state converged by the control loop.
pub trait Reconciler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Converges the resource to `snapshot`.
    fn reconcile<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<()>>;
}

/// Computes the tunnel connections of a snapshot.
///
/// One connection per peer. With mediation enabled and a mediator known, a
/// separate mediation connection comes first and edge to edge connections go
/// through it. The mediator keeps its regular connection when it is also a
/// peer.
pub fn plan_connections(snapshot: &Snapshot, config: &TunnelConfig) -> Vec<ConnConfig> {
    let local = &snapshot.endpoint;
    let mut conns = Vec::with_capacity(snapshot.peers.len() + 1);

    let mediation = snapshot
        .mediator
        .as_ref()
        .filter(|_| config.enable_mediation)
        .map(|mediator| {
            ConnConfig::new(local, mediator)
                .with_certs(config.local_certs.clone())
                .as_mediation()
        });
    let mediation_name = mediation.as_ref().map(|c| c.name.clone());
    conns.extend(mediation);

    for peer in &snapshot.peers {
        let conn = ConnConfig::new(local, peer).with_certs(config.local_certs.clone());
        let mediated = local.endpoint_type == EndpointType::EdgeNode
            && peer.endpoint_type == EndpointType::EdgeNode;
        conns.push(match &mediation_name {
            Some(name) if mediated => conn.via_mediator(name.clone()),
            _ => conn,
        });
    }
    conns
}

/// Loads, initiates and prunes tunnel connections.
pub struct TunnelReconciler<D> {
    tunnels: Arc<TunnelManager<D>>,
    config: TunnelConfig,
}

impl<D: IpsecDaemon + 'static> TunnelReconciler<D> {
    /// Creates a reconciler.
    pub fn new(tunnels: Arc<TunnelManager<D>>, config: TunnelConfig) -> Self {
        Self { tunnels, config }
    }

    async fn sync(&self, snapshot: &Snapshot) -> Result<()> {
        let desired = plan_connections(snapshot, &self.config);
        let wanted: HashSet<&str> = desired.iter().map(|c| c.name.as_str()).collect();

        let mut failures = Vec::new();
        for name in self.tunnels.list_conn_names().await? {
            if wanted.contains(name.as_str()) {
                continue;
            }
            match self.tunnels.unload_conn(&name).await {
                Ok(()) => info!(conn = %name, "removed stale connection"),
                Err(e) => {
                    warn!(conn = %name, error = %e, "failed to remove stale connection");
                    failures.push(e);
                }
            }
        }

        for conn in &desired {
            let mut result = self.tunnels.load_conn(conn).await;
            if result.is_ok() && !conn.mediation {
                result = self.tunnels.initiate_conn(&conn.name).await;
            }
            if let Err(e) = result {
                warn!(conn = %conn.name, error = %e, "failed to sync connection");
                failures.push(e);
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(AgentError::Connections {
                failed,
                total: desired.len(),
                first,
            }),
        }
    }
}

impl<D: IpsecDaemon + 'static> Reconciler for TunnelReconciler<D> {
    fn name(&self) -> &'static str {
        "tunnels"
    }

    fn reconcile<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.sync(snapshot))
    }
}

/// Keeps peer routes in line with tunnel liveness.
///
/// While at least one SA is up, the dedicated table gets one route per peer
/// subnet and the aggregate blackhole is removed. Otherwise peer routes are
/// withdrawn, the blackhole is installed and the attempt fails so that it is
/// retried.
pub struct RouteReconciler<D, T> {
    tunnels: Arc<TunnelManager<D>>,
    routes: RouteSynchronizer<T>,
    config: TunnelConfig,
    blackhole: Option<IpNet>,
}

impl<D, T> RouteReconciler<D, T>
where
    D: IpsecDaemon + 'static,
    T: RouteTable + 'static,
{
    /// Creates a reconciler.
    pub fn new(
        tunnels: Arc<TunnelManager<D>>,
        routes: RouteSynchronizer<T>,
        config: TunnelConfig,
        blackhole: Option<IpNet>,
    ) -> Self {
        Self {
            tunnels,
            routes,
            config,
            blackhole,
        }
    }

    async fn sync(&self, snapshot: &Snapshot) -> Result<()> {
        let conns: Vec<ConnConfig> = plan_connections(snapshot, &self.config)
            .into_iter()
            .filter(|c| !c.mediation)
            .collect();

        if conns.is_empty() || self.tunnels.is_active().await? {
            self.routes.sync_routes(&conns).await?;
            if let Some(cidr) = &self.blackhole {
                self.routes.remove_blackhole(&cidr.to_string()).await?;
            }
            return Ok(());
        }

        if let Some(cidr) = &self.blackhole {
            self.routes.ensure_blackhole(&cidr.to_string()).await?;
        }
        self.routes.clean_routes(&conns).await?;
        Err(AgentError::TunnelsInactive)
    }
}

impl<D, T> Reconciler for RouteReconciler<D, T>
where
    D: IpsecDaemon + 'static,
    T: RouteTable + 'static,
{
    fn name(&self) -> &'static str {
        "routes"
    }

    fn reconcile<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.sync(snapshot))
    }
}

/// Applies firewall rules and peer sets.
pub struct RuleReconciler<I, S> {
    rules: RuleSynchronizer<I, S>,
}

impl<I, S> RuleReconciler<I, S>
where
    I: IpTables + 'static,
    S: IpSet + 'static,
{
    /// Creates a reconciler.
    pub fn new(rules: RuleSynchronizer<I, S>) -> Self {
        Self { rules }
    }
}

impl<I, S> Reconciler for RuleReconciler<I, S>
where
    I: IpTables + 'static,
    S: IpSet + 'static,
{
    fn name(&self) -> &'static str {
        "rules"
    }

    fn reconcile<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.rules.sync(&DesiredRules::from_snapshot(snapshot)).await?;
            Ok(())
        })
    }
}

/// Converges IPVS to the services file.
pub struct LoadBalancerReconciler<V> {
    ipvs: IpvsSynchronizer<V>,
    services: PathBuf,
}

impl<V: Ipvs + 'static> LoadBalancerReconciler<V> {
    /// Creates a reconciler reading `services` on every attempt.
    pub fn new(ipvs: IpvsSynchronizer<V>, services: impl Into<PathBuf>) -> Self {
        Self {
            ipvs,
            services: services.into(),
        }
    }
}

impl<V: Ipvs + 'static> Reconciler for LoadBalancerReconciler<V> {
    fn name(&self) -> &'static str {
        "load-balancer"
    }

    fn reconcile<'a>(&'a self, _snapshot: &'a Snapshot) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let services = fab_rules::load_services(&self.services)?;
            self.ipvs.sync(&services).await?;
            Ok(())
        })
    }
}
