//! Idempotent tunnel connection broker.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::certs::load_certificates;
use crate::conn::{ConnConfig, are_subnets_identical};
use crate::daemon::{ConnectionDescriptor, DaemonStats, IpsecDaemon};
use crate::error::{Result, TunnelError};

/// Default directory holding certificate files.
pub const DEFAULT_CERTS_DIR: &str = "/etc/ipsec.d/certs";

/// Configuration for the tunnel manager.
#[derive(Debug, Clone)]
pub struct TunnelManagerConfig {
    /// Base directory for relative certificate paths.
    pub certs_dir: PathBuf,
}

impl Default for TunnelManagerConfig {
    fn default() -> Self {
        Self {
            certs_dir: PathBuf::from(DEFAULT_CERTS_DIR),
        }
    }
}

/// Loads, initiates and unloads tunnel connections on an IPsec daemon.
///
/// Every operation reads the daemon state first and only issues the commands
/// needed to reach the desired state. Errors are returned as they are; the
/// caller decides whether to retry.
pub struct TunnelManager<D> {
    daemon: D,
    config: TunnelManagerConfig,
}

impl<D: IpsecDaemon> TunnelManager<D> {
    /// Creates a manager on top of `daemon`.
    pub fn new(daemon: D, config: TunnelManagerConfig) -> Self {
        Self { daemon, config }
    }

    /// Returns the underlying daemon.
    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    /// Names of all loaded connections.
    pub async fn list_conn_names(&self) -> Result<Vec<String>> {
        self.daemon.get_conns().await
    }

    /// Loads `cfg` unless the daemon already has an identical connection.
    pub async fn load_conn(&self, cfg: &ConnConfig) -> Result<()> {
        let certs = load_certificates(&self.config.certs_dir, &cfg.local_certs)?;
        let desired = cfg.to_descriptor(certs);

        let current = self
            .daemon
            .list_conns(Some(&cfg.name))
            .await?
            .into_iter()
            .find(|c| c.name == cfg.name);

        if let Some(current) = current {
            if same_connection(&current, &desired) {
                debug!(conn = %cfg.name, "connection unchanged");
                return Ok(());
            }
            if let Err(e) = self.daemon.unload_conn(&cfg.name).await {
                warn!(conn = %cfg.name, error = %e, "failed to unload outdated connection");
            }
        }

        self.daemon.load_conn(&desired).await?;
        info!(conn = %cfg.name, children = desired.children.len(), "loaded connection");
        Ok(())
    }

    /// Initiates the children of `name` that have no active SA.
    pub async fn initiate_conn(&self, name: &str) -> Result<()> {
        let conn = self
            .daemon
            .list_conns(Some(name))
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TunnelError::UnknownConnection(name.to_string()))?;

        let active: HashSet<String> = self
            .daemon
            .list_sas(Some(name))
            .await?
            .into_iter()
            .filter(|sa| sa.ike == name)
            .flat_map(|sa| sa.children)
            .collect();

        for child in conn.children.iter().filter(|c| !active.contains(&c.name)) {
            self.daemon.initiate(name, &child.name).await?;
            info!(conn = %name, child = %child.name, "initiated child");
        }
        Ok(())
    }

    /// Unloads `name` and terminates its IKE SA.
    ///
    /// Both steps always run; the first error is returned.
    pub async fn unload_conn(&self, name: &str) -> Result<()> {
        let unloaded = self.daemon.unload_conn(name).await;
        let terminated = self.daemon.terminate(name).await;
        if unloaded.is_ok() && terminated.is_ok() {
            info!(conn = %name, "unloaded connection");
        }
        unloaded.and(terminated)
    }

    /// Returns true if the daemon has at least one IKE SA.
    pub async fn is_active(&self) -> Result<bool> {
        Ok(!self.daemon.list_sas(None).await?.is_empty())
    }

    /// Daemon counters.
    pub async fn stats(&self) -> Result<DaemonStats> {
        self.daemon.stats().await
    }
}

/// Compares addresses and per-child traffic selectors.
fn same_connection(current: &ConnectionDescriptor, desired: &ConnectionDescriptor) -> bool {
    if !are_subnets_identical(&current.local_addrs, &desired.local_addrs)
        || !are_subnets_identical(&current.remote_addrs, &desired.remote_addrs)
    {
        return false;
    }

    if current.children.len() != desired.children.len() {
        return false;
    }

    let current_children: HashMap<&str, _> = current
        .children
        .iter()
        .map(|c| (c.name.as_str(), c))
        .collect();

    desired.children.iter().all(|want| {
        current_children.get(want.name.as_str()).is_some_and(|have| {
            are_subnets_identical(&have.local_ts, &want.local_ts)
                && are_subnets_identical(&have.remote_ts, &want.remote_ts)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeIpsecDaemon;
    use fab_endpoint::{Endpoint, EndpointType};

    fn manager() -> TunnelManager<FakeIpsecDaemon> {
        TunnelManager::new(FakeIpsecDaemon::new(), TunnelManagerConfig::default())
    }

    fn cfg(remote_subnet: &str) -> ConnConfig {
        let local = Endpoint::new("CN=edge1", "edge1", EndpointType::EdgeNode)
            .with_public_address("192.168.0.1")
            .with_subnet("10.1.0.0/24")
            .with_node_subnet("192.168.0.1");
        let remote = Endpoint::new("CN=cloud", "cloud", EndpointType::Connector)
            .with_public_address("192.168.0.100")
            .with_subnet(remote_subnet)
            .with_node_subnet("192.168.0.100/32");
        ConnConfig::new(&local, &remote)
    }

    // ==================== LOAD TESTS ====================

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let manager = manager();
        manager.load_conn(&cfg("10.2.0.0/16")).await.expect("first load");
        manager.load_conn(&cfg("10.2.0.0/16")).await.expect("second load");

        assert_eq!(manager.daemon().load_calls(), 1);
        assert_eq!(manager.daemon().unload_calls(), 0);
    }

    #[tokio::test]
    async fn test_host_address_equals_host_cidr() {
        let manager = manager();
        let mut first = cfg("10.2.0.0/16");
        first.remote_node_subnets = vec!["192.168.0.100/32".to_string()];
        manager.load_conn(&first).await.expect("load");

        let mut second = first.clone();
        second.remote_node_subnets = vec!["192.168.0.100".to_string()];
        manager.load_conn(&second).await.expect("reload");

        assert_eq!(manager.daemon().load_calls(), 1);
    }

    #[tokio::test]
    async fn test_changed_subnets_reload() {
        let manager = manager();
        manager.load_conn(&cfg("10.2.0.0/16")).await.expect("load");
        manager.load_conn(&cfg("10.3.0.0/16")).await.expect("reload");

        assert_eq!(manager.daemon().load_calls(), 2);
        assert_eq!(manager.daemon().unload_calls(), 1);
        let conn = manager.daemon().connection("cloud").expect("loaded");
        assert_eq!(conn.children[0].remote_ts, vec!["10.3.0.0/16"]);
    }

    #[tokio::test]
    async fn test_failed_unload_does_not_block_reload() {
        let manager = manager();
        manager.load_conn(&cfg("10.2.0.0/16")).await.expect("load");
        manager.daemon().fail_command("unload-conn");

        manager.load_conn(&cfg("10.3.0.0/16")).await.expect("reload");
        assert_eq!(manager.daemon().load_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_certificate_fails_before_daemon() {
        let manager = manager();
        let cfg = cfg("10.2.0.0/16").with_certs(vec!["/nonexistent/edge1.pem".to_string()]);

        let result = manager.load_conn(&cfg).await;
        assert!(matches!(result, Err(TunnelError::Certificate { .. })));
        assert_eq!(manager.daemon().load_calls(), 0);
    }

    // ==================== INITIATE TESTS ====================

    #[tokio::test]
    async fn test_initiate_only_missing_children() {
        let manager = manager();
        manager.load_conn(&cfg("10.2.0.0/16")).await.expect("load");
        manager.daemon().establish("cloud", &["cloud-p2p"]);

        manager.initiate_conn("cloud").await.expect("initiate");
        assert_eq!(manager.daemon().initiate_calls(), 2);

        manager.initiate_conn("cloud").await.expect("initiate again");
        assert_eq!(manager.daemon().initiate_calls(), 2);
    }

    #[tokio::test]
    async fn test_initiate_unknown_connection() {
        let result = manager().initiate_conn("nobody").await;
        assert!(matches!(result, Err(TunnelError::UnknownConnection(_))));
    }

    // ==================== UNLOAD TESTS ====================

    #[tokio::test]
    async fn test_unload_always_terminates() {
        let manager = manager();
        manager.daemon().establish("cloud", &["cloud-p2p"]);

        let result = manager.unload_conn("cloud").await;
        assert!(matches!(result, Err(TunnelError::CommandFailed { .. })));
        assert_eq!(manager.daemon().terminate_calls(), 1);
        assert!(!manager.is_active().await.expect("active"));
    }

    #[tokio::test]
    async fn test_unload_loaded_connection() {
        let manager = manager();
        manager.load_conn(&cfg("10.2.0.0/16")).await.expect("load");

        manager.unload_conn("cloud").await.expect("unload");
        assert!(manager.list_conn_names().await.expect("names").is_empty());
    }

    #[tokio::test]
    async fn test_is_active_tracks_sas() {
        let manager = manager();
        assert!(!manager.is_active().await.expect("active"));
        manager.daemon().establish("cloud", &[]);
        assert!(manager.is_active().await.expect("active"));
    }
}
