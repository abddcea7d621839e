//! Agent configuration.
//!
//! Loaded once at startup from a TOML file. Every section is optional:
//!
//! ```toml
//! json_logs = false
//!
//! [paths]
//! network_conf = "/etc/fabedge/tunnels.yaml"
//!
//! [route]
//! cni = "calico"
//! blackhole_cidr = "10.233.64.0/18"
//!
//! [gossip]
//! enabled = true
//! token = "s3cret"
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fab_endpoint::GossipConfig;
use fab_route::{CniType, DEFAULT_TABLE, MAIN_TABLE, PropagationConfig, UdpMembershipConfig};
use fab_tunnel::TunnelManagerConfig;
use fab_tunnel::manager::DEFAULT_CERTS_DIR;
use fab_tunnel::vici::DEFAULT_SOCKET;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Upper bound for `gossip.ttl_secs`, one week.
pub const MAX_GOSSIP_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// File locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Topology file written by the operator.
    pub network_conf: PathBuf,
    /// IPVS services file, read when proxying is enabled.
    pub services_conf: PathBuf,
    /// Where discovered endpoints are backed up.
    pub local_endpoints: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            network_conf: PathBuf::from("/etc/fabedge/tunnels.yaml"),
            services_conf: PathBuf::from("/etc/fabedge/services.yaml"),
            local_endpoints: PathBuf::from("/var/lib/fabedge/local-endpoints.json"),
        }
    }
}

/// Control loop timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the self-healing trigger.
    pub period_secs: u64,
    /// Quiet period that ends a burst of triggers.
    pub debounce_secs: u64,
    /// Delay between failed attempts.
    pub retry_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            period_secs: 30,
            debounce_secs: 1,
            retry_delay_secs: 5,
        }
    }
}

impl SyncConfig {
    /// Period of the self-healing trigger.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Debounce quiet period.
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    /// Delay between failed attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// IPsec settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    /// VICI control socket of the IPsec daemon.
    pub vici_socket: PathBuf,
    /// Base directory of relative certificate paths.
    pub certs_dir: PathBuf,
    /// Certificates presented by this node.
    pub local_certs: Vec<String>,
    /// Connect edge nodes to each other through the mediator.
    pub enable_mediation: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            vici_socket: PathBuf::from(DEFAULT_SOCKET),
            certs_dir: PathBuf::from(DEFAULT_CERTS_DIR),
            local_certs: vec!["edgecert.pem".to_string()],
            enable_mediation: false,
        }
    }
}

/// Routing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouteConfig {
    /// Network plugin of the cluster.
    pub cni: CniType,
    /// Dedicated table for tunnel routes.
    pub table: u32,
    /// Aggregate pod CIDR blackholed while tunnels are down.
    pub blackhole_cidr: Option<IpNet>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            cni: CniType::Flannel,
            table: DEFAULT_TABLE,
            blackhole_cidr: None,
        }
    }
}

/// Multicast endpoint discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GossipSection {
    /// Enables discovery, purging and backups.
    pub enabled: bool,
    /// Multicast group and port.
    pub group: SocketAddrV4,
    /// Interface to join the group on.
    pub interface: Ipv4Addr,
    /// Shared token.
    pub token: String,
    /// Interval between announcements.
    pub interval_secs: u64,
    /// Lifetime of a discovered endpoint.
    pub ttl_secs: u64,
    /// Interval of the expiry sweep.
    pub purge_interval_secs: u64,
    /// Interval between backups of discovered endpoints.
    pub backup_interval_secs: u64,
}

impl Default for GossipSection {
    fn default() -> Self {
        let defaults = GossipConfig::default();
        Self {
            enabled: false,
            group: defaults.group,
            interface: defaults.interface,
            token: String::new(),
            interval_secs: defaults.interval.as_secs(),
            ttl_secs: defaults.ttl.num_seconds().unsigned_abs(),
            purge_interval_secs: 10,
            backup_interval_secs: 10,
        }
    }
}

impl GossipSection {
    /// Settings for the discovery loops.
    pub fn to_gossip_config(&self) -> GossipConfig {
        GossipConfig {
            group: self.group,
            interface: self.interface,
            token: self.token.clone(),
            interval: Duration::from_secs(self.interval_secs),
            ttl: self.ttl(),
        }
    }

    /// Lifetime of a discovered endpoint.
    pub fn ttl(&self) -> chrono::Duration {
        let secs = self.ttl_secs.min(MAX_GOSSIP_TTL_SECS);
        chrono::Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Prefix propagation between cloud nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PropagationSection {
    /// Enables propagation.
    pub enabled: bool,
    /// Name announced to siblings.
    pub node: String,
    /// Local membership address.
    pub bind: SocketAddr,
    /// Sibling membership addresses.
    pub seeds: Vec<SocketAddr>,
    /// Interval between announcements.
    pub interval_secs: u64,
    /// Silence after which a sibling is dropped.
    pub member_timeout_secs: u64,
    /// Table sibling routes are installed in.
    pub table: u32,
}

impl Default for PropagationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            node: String::new(),
            bind: SocketAddr::from(([0, 0, 0, 0], 18090)),
            seeds: Vec::new(),
            interval_secs: 5,
            member_timeout_secs: 30,
            table: MAIN_TABLE,
        }
    }
}

impl PropagationSection {
    /// Settings for the propagator.
    pub fn to_propagation_config(&self) -> PropagationConfig {
        PropagationConfig {
            node: self.node.clone(),
            interval: Duration::from_secs(self.interval_secs),
            table: self.table,
        }
    }

    /// Settings for the membership socket.
    pub fn to_membership_config(&self) -> UdpMembershipConfig {
        UdpMembershipConfig {
            node: self.node.clone(),
            bind: self.bind,
            seeds: self.seeds.clone(),
            member_timeout: Duration::from_secs(self.member_timeout_secs),
        }
    }
}

/// IPVS proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Enables the load balancer sync and the services file watch.
    pub enabled: bool,
}

/// Main agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Log as JSON lines.
    pub json_logs: bool,
    /// File locations.
    pub paths: PathsConfig,
    /// Control loop timing.
    pub sync: SyncConfig,
    /// IPsec settings.
    pub tunnel: TunnelConfig,
    /// Routing settings.
    pub route: RouteConfig,
    /// Endpoint discovery.
    pub gossip: GossipSection,
    /// Prefix propagation.
    pub propagation: PropagationSection,
    /// IPVS proxy.
    pub proxy: ProxyConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| AgentError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Settings for the tunnel manager.
    pub fn tunnel_manager_config(&self) -> TunnelManagerConfig {
        TunnelManagerConfig {
            certs_dir: self.tunnel.certs_dir.clone(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sync.period_secs", self.sync.period_secs),
            ("sync.debounce_secs", self.sync.debounce_secs),
            ("sync.retry_delay_secs", self.sync.retry_delay_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AgentError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.route.table == 0 || self.route.table == MAIN_TABLE {
            return Err(AgentError::Config(format!(
                "route.table {} is reserved",
                self.route.table
            )));
        }

        if self.gossip.enabled {
            if self.gossip.token.is_empty() {
                return Err(AgentError::Config(
                    "gossip.token cannot be empty when gossip is enabled".to_string(),
                ));
            }
            if !self.gossip.group.ip().is_multicast() {
                return Err(AgentError::Config(format!(
                    "gossip.group {} is not a multicast address",
                    self.gossip.group
                )));
            }
            if self.gossip.interval_secs == 0 || self.gossip.ttl_secs <= self.gossip.interval_secs
            {
                return Err(AgentError::Config(
                    "gossip.ttl_secs must exceed a non-zero gossip.interval_secs".to_string(),
                ));
            }
            if self.gossip.ttl_secs > MAX_GOSSIP_TTL_SECS {
                return Err(AgentError::Config(format!(
                    "gossip.ttl_secs cannot exceed {MAX_GOSSIP_TTL_SECS}"
                )));
            }
            if self.gossip.purge_interval_secs == 0 || self.gossip.backup_interval_secs == 0 {
                return Err(AgentError::Config(
                    "gossip purge and backup intervals must be greater than 0".to_string(),
                ));
            }
        }

        if self.propagation.enabled {
            if self.propagation.node.is_empty() {
                return Err(AgentError::Config(
                    "propagation.node cannot be empty when propagation is enabled".to_string(),
                ));
            }
            if self.propagation.interval_secs == 0 || self.propagation.member_timeout_secs == 0 {
                return Err(AgentError::Config(
                    "propagation intervals must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}
