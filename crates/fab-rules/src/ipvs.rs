//! IPVS load balancer synchronization.
//!
//! Virtual servers come from a YAML services file and are converged against
//! the kernel table as printed by `ipvsadm -S -n`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, trace};

use crate::error::{Result, RuleError};

/// Transport protocol of a virtual server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP.
    #[serde(alias = "tcp")]
    Tcp,
    /// UDP.
    #[serde(alias = "udp")]
    Udp,
}

impl Protocol {
    fn flag(self) -> &'static str {
        match self {
            Self::Tcp => "-t",
            Self::Udp => "-u",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

fn default_scheduler() -> String {
    "rr".to_string()
}

fn default_weight() -> u32 {
    1
}

/// A backend of a virtual server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealServer {
    /// Backend address.
    pub ip: IpAddr,
    /// Backend port.
    pub port: u16,
    /// Scheduling weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl RealServer {
    /// Socket address of the backend.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// A load balanced service address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServer {
    /// Service address.
    pub ip: IpAddr,
    /// Service port.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// IPVS scheduler name.
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// Backends.
    #[serde(default)]
    pub real_servers: Vec<RealServer>,
}

/// Identity of a virtual server.
pub type ServiceKey = (Protocol, SocketAddr);

impl VirtualServer {
    /// Socket address of the service.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Identity used for diffing.
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        (self.protocol, self.addr())
    }
}

/// Reads the services file. An empty file means no services.
pub fn load_services(path: impl AsRef<Path>) -> Result<Vec<VirtualServer>> {
    let path = path.as_ref();
    let config_error = |reason: String| RuleError::ServicesConfig {
        path: path.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&content).map_err(|e| config_error(e.to_string()))
}

/// Kernel IPVS table operations.
pub trait Ipvs: Send + Sync {
    /// Every virtual server with its backends.
    fn list(&self) -> impl Future<Output = Result<Vec<VirtualServer>>> + Send;

    /// Adds a virtual server without backends.
    fn add_virtual(&self, vs: &VirtualServer) -> impl Future<Output = Result<()>> + Send;

    /// Updates the scheduler of a virtual server.
    fn update_virtual(&self, vs: &VirtualServer) -> impl Future<Output = Result<()>> + Send;

    /// Deletes a virtual server and its backends.
    fn delete_virtual(&self, vs: &VirtualServer) -> impl Future<Output = Result<()>> + Send;

    /// Adds a backend.
    fn add_real(
        &self,
        vs: &VirtualServer,
        rs: &RealServer,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Updates the weight of a backend.
    fn update_real(
        &self,
        vs: &VirtualServer,
        rs: &RealServer,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Deletes a backend.
    fn delete_real(
        &self,
        vs: &VirtualServer,
        rs: &RealServer,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Parses `ipvsadm -S -n` output.
pub fn parse_ipvsadm_save(output: &str) -> Result<Vec<VirtualServer>> {
    let unexpected = |line: &str| RuleError::UnexpectedOutput {
        program: "ipvsadm".to_string(),
        reason: format!("cannot parse '{line}'"),
    };

    let mut services: Vec<VirtualServer> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let value = |flag: &str| {
            tokens
                .iter()
                .position(|t| *t == flag)
                .and_then(|i| tokens.get(i + 1).copied())
        };
        let (protocol, service) = match (value("-t"), value("-u")) {
            (Some(addr), _) => (Protocol::Tcp, addr),
            (None, Some(addr)) => (Protocol::Udp, addr),
            _ => return Err(unexpected(line)),
        };
        let service: SocketAddr = service.parse().map_err(|_| unexpected(line))?;

        match tokens.first().copied() {
            Some("-A") => services.push(VirtualServer {
                ip: service.ip(),
                port: service.port(),
                protocol,
                scheduler: value("-s").unwrap_or("wlc").to_string(),
                real_servers: Vec::new(),
            }),
            Some("-a") => {
                let real: SocketAddr = value("-r")
                    .and_then(|r| r.parse().ok())
                    .ok_or_else(|| unexpected(line))?;
                let weight = value("-w").and_then(|w| w.parse().ok()).unwrap_or(1);
                let vs = services
                    .iter_mut()
                    .find(|vs| vs.key() == (protocol, service))
                    .ok_or_else(|| unexpected(line))?;
                vs.real_servers.push(RealServer {
                    ip: real.ip(),
                    port: real.port(),
                    weight,
                });
            }
            _ => return Err(unexpected(line)),
        }
    }
    Ok(services)
}

/// [`Ipvs`] over the `ipvsadm` command.
#[derive(Debug, Clone, Default)]
pub struct CommandIpvs;

impl CommandIpvs {
    /// Creates a handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn run(args: Vec<String>) -> Result<String> {
        trace!(args = ?args, "ipvsadm");
        let output = Command::new("ipvsadm").args(&args).output().await?;
        if !output.status.success() {
            return Err(RuleError::Command {
                program: "ipvsadm".to_string(),
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn service_args(verb: &str, vs: &VirtualServer) -> Vec<String> {
        vec![
            verb.to_string(),
            vs.protocol.flag().to_string(),
            vs.addr().to_string(),
        ]
    }

    fn real_args(verb: &str, vs: &VirtualServer, rs: &RealServer) -> Vec<String> {
        let mut args = Self::service_args(verb, vs);
        args.push("-r".to_string());
        args.push(rs.addr().to_string());
        args
    }
}

impl Ipvs for CommandIpvs {
    async fn list(&self) -> Result<Vec<VirtualServer>> {
        parse_ipvsadm_save(&Self::run(vec!["-S".to_string(), "-n".to_string()]).await?)
    }

    async fn add_virtual(&self, vs: &VirtualServer) -> Result<()> {
        let mut args = Self::service_args("-A", vs);
        args.extend(["-s".to_string(), vs.scheduler.clone()]);
        Self::run(args).await.map(drop)
    }

    async fn update_virtual(&self, vs: &VirtualServer) -> Result<()> {
        let mut args = Self::service_args("-E", vs);
        args.extend(["-s".to_string(), vs.scheduler.clone()]);
        Self::run(args).await.map(drop)
    }

    async fn delete_virtual(&self, vs: &VirtualServer) -> Result<()> {
        Self::run(Self::service_args("-D", vs)).await.map(drop)
    }

    async fn add_real(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let mut args = Self::real_args("-a", vs, rs);
        args.extend(["-m".to_string(), "-w".to_string(), rs.weight.to_string()]);
        Self::run(args).await.map(drop)
    }

    async fn update_real(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let mut args = Self::real_args("-e", vs, rs);
        args.extend(["-m".to_string(), "-w".to_string(), rs.weight.to_string()]);
        Self::run(args).await.map(drop)
    }

    async fn delete_real(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        Self::run(Self::real_args("-d", vs, rs)).await.map(drop)
    }
}

/// Converges the kernel IPVS table to a list of virtual servers.
pub struct IpvsSynchronizer<V> {
    ipvs: V,
}

impl<V: Ipvs> IpvsSynchronizer<V> {
    /// Creates a synchronizer.
    pub fn new(ipvs: V) -> Self {
        Self { ipvs }
    }

    /// Returns the underlying IPVS handle.
    pub fn ipvs(&self) -> &V {
        &self.ipvs
    }

    /// Applies the difference between `desired` and the kernel table.
    pub async fn sync(&self, desired: &[VirtualServer]) -> Result<()> {
        let current: HashMap<ServiceKey, VirtualServer> = self
            .ipvs
            .list()
            .await?
            .into_iter()
            .map(|vs| (vs.key(), vs))
            .collect();
        let wanted: HashMap<ServiceKey, &VirtualServer> =
            desired.iter().map(|vs| (vs.key(), vs)).collect();

        for (key, vs) in &current {
            if !wanted.contains_key(key) {
                self.ipvs.delete_virtual(vs).await?;
                info!(service = %vs.addr(), protocol = %vs.protocol, "removed virtual server");
            }
        }

        for vs in desired {
            match current.get(&vs.key()) {
                None => {
                    self.ipvs.add_virtual(vs).await?;
                    for rs in &vs.real_servers {
                        self.ipvs.add_real(vs, rs).await?;
                    }
                    info!(service = %vs.addr(), protocol = %vs.protocol, "added virtual server");
                }
                Some(existing) => {
                    if existing.scheduler != vs.scheduler {
                        self.ipvs.update_virtual(vs).await?;
                    }
                    self.sync_real_servers(existing, vs).await?;
                }
            }
        }
        Ok(())
    }

    async fn sync_real_servers(&self, existing: &VirtualServer, vs: &VirtualServer) -> Result<()> {
        let have: HashMap<SocketAddr, &RealServer> =
            existing.real_servers.iter().map(|rs| (rs.addr(), rs)).collect();
        let want: HashMap<SocketAddr, &RealServer> =
            vs.real_servers.iter().map(|rs| (rs.addr(), rs)).collect();

        for (addr, rs) in &have {
            if !want.contains_key(addr) {
                self.ipvs.delete_real(vs, rs).await?;
            }
        }
        for rs in &vs.real_servers {
            match have.get(&rs.addr()) {
                None => self.ipvs.add_real(vs, rs).await?,
                Some(current) if current.weight != rs.weight => {
                    self.ipvs.update_real(vs, rs).await?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeIpvsState {
    services: BTreeMap<ServiceKey, VirtualServer>,
    calls: usize,
}

/// In-memory [`Ipvs`] for tests.
#[derive(Debug, Clone, Default)]
pub struct FakeIpvs {
    state: Arc<Mutex<FakeIpvsState>>,
}

impl FakeIpvs {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Current table.
    #[must_use]
    pub fn services(&self) -> Vec<VirtualServer> {
        self.state.lock().services.values().cloned().collect()
    }

    fn with_service<F>(&self, vs: &VirtualServer, f: F) -> Result<()>
    where
        F: FnOnce(&mut VirtualServer),
    {
        let mut state = self.state.lock();
        state.calls += 1;
        let service = state
            .services
            .get_mut(&vs.key())
            .ok_or_else(|| RuleError::Command {
                program: "ipvsadm".to_string(),
                args: vs.addr().to_string(),
                stderr: "Service not defined".to_string(),
            })?;
        f(service);
        Ok(())
    }
}

impl Ipvs for FakeIpvs {
    async fn list(&self) -> Result<Vec<VirtualServer>> {
        Ok(self.services())
    }

    async fn add_virtual(&self, vs: &VirtualServer) -> Result<()> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.services.insert(
            vs.key(),
            VirtualServer {
                real_servers: Vec::new(),
                ..vs.clone()
            },
        );
        Ok(())
    }

    async fn update_virtual(&self, vs: &VirtualServer) -> Result<()> {
        self.with_service(vs, |s| s.scheduler.clone_from(&vs.scheduler))
    }

    async fn delete_virtual(&self, vs: &VirtualServer) -> Result<()> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.services.remove(&vs.key());
        Ok(())
    }

    async fn add_real(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        self.with_service(vs, |s| s.real_servers.push(rs.clone()))
    }

    async fn update_real(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        self.with_service(vs, |s| {
            for current in s.real_servers.iter_mut().filter(|r| r.addr() == rs.addr()) {
                current.weight = rs.weight;
            }
        })
    }

    async fn delete_real(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        self.with_service(vs, |s| s.real_servers.retain(|r| r.addr() != rs.addr()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICES: &str = "\
- ip: 10.96.0.10
  port: 53
  protocol: UDP
  realServers:
    - ip: 10.233.0.5
      port: 53
- ip: 10.96.0.1
  port: 443
  protocol: TCP
  scheduler: wrr
  realServers:
    - ip: 192.168.0.10
      port: 6443
      weight: 2
";

    fn services() -> Vec<VirtualServer> {
        serde_yaml::from_str(SERVICES).expect("yaml")
    }

    #[test]
    fn test_services_yaml_defaults() {
        let services = services();
        assert_eq!(services[0].protocol, Protocol::Udp);
        assert_eq!(services[0].scheduler, "rr");
        assert_eq!(services[0].real_servers[0].weight, 1);
        assert_eq!(services[1].real_servers[0].weight, 2);
    }

    #[test]
    fn test_load_services_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("services.yaml");
        std::fs::write(&path, SERVICES).expect("write");
        assert_eq!(load_services(&path).expect("load").len(), 2);

        std::fs::write(&path, "\n").expect("write");
        assert!(load_services(&path).expect("load").is_empty());

        std::fs::write(&path, "- ip: nope").expect("write");
        assert!(matches!(load_services(&path), Err(RuleError::ServicesConfig { .. })));
    }

    #[test]
    fn test_parse_ipvsadm_save() {
        let output = "\
-A -t 10.96.0.1:443 -s rr
-a -t 10.96.0.1:443 -r 192.168.0.10:6443 -m -w 1
-a -t 10.96.0.1:443 -r 192.168.0.11:6443 -m -w 3
-A -u [fd00::a]:53 -s wrr
";
        let parsed = parse_ipvsadm_save(output).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].real_servers.len(), 2);
        assert_eq!(parsed[0].real_servers[1].weight, 3);
        assert_eq!(parsed[1].protocol, Protocol::Udp);
        assert_eq!(parsed[1].ip, "fd00::a".parse::<IpAddr>().expect("ip"));
    }

    #[test]
    fn test_parse_rejects_orphan_real_server() {
        let output = "-a -t 10.96.0.1:443 -r 192.168.0.10:6443 -m -w 1\n";
        assert!(matches!(
            parse_ipvsadm_save(output),
            Err(RuleError::UnexpectedOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_converges_and_is_idempotent() {
        let sync = IpvsSynchronizer::new(FakeIpvs::new());
        let desired = services();

        sync.sync(&desired).await.expect("sync");
        let mut current = sync.ipvs().services();
        current.sort_by_key(VirtualServer::key);
        let mut expected = desired.clone();
        expected.sort_by_key(VirtualServer::key);
        assert_eq!(current, expected);

        let calls = sync.ipvs().calls();
        sync.sync(&desired).await.expect("resync");
        assert_eq!(sync.ipvs().calls(), calls);
    }

    #[tokio::test]
    async fn test_sync_updates_and_removes() {
        let sync = IpvsSynchronizer::new(FakeIpvs::new());
        sync.sync(&services()).await.expect("sync");

        let mut desired = services();
        desired.remove(0);
        desired[0].scheduler = "rr".to_string();
        desired[0].real_servers[0].weight = 5;
        desired[0].real_servers.push(RealServer {
            ip: "192.168.0.11".parse().expect("ip"),
            port: 6443,
            weight: 1,
        });

        sync.sync(&desired).await.expect("sync");
        assert_eq!(sync.ipvs().services(), desired);
    }
}
