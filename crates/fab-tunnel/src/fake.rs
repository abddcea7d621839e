//! In-memory IPsec daemon for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::daemon::{ActiveSa, ConnectionDescriptor, DaemonStats, IpsecDaemon};
use crate::error::{Result, TunnelError};

#[derive(Debug, Default)]
struct FakeState {
    conns: BTreeMap<String, ConnectionDescriptor>,
    sas: BTreeMap<String, ActiveSa>,
    failing: HashSet<&'static str>,
    load_calls: usize,
    unload_calls: usize,
    initiate_calls: usize,
    terminate_calls: usize,
}

/// A fake daemon that keeps connections and SAs in memory.
///
/// Loading a connection does not establish it; call
/// [`FakeIpsecDaemon::establish`] or `initiate` to create SAs.
#[derive(Debug, Clone, Default)]
pub struct FakeIpsecDaemon {
    state: Arc<Mutex<FakeState>>,
}

impl FakeIpsecDaemon {
    /// Creates an empty fake daemon.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `command` fail.
    pub fn fail_command(&self, command: &'static str) {
        self.state.lock().failing.insert(command);
    }

    /// Stops failing `command`.
    pub fn heal_command(&self, command: &'static str) {
        self.state.lock().failing.remove(command);
    }

    /// Establishes an IKE SA with the given children.
    pub fn establish(&self, ike: &str, children: &[&str]) {
        self.state.lock().sas.insert(
            ike.to_string(),
            ActiveSa {
                ike: ike.to_string(),
                state: "ESTABLISHED".to_string(),
                children: children.iter().map(ToString::to_string).collect(),
            },
        );
    }

    /// Returns a loaded connection.
    #[must_use]
    pub fn connection(&self, name: &str) -> Option<ConnectionDescriptor> {
        self.state.lock().conns.get(name).cloned()
    }

    /// Names of all loaded connections.
    #[must_use]
    pub fn connection_names(&self) -> Vec<String> {
        self.state.lock().conns.keys().cloned().collect()
    }

    /// Number of `load-conn` calls.
    #[must_use]
    pub fn load_calls(&self) -> usize {
        self.state.lock().load_calls
    }

    /// Number of `unload-conn` calls.
    #[must_use]
    pub fn unload_calls(&self) -> usize {
        self.state.lock().unload_calls
    }

    /// Number of `initiate` calls.
    #[must_use]
    pub fn initiate_calls(&self) -> usize {
        self.state.lock().initiate_calls
    }

    /// Number of `terminate` calls.
    #[must_use]
    pub fn terminate_calls(&self) -> usize {
        self.state.lock().terminate_calls
    }

    fn check(state: &FakeState, command: &'static str) -> Result<()> {
        if state.failing.contains(command) {
            return Err(TunnelError::CommandFailed {
                command: command.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl IpsecDaemon for FakeIpsecDaemon {
    async fn get_conns(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        Self::check(&state, "get-conns")?;
        Ok(state.conns.keys().cloned().collect())
    }

    async fn list_conns(&self, name: Option<&str>) -> Result<Vec<ConnectionDescriptor>> {
        let state = self.state.lock();
        Self::check(&state, "list-conns")?;
        Ok(state
            .conns
            .values()
            .filter(|c| name.is_none_or(|n| c.name == n))
            .map(|c| ConnectionDescriptor {
                local_certs: Vec::new(),
                ..c.clone()
            })
            .collect())
    }

    async fn load_conn(&self, conn: &ConnectionDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        state.load_calls += 1;
        Self::check(&state, "load-conn")?;
        state.conns.insert(conn.name.clone(), conn.clone());
        Ok(())
    }

    async fn unload_conn(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.unload_calls += 1;
        Self::check(&state, "unload-conn")?;
        if state.conns.remove(name).is_none() {
            return Err(TunnelError::CommandFailed {
                command: "unload-conn".to_string(),
                message: format!("unloading connection '{name}' failed"),
            });
        }
        Ok(())
    }

    async fn initiate(&self, ike: &str, child: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.initiate_calls += 1;
        Self::check(&state, "initiate")?;
        if !state.conns.contains_key(ike) {
            return Err(TunnelError::UnknownConnection(ike.to_string()));
        }
        let sa = state.sas.entry(ike.to_string()).or_insert_with(|| ActiveSa {
            ike: ike.to_string(),
            state: "ESTABLISHED".to_string(),
            children: Vec::new(),
        });
        if !sa.children.iter().any(|c| c == child) {
            sa.children.push(child.to_string());
        }
        Ok(())
    }

    async fn terminate(&self, ike: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.terminate_calls += 1;
        Self::check(&state, "terminate")?;
        state.sas.remove(ike);
        Ok(())
    }

    async fn list_sas(&self, ike: Option<&str>) -> Result<Vec<ActiveSa>> {
        let state = self.state.lock();
        Self::check(&state, "list-sas")?;
        Ok(state
            .sas
            .values()
            .filter(|sa| ike.is_none_or(|n| sa.ike == n))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<DaemonStats> {
        let state = self.state.lock();
        Self::check(&state, "stats")?;
        Ok(DaemonStats {
            running_since: None,
            ike_sas_total: state.sas.len() as u64,
            ike_sas_half_open: 0,
        })
    }
}
