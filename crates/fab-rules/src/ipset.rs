//! ipset access.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::Command;
use tracing::trace;

use crate::error::{Result, RuleError};
use crate::family::IpFamily;

/// Named `hash:net` sets.
pub trait IpSet: Send + Sync {
    /// Creates the set if it does not exist.
    fn ensure_set(&self, name: &str, family: IpFamily) -> impl Future<Output = Result<()>> + Send;

    /// Current members of the set, as printed by the kernel.
    fn list_entries(&self, name: &str) -> impl Future<Output = Result<BTreeSet<String>>> + Send;

    /// Adds a member.
    fn add_entry(&self, name: &str, entry: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes a member.
    fn del_entry(&self, name: &str, entry: &str) -> impl Future<Output = Result<()>> + Send;
}

/// [`IpSet`] over the `ipset` command.
#[derive(Debug, Clone, Default)]
pub struct CommandIpSet;

impl CommandIpSet {
    /// Creates a handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[&str]) -> Result<String> {
        trace!(args = ?args, "ipset");
        let output = Command::new("ipset").args(args).output().await?;
        if !output.status.success() {
            return Err(RuleError::Command {
                program: "ipset".to_string(),
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Extracts members of `name` from `ipset save` output.
pub(crate) fn parse_save(name: &str, output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("add"), Some(set), Some(entry)) if set == name => Some(entry.to_string()),
                _ => None,
            }
        })
        .collect()
}

impl IpSet for CommandIpSet {
    async fn ensure_set(&self, name: &str, family: IpFamily) -> Result<()> {
        Self::run(&["create", name, "hash:net", "family", family.ipset_family(), "-exist"]).await?;
        Ok(())
    }

    async fn list_entries(&self, name: &str) -> Result<BTreeSet<String>> {
        let output = Self::run(&["save", name]).await?;
        Ok(parse_save(name, &output))
    }

    async fn add_entry(&self, name: &str, entry: &str) -> Result<()> {
        Self::run(&["add", name, entry, "-exist"]).await?;
        Ok(())
    }

    async fn del_entry(&self, name: &str, entry: &str) -> Result<()> {
        Self::run(&["del", name, entry, "-exist"]).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeIpSetState {
    sets: HashMap<String, BTreeSet<String>>,
    ensure_calls: usize,
    add_calls: usize,
    del_calls: usize,
}

/// In-memory [`IpSet`] with call counters.
#[derive(Debug, Clone, Default)]
pub struct FakeIpSet {
    state: Arc<Mutex<FakeIpSetState>>,
}

impl FakeIpSet {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates a set.
    pub fn seed(&self, name: &str, entries: &[&str]) {
        self.state.lock().sets.insert(
            name.to_string(),
            entries.iter().map(ToString::to_string).collect(),
        );
    }

    /// Members of a set.
    #[must_use]
    pub fn entries(&self, name: &str) -> BTreeSet<String> {
        self.state.lock().sets.get(name).cloned().unwrap_or_default()
    }

    /// Number of `ensure_set` calls.
    #[must_use]
    pub fn ensure_calls(&self) -> usize {
        self.state.lock().ensure_calls
    }

    /// Number of `add_entry` calls.
    #[must_use]
    pub fn add_calls(&self) -> usize {
        self.state.lock().add_calls
    }

    /// Number of `del_entry` calls.
    #[must_use]
    pub fn del_calls(&self) -> usize {
        self.state.lock().del_calls
    }
}

impl IpSet for FakeIpSet {
    async fn ensure_set(&self, name: &str, _family: IpFamily) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_calls += 1;
        state.sets.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn list_entries(&self, name: &str) -> Result<BTreeSet<String>> {
        Ok(self.entries(name))
    }

    async fn add_entry(&self, name: &str, entry: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.add_calls += 1;
        state
            .sets
            .entry(name.to_string())
            .or_default()
            .insert(entry.to_string());
        Ok(())
    }

    async fn del_entry(&self, name: &str, entry: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.del_calls += 1;
        if let Some(set) = state.sets.get_mut(name) {
            set.remove(entry);
        }
        Ok(())
    }
}
