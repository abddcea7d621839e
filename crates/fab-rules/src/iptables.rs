//! iptables access.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::Command;
use tracing::trace;

use crate::error::{Result, RuleError};
use crate::family::IpFamily;

/// iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// The filter table.
    Filter,
    /// The nat table.
    Nat,
}

impl Table {
    /// Name on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a rule spec from string slices.
#[must_use]
pub fn rule(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

/// Chain and rule operations of one address family.
pub trait IpTables: Send + Sync {
    /// Creates `chain` if it does not exist.
    fn ensure_chain(&self, table: Table, chain: &str) -> impl Future<Output = Result<()>> + Send;

    /// Creates `chain` if needed and flushes it.
    fn clear_chain(&self, table: Table, chain: &str) -> impl Future<Output = Result<()>> + Send;

    /// Checks whether `rule` is present in `chain`.
    fn exists(
        &self,
        table: Table,
        chain: &str,
        rule: &[String],
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Appends `rule` unless present.
    fn append_unique(
        &self,
        table: Table,
        chain: &str,
        rule: &[String],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Inserts `rule` at `position` (1-based) unless present.
    fn insert_unique(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        rule: &[String],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// [`IpTables`] over the `iptables`/`ip6tables` commands.
#[derive(Debug, Clone)]
pub struct CommandIpTables {
    family: IpFamily,
}

impl CommandIpTables {
    /// Creates a handle for `family`.
    #[must_use]
    pub fn new(family: IpFamily) -> Self {
        Self { family }
    }

    async fn run(&self, table: Table, args: Vec<String>) -> Result<std::process::Output> {
        let program = self.family.iptables_program();
        let mut full = vec!["-w".to_string(), "-t".to_string(), table.as_str().to_string()];
        full.extend(args);
        trace!(program, args = ?full, "running");
        let output = Command::new(program).args(&full).output().await?;
        Ok(output)
    }

    fn failure(&self, table: Table, args: &[String], output: &std::process::Output) -> RuleError {
        RuleError::Command {
            program: self.family.iptables_program().to_string(),
            args: format!("-t {table} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    async fn run_checked(&self, table: Table, args: Vec<String>) -> Result<()> {
        let output = self.run(table, args.clone()).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure(table, &args, &output))
        }
    }
}

impl IpTables for CommandIpTables {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        let args = rule(&["-N", chain]);
        let output = self.run(table, args.clone()).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("Chain already exists") {
            Ok(())
        } else {
            Err(self.failure(table, &args, &output))
        }
    }

    async fn clear_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.ensure_chain(table, chain).await?;
        self.run_checked(table, rule(&["-F", chain])).await
    }

    async fn exists(&self, table: Table, chain: &str, spec: &[String]) -> Result<bool> {
        let mut args = rule(&["-C", chain]);
        args.extend_from_slice(spec);
        let output = self.run(table, args.clone()).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failure(table, &args, &output)),
        }
    }

    async fn append_unique(&self, table: Table, chain: &str, spec: &[String]) -> Result<()> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        let mut args = rule(&["-A", chain]);
        args.extend_from_slice(spec);
        self.run_checked(table, args).await
    }

    async fn insert_unique(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        spec: &[String],
    ) -> Result<()> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        let mut args = vec!["-I".to_string(), chain.to_string(), position.to_string()];
        args.extend_from_slice(spec);
        self.run_checked(table, args).await
    }
}

#[derive(Debug, Default)]
struct FakeIpTablesState {
    chains: HashMap<(Table, String), Vec<Vec<String>>>,
    failing: Option<String>,
    flushes: usize,
    log: Vec<String>,
}

/// In-memory [`IpTables`] for tests.
///
/// Built-in chains (`INPUT`, `FORWARD`, `POSTROUTING`) exist implicitly.
#[derive(Debug, Clone, Default)]
pub struct FakeIpTables {
    state: Arc<Mutex<FakeIpTablesState>>,
}

impl FakeIpTables {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules of a chain, `None` if the chain does not exist.
    #[must_use]
    pub fn rules(&self, table: Table, chain: &str) -> Option<Vec<Vec<String>>> {
        self.state
            .lock()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
    }

    /// Number of chain flushes.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    /// Operations in call order, like `"-N nat FABEDGE-NAT-OUTGOING"`.
    #[must_use]
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Makes every mutation of `chain` fail.
    pub fn fail_chain(&self, chain: &str) {
        self.state.lock().failing = Some(chain.to_string());
    }

    fn check(state: &FakeIpTablesState, chain: &str) -> Result<()> {
        if state.failing.as_deref() == Some(chain) {
            return Err(RuleError::Command {
                program: "iptables".to_string(),
                args: chain.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn chain_mut<'a>(
        state: &'a mut FakeIpTablesState,
        table: Table,
        chain: &str,
    ) -> Result<&'a mut Vec<Vec<String>>> {
        let builtin = matches!(
            chain,
            "INPUT" | "FORWARD" | "OUTPUT" | "PREROUTING" | "POSTROUTING"
        );
        let key = (table, chain.to_string());
        if builtin {
            return Ok(state.chains.entry(key).or_default());
        }
        state.chains.get_mut(&key).ok_or_else(|| RuleError::Command {
            program: "iptables".to_string(),
            args: format!("-t {table} {chain}"),
            stderr: "No chain/target/match by that name.".to_string(),
        })
    }
}

impl IpTables for FakeIpTables {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, chain)?;
        state.log.push(format!("-N {table} {chain}"));
        state.chains.entry((table, chain.to_string())).or_default();
        Ok(())
    }

    async fn clear_chain(&self, table: Table, chain: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, chain)?;
        state.log.push(format!("-F {table} {chain}"));
        state.flushes += 1;
        state.chains.entry((table, chain.to_string())).or_default().clear();
        Ok(())
    }

    async fn exists(&self, table: Table, chain: &str, spec: &[String]) -> Result<bool> {
        let state = self.state.lock();
        Ok(state
            .chains
            .get(&(table, chain.to_string()))
            .is_some_and(|rules| rules.iter().any(|r| r == spec)))
    }

    async fn append_unique(&self, table: Table, chain: &str, spec: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, chain)?;
        state.log.push(format!("-A {table} {chain} {}", spec.join(" ")));
        let rules = Self::chain_mut(&mut state, table, chain)?;
        if !rules.iter().any(|r| r == spec) {
            rules.push(spec.to_vec());
        }
        Ok(())
    }

    async fn insert_unique(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        spec: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, chain)?;
        state.log.push(format!("-I {table} {chain} {}", spec.join(" ")));
        let rules = Self::chain_mut(&mut state, table, chain)?;
        if !rules.iter().any(|r| r == spec) {
            let index = usize::try_from(position.saturating_sub(1))
                .unwrap_or(0)
                .min(rules.len());
            rules.insert(index, spec.to_vec());
        }
        Ok(())
    }
}
