//! iptables and ipset synchronization.
//!
//! Per address family three chains are maintained:
//!
//! - `FABEDGE-INPUT`: accept IKE (udp/500, udp/4500), ESP and AH.
//! - `FABEDGE-FORWARD`: accept established traffic, traffic from and to the
//!   local subnets and traffic from and to the peer set.
//! - `FABEDGE-NAT-OUTGOING` (nat): no NAT towards peers or local subnets,
//!   masquerade everything else leaving the local subnets.
//!
//! Forward rules for local subnets are only ever appended; a subnet removed
//! from the topology keeps its accept rules until the chain is flushed by
//! hand.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use fab_endpoint::Snapshot;
use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, RuleError};
use crate::family::{CHAIN_FORWARD, CHAIN_INPUT, CHAIN_NAT_OUTGOING, IpFamily};
use crate::ipset::IpSet;
use crate::iptables::{IpTables, Table, rule};

/// The rule inputs derived from one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredRules {
    /// This node's pod subnets.
    pub local_subnets: Vec<String>,
    /// Subnets and node subnets of every peer.
    pub peer_cidrs: Vec<String>,
}

impl DesiredRules {
    /// Derives the rule inputs from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            local_subnets: snapshot.endpoint.subnets.clone(),
            peer_cidrs: snapshot
                .peers
                .iter()
                .flat_map(|peer| peer.all_cidrs().cloned())
                .collect(),
        }
    }

    fn has_family(&self, family: IpFamily) -> bool {
        self.local_subnets
            .iter()
            .chain(&self.peer_cidrs)
            .any(|c| IpFamily::of_cidr(c) == family)
    }
}

/// Normalizes a CIDR the way the kernel prints set members.
fn canonical(cidr: &str) -> Result<IpNet> {
    let cidr = cidr.trim();
    cidr.parse::<IpNet>()
        .map(|net| net.trunc())
        .or_else(|_| cidr.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| RuleError::InvalidCidr(cidr.to_string()))
}

#[derive(Debug, Default)]
struct FamilyState {
    local_subnets: Option<BTreeSet<String>>,
}

/// Rule state of one address family.
struct FamilyRules<I> {
    family: IpFamily,
    iptables: I,
    state: Mutex<FamilyState>,
}

impl<I: IpTables> FamilyRules<I> {
    fn new(family: IpFamily, iptables: I) -> Self {
        Self {
            family,
            iptables,
            state: Mutex::new(FamilyState::default()),
        }
    }

    /// Whether a pass has completed since start.
    async fn is_set_up(&self) -> bool {
        self.state.lock().await.local_subnets.is_some()
    }

    async fn sync<S: IpSet>(&self, ipset: &S, desired: &DesiredRules) -> Result<()> {
        let mut state = self.state.lock().await;
        let set = self.family.peer_set_name();
        let local: Vec<String> = self.family.filter(&desired.local_subnets);
        let peers: Vec<String> = self.family.filter(&desired.peer_cidrs);

        self.ensure_chains(ipset).await?;
        self.ensure_input_rules().await?;
        self.ensure_forward_rules(&local).await?;

        let local_set: BTreeSet<String> = local.iter().cloned().collect();
        if state.local_subnets.as_ref() != Some(&local_set) {
            self.iptables.clear_chain(Table::Nat, CHAIN_NAT_OUTGOING).await?;
            debug!(family = %self.family, "rebuilding outgoing NAT chain");
        }

        sync_set(ipset, set, &peers).await?;
        self.ensure_nat_rules(&local).await?;

        state.local_subnets = Some(local_set);
        Ok(())
    }

    async fn ensure_chains<S: IpSet>(&self, ipset: &S) -> Result<()> {
        let ipt = &self.iptables;
        ipt.ensure_chain(Table::Filter, CHAIN_INPUT).await?;
        ipt.ensure_chain(Table::Filter, CHAIN_FORWARD).await?;
        ipt.ensure_chain(Table::Nat, CHAIN_NAT_OUTGOING).await?;

        ipt.insert_unique(Table::Filter, "INPUT", 1, &rule(&["-j", CHAIN_INPUT])).await?;
        ipt.insert_unique(Table::Filter, "FORWARD", 1, &rule(&["-j", CHAIN_FORWARD])).await?;
        ipt.insert_unique(Table::Nat, "POSTROUTING", 1, &rule(&["-j", CHAIN_NAT_OUTGOING]))
            .await?;

        ipset.ensure_set(self.family.peer_set_name(), self.family).await
    }

    async fn ensure_input_rules(&self) -> Result<()> {
        let specs = [
            rule(&["-p", "udp", "-m", "udp", "--dport", "500", "-j", "ACCEPT"]),
            rule(&["-p", "udp", "-m", "udp", "--dport", "4500", "-j", "ACCEPT"]),
            rule(&["-p", "esp", "-j", "ACCEPT"]),
            rule(&["-p", "ah", "-j", "ACCEPT"]),
        ];
        for spec in &specs {
            self.iptables.append_unique(Table::Filter, CHAIN_INPUT, spec).await?;
        }
        Ok(())
    }

    async fn ensure_forward_rules(&self, local: &[String]) -> Result<()> {
        let set = self.family.peer_set_name();
        let ipt = &self.iptables;

        ipt.append_unique(
            Table::Filter,
            CHAIN_FORWARD,
            &rule(&["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"]),
        )
        .await?;

        for subnet in local {
            ipt.append_unique(Table::Filter, CHAIN_FORWARD, &rule(&["-s", subnet, "-j", "ACCEPT"]))
                .await?;
            ipt.append_unique(Table::Filter, CHAIN_FORWARD, &rule(&["-d", subnet, "-j", "ACCEPT"]))
                .await?;
        }

        for direction in ["src", "dst"] {
            ipt.append_unique(
                Table::Filter,
                CHAIN_FORWARD,
                &rule(&["-m", "set", "--match-set", set, direction, "-j", "ACCEPT"]),
            )
            .await?;
        }
        Ok(())
    }

    async fn ensure_nat_rules(&self, local: &[String]) -> Result<()> {
        let set = self.family.peer_set_name();
        let ipt = &self.iptables;

        for subnet in local {
            ipt.append_unique(
                Table::Nat,
                CHAIN_NAT_OUTGOING,
                &rule(&["-s", subnet, "-m", "set", "--match-set", set, "dst", "-j", "RETURN"]),
            )
            .await?;
            ipt.append_unique(
                Table::Nat,
                CHAIN_NAT_OUTGOING,
                &rule(&["-s", subnet, "-d", subnet, "-j", "RETURN"]),
            )
            .await?;
            ipt.append_unique(
                Table::Nat,
                CHAIN_NAT_OUTGOING,
                &rule(&["-s", subnet, "-j", "MASQUERADE"]),
            )
            .await?;
        }
        Ok(())
    }
}

/// Converges the members of `set` to `desired`.
async fn sync_set<S: IpSet>(ipset: &S, set: &str, desired: &[String]) -> Result<()> {
    let desired: BTreeSet<IpNet> = desired
        .iter()
        .map(|c| canonical(c))
        .collect::<Result<_>>()?;

    let mut current = BTreeSet::new();
    let mut unparsable = Vec::new();
    for entry in ipset.list_entries(set).await? {
        match canonical(&entry) {
            Ok(net) => {
                current.insert(net);
            }
            Err(_) => unparsable.push(entry),
        }
    }

    for net in desired.difference(&current) {
        ipset.add_entry(set, &net.to_string()).await?;
        info!(set, entry = %net, "added set member");
    }
    for net in current.difference(&desired) {
        ipset.del_entry(set, &net.to_string()).await?;
        info!(set, entry = %net, "removed set member");
    }
    for entry in unparsable {
        ipset.del_entry(set, &entry).await?;
    }
    Ok(())
}

/// Keeps firewall rules and peer sets of both families in sync.
pub struct RuleSynchronizer<I, S> {
    v4: FamilyRules<I>,
    v6: FamilyRules<I>,
    ipset: Arc<S>,
}

impl<I: IpTables, S: IpSet> RuleSynchronizer<I, S> {
    /// Creates a synchronizer from per-family iptables handles and an ipset.
    pub fn new(iptables_v4: I, iptables_v6: I, ipset: Arc<S>) -> Self {
        Self {
            v4: FamilyRules::new(IpFamily::V4, iptables_v4),
            v6: FamilyRules::new(IpFamily::V6, iptables_v6),
            ipset,
        }
    }

    /// Applies `desired` to every family it mentions.
    ///
    /// IPv4 is always synchronized. IPv6 starts once an IPv6 CIDR is present
    /// and keeps running afterwards so that its set drains. A failing family
    /// does not stop the other; the first error is returned.
    pub async fn sync(&self, desired: &DesiredRules) -> Result<()> {
        let v4 = self.v4.sync(self.ipset.as_ref(), desired);
        let v6 = async {
            if desired.has_family(IpFamily::V6) || self.v6.is_set_up().await {
                self.v6.sync(self.ipset.as_ref(), desired).await
            } else {
                Ok(())
            }
        };
        let (v4, v6) = tokio::join!(v4, v6);
        v4.and(v6)
    }
}
