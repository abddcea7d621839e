//! The peer endpoint store.
//!
//! Holds this node's endpoint plus every peer known either from the topology
//! file or from multicast discovery. Config-sourced entries never expire;
//! discovered (local) entries expire `ttl` after their last announcement and
//! win over a config entry of the same name.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::persist::{self, SavedEndpoint};
use crate::types::{Endpoint, NetworkConf};

/// A peer as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpointEntry {
    /// The peer's endpoint.
    pub endpoint: Endpoint,
    /// True if the entry was discovered through gossip rather than config.
    pub is_local: bool,
    /// When a discovered entry expires; `None` for config entries.
    pub expire_time: Option<DateTime<Utc>>,
}

impl PeerEndpointEntry {
    /// Creates a config-sourced entry.
    #[must_use]
    pub fn from_config(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            is_local: false,
            expire_time: None,
        }
    }

    /// Creates a discovered entry that expires `ttl` from now.
    #[must_use]
    pub fn discovered(endpoint: Endpoint, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            endpoint,
            is_local: true,
            expire_time: Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)),
        }
    }

    /// Returns true if this is a discovered entry past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_local && self.expire_time.is_some_and(|t| t <= now)
    }
}

/// A consistent view of the store taken under one read lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// This node's endpoint.
    pub endpoint: Endpoint,
    /// All peers, sorted by name.
    pub peers: Vec<Endpoint>,
    /// Mediator from the last loaded config.
    pub mediator: Option<Endpoint>,
}

#[derive(Debug, Default)]
struct StoreState {
    endpoint: Option<Endpoint>,
    mediator: Option<Endpoint>,
    peers: HashMap<String, PeerEndpointEntry>,
}

/// Thread-safe directory of this node and its peers.
#[derive(Debug, Default)]
pub struct PeerEndpointStore {
    state: RwLock<StoreState>,
}

/// What an upsert of a discovered peer changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The peer was not known before.
    Added,
    /// The peer was known with a different endpoint.
    Updated,
    /// Only the expiry was refreshed.
    Refreshed,
}

impl PeerEndpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the topology file and merges it into the store.
    ///
    /// The file is fully parsed before anything is touched, so a failed load
    /// leaves the previous state intact.
    pub fn load_from_config(&self, path: impl AsRef<Path>) -> Result<NetworkConf> {
        let conf = NetworkConf::from_file(path)?;
        self.apply_config(&conf);
        Ok(conf)
    }

    /// Merges a parsed topology into the store.
    ///
    /// Discovered peers are never overwritten by config entries of the same
    /// name. Config entries missing from `conf` are dropped.
    pub fn apply_config(&self, conf: &NetworkConf) {
        let mut state = self.state.write();

        state.endpoint = Some(conf.endpoint.clone());
        state.mediator.clone_from(&conf.mediator);

        state
            .peers
            .retain(|name, entry| entry.is_local || conf.peers.iter().any(|p| &p.name == name));

        for peer in &conf.peers {
            match state.peers.get(&peer.name) {
                Some(entry) if entry.is_local => {
                    debug!(peer = %peer.name, "keeping discovered endpoint over config entry");
                }
                _ => {
                    state
                        .peers
                        .insert(peer.name.clone(), PeerEndpointEntry::from_config(peer.clone()));
                }
            }
        }
    }

    /// Records a peer learnt through discovery.
    pub fn upsert_local(&self, endpoint: Endpoint, ttl: Duration) -> UpsertOutcome {
        let mut state = self.state.write();
        let outcome = match state.peers.get(&endpoint.name) {
            None => UpsertOutcome::Added,
            Some(entry) if entry.endpoint != endpoint || !entry.is_local => UpsertOutcome::Updated,
            Some(_) => UpsertOutcome::Refreshed,
        };

        state
            .peers
            .insert(endpoint.name.clone(), PeerEndpointEntry::discovered(endpoint, ttl));
        outcome
    }

    /// Inserts a fully formed entry, keeping its expiry.
    pub fn insert_entry(&self, entry: PeerEndpointEntry) {
        self.state
            .write()
            .peers
            .insert(entry.endpoint.name.clone(), entry);
    }

    /// Removes every discovered entry whose expiry has passed.
    ///
    /// Returns the names of the purged peers.
    pub fn purge_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut state = self.state.write();

        let expired: Vec<String> = state
            .peers
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            state.peers.remove(name);
        }

        if !expired.is_empty() {
            info!(peers = ?expired, "purged expired endpoints");
        }
        expired
    }

    /// Returns this node's endpoint, if a config has been loaded.
    pub fn self_endpoint(&self) -> Option<Endpoint> {
        self.state.read().endpoint.clone()
    }

    /// Returns the mediator from the last loaded config.
    pub fn mediator(&self) -> Option<Endpoint> {
        self.state.read().mediator.clone()
    }

    /// Returns all peers sorted by name.
    pub fn peers(&self) -> Vec<Endpoint> {
        let state = self.state.read();
        sorted_peers(&state)
    }

    /// Returns one entry by name.
    pub fn get(&self, name: &str) -> Option<PeerEndpointEntry> {
        self.state.read().peers.get(name).cloned()
    }

    /// Returns discovered entries that have not expired yet.
    pub fn local_entries(&self) -> Vec<PeerEndpointEntry> {
        let now = Utc::now();
        let state = self.state.read();
        let mut entries: Vec<PeerEndpointEntry> = state
            .peers
            .values()
            .filter(|entry| entry.is_local && !entry.is_expired(now))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.endpoint.name.cmp(&b.endpoint.name));
        entries
    }

    /// Takes a consistent snapshot; `None` until a config has been loaded.
    pub fn snapshot(&self) -> Option<Snapshot> {
        let state = self.state.read();
        let endpoint = state.endpoint.clone()?;
        Some(Snapshot {
            endpoint,
            peers: sorted_peers(&state),
            mediator: state.mediator.clone(),
        })
    }

    /// Number of peers in the store.
    pub fn peer_count(&self) -> usize {
        self.state.read().peers.len()
    }

    /// Persists non-expired discovered entries with their expiry to `path`.
    pub fn save_local_endpoints(&self, path: impl AsRef<Path>) -> Result<usize> {
        let saved: Vec<SavedEndpoint> = self
            .local_entries()
            .into_iter()
            .map(|entry| SavedEndpoint {
                endpoint: entry.endpoint,
                expire_time: entry.expire_time,
            })
            .collect();
        persist::write_endpoints(path.as_ref(), &saved)?;
        Ok(saved.len())
    }

    /// Reloads discovered entries saved by a previous run.
    ///
    /// Entries keep their saved expiry and are skipped once it has passed;
    /// entries saved without one get `ttl` from now. Best effort: failures
    /// are logged and yield zero restored peers.
    pub fn load_local_endpoints(&self, path: impl AsRef<Path>, ttl: Duration) -> usize {
        let path = path.as_ref();
        let saved = match persist::read_endpoints(path) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load local endpoints");
                return 0;
            }
        };

        let now = Utc::now();
        let mut count = 0;
        for SavedEndpoint { endpoint, expire_time } in saved {
            let entry = match expire_time {
                Some(at) if at <= now => {
                    debug!(peer = %endpoint.name, "skipping expired saved endpoint");
                    continue;
                }
                Some(at) => PeerEndpointEntry {
                    endpoint,
                    is_local: true,
                    expire_time: Some(at),
                },
                None => PeerEndpointEntry::discovered(endpoint, ttl),
            };
            self.insert_entry(entry);
            count += 1;
        }
        info!(path = %path.display(), count, "restored local endpoints");
        count
    }
}

fn sorted_peers(state: &StoreState) -> Vec<Endpoint> {
    let mut peers: Vec<Endpoint> = state.peers.values().map(|e| e.endpoint.clone()).collect();
    peers.sort_by(|a, b| a.name.cmp(&b.name));
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointType;

    fn edge(name: &str, subnet: &str) -> Endpoint {
        Endpoint::new(format!("CN={name}"), name, EndpointType::EdgeNode).with_subnet(subnet)
    }

    fn conf(peers: Vec<Endpoint>) -> NetworkConf {
        NetworkConf {
            endpoint: Endpoint::new("CN=self", "self", EndpointType::EdgeNode),
            peers,
            mediator: None,
        }
    }

    // ==================== CONFIG MERGE TESTS ====================

    #[test]
    fn test_apply_config_sets_self_and_peers() {
        let store = PeerEndpointStore::new();
        store.apply_config(&conf(vec![edge("p", "10.0.0.0/24")]));

        assert_eq!(store.self_endpoint().expect("self").name, "self");
        assert_eq!(store.peer_count(), 1);
        assert!(!store.get("p").expect("p").is_local);
    }

    #[test]
    fn test_gossip_entry_wins_over_config() {
        let store = PeerEndpointStore::new();
        store.upsert_local(edge("p", "10.9.0.0/24"), Duration::minutes(5));

        store.apply_config(&conf(vec![edge("p", "10.0.0.0/24"), edge("q", "10.1.0.0/24")]));

        let p = store.get("p").expect("p");
        assert!(p.is_local);
        assert_eq!(p.endpoint.subnets, vec!["10.9.0.0/24"]);

        let q = store.get("q").expect("q");
        assert!(!q.is_local);
        assert_eq!(q.endpoint.subnets, vec!["10.1.0.0/24"]);
    }

    #[test]
    fn test_config_update_replaces_config_entry() {
        let store = PeerEndpointStore::new();
        store.apply_config(&conf(vec![edge("q", "10.1.0.0/24")]));
        store.apply_config(&conf(vec![edge("q", "10.7.0.0/24")]));

        assert_eq!(store.get("q").expect("q").endpoint.subnets, vec!["10.7.0.0/24"]);
    }

    #[test]
    fn test_config_peer_removed_from_file_is_dropped() {
        let store = PeerEndpointStore::new();
        store.upsert_local(edge("g", "10.5.0.0/24"), Duration::minutes(5));
        store.apply_config(&conf(vec![edge("q", "10.1.0.0/24")]));
        store.apply_config(&conf(vec![]));

        assert!(store.get("q").is_none());
        assert!(store.get("g").is_some());
    }

    #[test]
    fn test_failed_load_keeps_previous_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tunnels.yaml");
        std::fs::write(&path, "id: a\nname: a\npeers:\n  - {id: b, name: b}\n").expect("write");

        let store = PeerEndpointStore::new();
        store.load_from_config(&path).expect("first load");
        assert_eq!(store.peer_count(), 1);

        std::fs::write(&path, "peers: [").expect("write");
        assert!(store.load_from_config(&path).is_err());
        assert_eq!(store.peer_count(), 1);
        assert_eq!(store.self_endpoint().expect("self").name, "a");
    }

    // ==================== EXPIRY TESTS ====================

    #[test]
    fn test_purge_removes_expired_local_entries() {
        let store = PeerEndpointStore::new();
        store.insert_entry(PeerEndpointEntry {
            endpoint: edge("old", "10.3.0.0/24"),
            is_local: true,
            expire_time: Some(Utc::now() - Duration::seconds(1)),
        });
        store.upsert_local(edge("fresh", "10.4.0.0/24"), Duration::minutes(5));

        let purged = store.purge_expired();

        assert_eq!(purged, vec!["old".to_string()]);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_purge_never_removes_config_entries() {
        let store = PeerEndpointStore::new();
        store.insert_entry(PeerEndpointEntry {
            endpoint: edge("cfg", "10.3.0.0/24"),
            is_local: false,
            expire_time: Some(Utc::now() - Duration::days(30)),
        });

        assert!(store.purge_expired().is_empty());
        assert!(store.get("cfg").is_some());
    }

    // ==================== UPSERT TESTS ====================

    #[test]
    fn test_upsert_outcomes() {
        let store = PeerEndpointStore::new();
        let ttl = Duration::minutes(1);

        assert_eq!(store.upsert_local(edge("p", "10.0.0.0/24"), ttl), UpsertOutcome::Added);
        assert_eq!(store.upsert_local(edge("p", "10.0.0.0/24"), ttl), UpsertOutcome::Refreshed);
        assert_eq!(store.upsert_local(edge("p", "10.0.1.0/24"), ttl), UpsertOutcome::Updated);
    }

    // ==================== SNAPSHOT TESTS ====================

    #[test]
    fn test_snapshot_requires_config() {
        let store = PeerEndpointStore::new();
        assert!(store.snapshot().is_none());

        store.apply_config(&conf(vec![edge("b", "10.2.0.0/24"), edge("a", "10.1.0.0/24")]));
        let snapshot = store.snapshot().expect("snapshot");

        let names: Vec<&str> = snapshot.peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    // ==================== PERSISTENCE TESTS ====================

    #[test]
    fn test_save_and_load_local_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local-endpoints.json");

        let store = PeerEndpointStore::new();
        store.upsert_local(edge("g1", "10.5.0.0/24"), Duration::minutes(5));
        store.apply_config(&conf(vec![edge("cfg", "10.6.0.0/24")]));
        let saved_expiry = store.get("g1").expect("g1").expire_time;

        assert_eq!(store.save_local_endpoints(&path).expect("save"), 1);

        let restored = PeerEndpointStore::new();
        assert_eq!(restored.load_local_endpoints(&path, Duration::hours(1)), 1);
        let g1 = restored.get("g1").expect("g1");
        assert!(g1.is_local);
        assert_eq!(g1.expire_time, saved_expiry);
        assert!(restored.get("cfg").is_none());
    }

    #[test]
    fn test_load_skips_entries_expired_while_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local-endpoints.json");
        let now = Utc::now();
        let saved = vec![
            SavedEndpoint {
                endpoint: edge("stale", "10.5.0.0/24"),
                expire_time: Some(now - Duration::seconds(1)),
            },
            SavedEndpoint {
                endpoint: edge("fresh", "10.6.0.0/24"),
                expire_time: Some(now + Duration::seconds(30)),
            },
        ];
        persist::write_endpoints(&path, &saved).expect("write");

        let store = PeerEndpointStore::new();
        assert_eq!(store.load_local_endpoints(&path, Duration::hours(1)), 1);
        assert!(store.get("stale").is_none());
        assert_eq!(
            store.get("fresh").expect("fresh").expire_time,
            Some(now + Duration::seconds(30))
        );
    }

    #[test]
    fn test_huge_ttl_saturates_expiry() {
        let entry = PeerEndpointEntry::discovered(edge("p", "10.0.0.0/24"), Duration::MAX);
        assert_eq!(entry.expire_time, Some(DateTime::<Utc>::MAX_UTC));
        assert!(!entry.is_expired(Utc::now()));
    }

    #[test]
    fn test_load_local_endpoints_missing_file_is_ignored() {
        let store = PeerEndpointStore::new();
        let count = store.load_local_endpoints("/nonexistent/local.json", Duration::minutes(5));
        assert_eq!(count, 0);
        assert_eq!(store.peer_count(), 0);
    }
}
