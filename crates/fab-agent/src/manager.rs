//! The reconciliation control loop.
//!
//! Triggers (file watch, period, discovery) feed one [`Notifier`]. Each
//! debounced trigger cancels the running round and starts a new one. A round
//! runs every reconciler as its own task under [`retry_forever`], and every
//! attempt reloads the topology before taking a fresh snapshot.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fab_endpoint::{Endpoint, PeerEndpointStore, spawn_broadcaster, spawn_receiver};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::debounce::{self, Notifier};
use crate::error::{AgentError, Result};
use crate::reconcile::Reconciler;
use crate::retry::{RetryOutcome, retry_forever};
use crate::watch::ConfigWatcher;

/// One set of reconciler tasks sharing a cancellation token.
pub struct Round {
    id: u64,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<RetryOutcome>)>,
}

impl Round {
    /// Sequence number of the round.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops the retry loops at their next boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once every task has ended.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|(_, task)| task.is_finished())
    }

    /// Waits for every task and returns how each ended.
    pub async fn wait(self) -> Vec<(&'static str, RetryOutcome)> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for (name, task) in self.tasks {
            match task.await {
                Ok(outcome) => outcomes.push((name, outcome)),
                Err(e) => warn!(round = self.id, task = name, error = %e, "reconciler task failed"),
            }
        }
        outcomes
    }
}

/// Waits for background tasks, logging those that panicked or were aborted.
///
/// Returns the number of tasks that did not finish cleanly.
pub async fn join_background(tasks: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task failed");
            failed += 1;
        }
    }
    failed
}

/// Loads the topology and runs one attempt of `reconciler` against it.
async fn attempt(
    store: &PeerEndpointStore,
    network_conf: &Path,
    reconciler: &dyn Reconciler,
) -> Result<()> {
    store.load_from_config(network_conf)?;
    let snapshot = store
        .snapshot()
        .ok_or_else(|| AgentError::Topology("no local endpoint".to_string()))?;
    reconciler.reconcile(&snapshot).await
}

/// Drives reconciliation rounds.
pub struct Manager {
    config: Arc<AgentConfig>,
    store: Arc<PeerEndpointStore>,
    reconcilers: Vec<Arc<dyn Reconciler>>,
}

impl Manager {
    /// Creates a manager without reconcilers.
    pub fn new(config: Arc<AgentConfig>, store: Arc<PeerEndpointStore>) -> Self {
        Self {
            config,
            store,
            reconcilers: Vec::new(),
        }
    }

    /// Adds a reconciler run in every round.
    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self
    }

    /// The endpoint store.
    pub fn store(&self) -> &Arc<PeerEndpointStore> {
        &self.store
    }

    /// Starts round `id`: one retry loop per reconciler.
    pub fn start_round(&self, id: u64) -> Round {
        let cancel = CancellationToken::new();
        let delay = self.config.sync.retry_delay();

        let tasks = self
            .reconcilers
            .iter()
            .map(|reconciler| {
                let reconciler = Arc::clone(reconciler);
                let store = Arc::clone(&self.store);
                let path = self.config.paths.network_conf.clone();
                let cancel = cancel.clone();
                let name = reconciler.name();
                let task = tokio::spawn(async move {
                    retry_forever(name, delay, &cancel, || {
                        attempt(&store, &path, reconciler.as_ref())
                    })
                    .await
                });
                (name, task)
            })
            .collect();

        info!(round = id, "started reconciliation round");
        Round { id, cancel, tasks }
    }

    /// Runs until `cancel` fires.
    ///
    /// Restores discovered endpoints and starts the discovery loops when
    /// enabled, runs a first round right away, then starts a new round per
    /// debounced trigger.
    pub async fn run(&self, cancel: CancellationToken) {
        let (notifier, notifications) = debounce::channel();
        let mut background = Vec::new();

        if self.config.gossip.enabled {
            background.extend(self.start_discovery(&notifier, &cancel));
        }

        let mut watched = vec![self.config.paths.network_conf.clone()];
        if self.config.proxy.enabled {
            watched.push(self.config.paths.services_conf.clone());
        }
        let _watcher = match ConfigWatcher::new(&watched, notifier.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "config watch unavailable, relying on periodic sync");
                None
            }
        };

        background.push(spawn_ticker(
            self.config.sync.period(),
            notifier,
            cancel.child_token(),
        ));
        let (debouncer, mut triggers) = debounce::spawn_debouncer(
            notifications,
            self.config.sync.debounce(),
            cancel.child_token(),
        );
        background.push(debouncer);

        let mut round = self.start_round(1);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    if !round.is_finished() {
                        debug!(round = round.id(), "cancelling unfinished round");
                    }
                    round.cancel();
                    round = self.start_round(round.id() + 1);
                }
            }
        }

        round.cancel();
        join_background(background).await;
        info!("reconciliation stopped");
    }

    fn start_discovery(
        &self,
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let gossip = &self.config.gossip;
        let backup_path = self.config.paths.local_endpoints.clone();

        self.store.load_local_endpoints(&backup_path, gossip.ttl());

        let gossip_config = gossip.to_gossip_config();
        let on_change = {
            let notifier = notifier.clone();
            move |_: &Endpoint| notifier.notify()
        };

        vec![
            spawn_broadcaster(
                Arc::clone(&self.store),
                gossip_config.clone(),
                cancel.child_token(),
            ),
            spawn_receiver(
                Arc::clone(&self.store),
                gossip_config,
                cancel.child_token(),
                on_change,
            ),
            spawn_purger(
                Arc::clone(&self.store),
                Duration::from_secs(gossip.purge_interval_secs),
                notifier.clone(),
                cancel.child_token(),
            ),
            spawn_backup(
                Arc::clone(&self.store),
                backup_path,
                Duration::from_secs(gossip.backup_interval_secs),
                cancel.child_token(),
            ),
        ]
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Requests a round every `period`.
fn spawn_ticker(period: Duration, notifier: Notifier, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = delayed_interval(period);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => notifier.notify(),
            }
        }
    })
}

/// Drops expired discovered endpoints, requesting a round when any went.
fn spawn_purger(
    store: Arc<PeerEndpointStore>,
    every: Duration,
    notifier: Notifier,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = delayed_interval(every);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !store.purge_expired().is_empty() {
                        notifier.notify();
                    }
                }
            }
        }
    })
}

/// Writes discovered endpoints to disk periodically and once on shutdown.
fn spawn_backup(
    store: Arc<PeerEndpointStore>,
    path: std::path::PathBuf,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = delayed_interval(every);
        loop {
            let stopping = tokio::select! {
                biased;
                () = cancel.cancelled() => true,
                _ = ticker.tick() => false,
            };
            match store.save_local_endpoints(&path) {
                Ok(count) => debug!(path = %path.display(), count, "backed up local endpoints"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to back up local endpoints");
                }
            }
            if stopping {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::BoxFuture;
    use fab_endpoint::Snapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPOLOGY: &str = "\
id: C=CN, CN=edge1
name: edge1
subnets: [10.1.0.0/24]
type: EdgeNode
peers:
  - id: C=CN, CN=connector
    name: connector
    subnets: [10.2.0.0/16]
    type: Connector
";

    /// Counts attempts and fails the first `failures` of them.
    #[derive(Default)]
    struct CountingReconciler {
        attempts: AtomicUsize,
        failures: usize,
        peers_seen: AtomicUsize,
    }

    impl Reconciler for CountingReconciler {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn reconcile<'a>(&'a self, snapshot: &'a Snapshot) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst);
                self.peers_seen.store(snapshot.peers.len(), Ordering::SeqCst);
                if n < self.failures {
                    Err(AgentError::TunnelsInactive)
                } else {
                    Ok(())
                }
            })
        }
    }

    fn manager(dir: &Path, reconciler: Arc<CountingReconciler>) -> Manager {
        let mut config = AgentConfig::default();
        config.paths.network_conf = dir.join("tunnels.yaml");
        Manager::new(Arc::new(config), Arc::new(PeerEndpointStore::new()))
            .with_reconciler(reconciler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_retries_until_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tunnels.yaml"), TOPOLOGY).expect("write");
        let reconciler = Arc::new(CountingReconciler {
            failures: 2,
            ..Default::default()
        });

        let outcomes = manager(dir.path(), Arc::clone(&reconciler))
            .start_round(1)
            .wait()
            .await;

        assert_eq!(
            outcomes,
            vec![("counting", RetryOutcome::Succeeded { attempts: 3 })]
        );
        assert_eq!(reconciler.peers_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_topology_is_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reconciler = Arc::new(CountingReconciler::default());
        let manager = manager(dir.path(), Arc::clone(&reconciler));

        let round = manager.start_round(1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 0);

        std::fs::write(dir.path().join("tunnels.yaml"), TOPOLOGY).expect("write");
        let outcomes = round.wait().await;
        assert_eq!(
            outcomes,
            vec![("counting", RetryOutcome::Succeeded { attempts: 3 })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_round_cancels_previous() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tunnels.yaml"), TOPOLOGY).expect("write");
        let reconciler = Arc::new(CountingReconciler {
            failures: usize::MAX,
            ..Default::default()
        });
        let manager = manager(dir.path(), Arc::clone(&reconciler));

        let first = manager.start_round(1);
        tokio::time::sleep(Duration::from_secs(7)).await;

        let cancelled_at = Instant::now();
        first.cancel();
        let second = manager.start_round(2);

        let outcomes = first.wait().await;
        assert_eq!(
            outcomes,
            vec![("counting", RetryOutcome::Cancelled { attempts: 2 })]
        );
        assert!(cancelled_at.elapsed() < Duration::from_secs(5));
        assert!(!second.is_finished());
        second.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_starts_immediately_and_stops_on_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tunnels.yaml"), TOPOLOGY).expect("write");
        let reconciler = Arc::new(CountingReconciler::default());
        let manager = Arc::new(manager(dir.path(), Arc::clone(&reconciler)));
        let cancel = CancellationToken::new();

        let task = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reconciler.attempts.load(Ordering::SeqCst), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("manager stops")
            .expect("manager task");
    }

    #[tokio::test]
    async fn test_join_background_counts_failed_tasks() {
        let finished = tokio::spawn(async {});
        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();

        assert_eq!(join_background(vec![finished, aborted]).await, 1);
    }
}
