//! Trigger coalescing.
//!
//! Every trigger source holds a [`Notifier`]. Notifications go through a
//! channel of capacity one, so a burst never queues more than a single
//! pending signal. The debouncer turns each burst into one trigger once no
//! notification arrived for the quiet period.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Cheap handle that requests a reconciliation round.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<()>,
}

impl Notifier {
    /// Signals a change. Never blocks; safe to call from any thread.
    pub fn notify(&self) {
        // Full means a signal is already pending; closed means shutdown.
        let _ = self.tx.try_send(());
    }
}

/// Creates a notifier and the receiving end for [`spawn_debouncer`].
pub fn channel() -> (Notifier, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (Notifier { tx }, rx)
}

/// Emits one trigger per burst of notifications.
///
/// A burst ends when `quiet` passes without a notification. Triggers are
/// coalesced the same way as notifications when the consumer lags.
pub fn spawn_debouncer(
    mut notifications: mpsc::Receiver<()>,
    quiet: Duration,
    cancel: CancellationToken,
) -> (JoinHandle<()>, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        'outer: loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = notifications.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }

            let mut coalesced = 1usize;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'outer,
                    received = notifications.recv() => match received {
                        Some(()) => coalesced += 1,
                        None => break 'outer,
                    },
                    () = tokio::time::sleep(quiet) => break,
                }
            }

            trace!(coalesced, "notification burst settled");
            let _ = tx.try_send(());
        }
        debug!("debouncer stopped");
    });

    (handle, rx)
}
