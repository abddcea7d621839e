//! Fixed-delay retry bound to a cancellation token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// How a retry loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// An attempt succeeded.
    Succeeded {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// The token fired before an attempt succeeded.
    Cancelled {
        /// Attempts made.
        attempts: u32,
    },
}

/// Runs `attempt` until it succeeds or `cancel` fires.
///
/// The token is checked before every attempt and while sleeping between
/// attempts. A running attempt is never interrupted.
pub async fn retry_forever<F, Fut>(
    task: &str,
    delay: Duration,
    cancel: &CancellationToken,
    mut attempt: F,
) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            debug!(task, attempts, "retry cancelled");
            return RetryOutcome::Cancelled { attempts };
        }

        attempts += 1;
        match attempt().await {
            Ok(()) => {
                debug!(task, attempts, "sync succeeded");
                return RetryOutcome::Succeeded { attempts };
            }
            Err(e) => {
                warn!(task, attempt = attempts, error = %e, retry_in = ?delay, "sync failed");
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(task, attempts, "retry cancelled");
                return RetryOutcome::Cancelled { attempts };
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let outcome = retry_forever("test", DELAY, &CancellationToken::new(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AgentError::TunnelsInactive)
            } else {
                Ok(())
            }
        })
        .await;

        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 3 });
        assert!(start.elapsed() >= DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_within_one_interval() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                retry_forever("test", DELAY, &cancel, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(AgentError::TunnelsInactive) }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(7)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();

        let outcome = task.await.expect("retry task");
        assert_eq!(outcome, RetryOutcome::Cancelled { attempts: 2 });
        assert!(cancelled_at.elapsed() < DELAY);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_token_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = retry_forever("test", DELAY, &cancel, || async { Ok(()) }).await;
        assert_eq!(outcome, RetryOutcome::Cancelled { attempts: 0 });
    }
}
