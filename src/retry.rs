//! Bounded polling with backoff
//!
//! `RetryScheduler::wait_until` is the one place the deputy waits for an
//! on-chain effect. Timeout is an outcome (`Ok(false)`), not an error.

use crate::error::DeputyResult;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poll cadence for `wait_until`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound the poll interval grows to
    pub max_interval: Duration,
    /// Growth of the interval after every unsuccessful poll
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_secs(30),
            backoff_factor: 1.5,
        }
    }
}

impl RetryPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.backoff_factor.max(1.0));
        grown.min(self.max_interval.max(current))
    }
}

pub struct RetryScheduler {
    policy: RetryPolicy,
    shutdown: Arc<RwLock<bool>>,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy, shutdown: Arc<RwLock<bool>>) -> Self {
        Self { policy, shutdown }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.shutdown.read().await
    }

    /// Evaluate `predicate` until it returns true or `timeout` elapses.
    ///
    /// Retryable predicate errors (transient chain reads) are logged and the
    /// poll continues; any other error is returned. Timeout and shutdown both
    /// return `Ok(false)` and leave the caller free to resume later.
    pub async fn wait_until<F, Fut>(
        &self,
        label: &str,
        timeout: Duration,
        poll_interval: Duration,
        mut predicate: F,
    ) -> DeputyResult<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeputyResult<bool>>,
    {
        let deadline = Instant::now() + timeout;
        let mut interval = poll_interval;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match predicate().await {
                Ok(true) => {
                    debug!("{} satisfied after {} polls", label, attempts);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    warn!("{}: transient error on poll {}: {}", label, attempts, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("{} timed out after {:?} ({} polls)", label, timeout, attempts);
                crate::metrics::record_wait_timeout(label);
                return Ok(false);
            }
            if self.is_shutting_down().await {
                debug!("{} abandoned on shutdown", label);
                return Ok(false);
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = self.policy.next_interval(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainKind;
    use crate::error::DeputyError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(RetryPolicy::default(), Arc::new(RwLock::new(false)))
    }

    #[tokio::test(start_paused = true)]
    async fn returns_true_once_predicate_holds() {
        let calls = &AtomicU32::new(0);
        let done = scheduler()
            .wait_until("ready", Duration::from_secs(60), Duration::from_secs(1), move || async move {
                Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2)
            })
            .await
            .unwrap();
        assert!(done);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_false_not_error() {
        let start = Instant::now();
        let done = scheduler()
            .wait_until("never", Duration::from_secs(10), Duration::from_secs(1), move || async move {
                Ok(false)
            })
            .await
            .unwrap();
        assert!(!done);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let calls = &AtomicU32::new(0);
        let done = scheduler()
            .wait_until("flaky", Duration::from_secs(60), Duration::from_secs(1), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DeputyError::ChainConnection {
                        chain: ChainKind::Kava,
                        message: "timeout".to_string(),
                    })
                } else {
                    Ok(true)
                }
            })
            .await
            .unwrap();
        assert!(done);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_returned() {
        let result = scheduler()
            .wait_until("broken", Duration::from_secs(60), Duration::from_secs(1), move || async move {
                Err(DeputyError::Internal("bad".to_string()))
            })
            .await;
        assert!(matches!(result, Err(DeputyError::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_waiting() {
        let shutdown = Arc::new(RwLock::new(true));
        let scheduler = RetryScheduler::new(RetryPolicy::default(), shutdown);
        let done = scheduler
            .wait_until("stopping", Duration::from_secs(3600), Duration::from_secs(1), move || async move {
                Ok(false)
            })
            .await
            .unwrap();
        assert!(!done);
    }

    #[test]
    fn interval_backs_off_up_to_cap() {
        let policy = RetryPolicy {
            max_interval: Duration::from_secs(4),
            backoff_factor: 2.0,
        };
        let mut interval = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..4 {
            interval = policy.next_interval(interval);
            seen.push(interval.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 4, 4]);
    }
}
