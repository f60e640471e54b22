//! The worker-side retry envelope `{Timeout, Wait, Tries}` (spec.md §4.5
//! "Retry discipline").

use std::future::Future;
use std::time::Duration;

use crate::error::SqlmeterError;

/// One retry policy: each attempt is bounded by `timeout`, failed attempts
/// sleep `wait` before the next try. `tries < 0` retries forever (used
/// while waiting for the coordinator to publish a stage); otherwise the
/// policy gives up after `tries` attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub wait: Duration,
    pub tries: i64,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, wait: Duration, tries: i64) -> Self {
        Self { timeout, wait, tries }
    }

    pub fn forever(timeout: Duration, wait: Duration) -> Self {
        Self::new(timeout, wait, -1)
    }

    pub fn finite(timeout: Duration, wait: Duration, tries: u32) -> Self {
        Self::new(timeout, wait, tries as i64)
    }

    /// Run `attempt` until it succeeds, the policy's tries are exhausted,
    /// or (implicitly, via the closure observing it) the caller's own
    /// cancellation fires. Each attempt is wrapped in [`tokio::time::timeout`].
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, SqlmeterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SqlmeterError>>,
    {
        let mut tried: i64 = 0;
        loop {
            tried += 1;
            match tokio::time::timeout(self.timeout, attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => tracing::warn!(%err, tried, "fleet request attempt failed"),
                Err(_) => tracing::warn!(tried, timeout = ?self.timeout, "fleet request attempt timed out"),
            }
            if self.tries >= 0 && tried >= self.tries {
                return Err(SqlmeterError::Fleet(format!(
                    "exhausted {tried} retries"
                )));
            }
            tokio::time::sleep(self.wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_try_without_sleeping() {
        let policy = RetryPolicy::finite(Duration::from_millis(50), Duration::from_secs(10), 3);
        let result = policy.run(|| async { Ok::<_, SqlmeterError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn exhausts_finite_tries() {
        let policy = RetryPolicy::finite(Duration::from_millis(10), Duration::from_millis(1), 3);
        let attempts = AtomicUsize::new(0);
        let result = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::Relaxed);
                Err::<(), _>(SqlmeterError::Fleet("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn forever_retries_until_success() {
        let policy = RetryPolicy::forever(Duration::from_millis(10), Duration::from_millis(1));
        let attempts = AtomicUsize::new(0);
        let result = policy
            .run(|| async {
                let n = attempts.fetch_add(1, Ordering::Relaxed);
                if n < 4 {
                    Err(SqlmeterError::Fleet("not yet".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::Relaxed), 5);
    }
}
