//! Concrete rate limiters and their `And` composition (spec.md §4.2
//! "Compose rate limiters... `And(A,B)` yields a limiter that emits a token
//! only when both A and B would").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::client::RateLimiter;

/// A per-second integer token bucket. A background task refills up to
/// `rate` permits every second; `acquire` blocks until one is available.
pub struct TokenRateLimiter {
    semaphore: Arc<Semaphore>,
    rate: u64,
}

impl TokenRateLimiter {
    pub fn new(rate_per_second: u64) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(rate_per_second as usize));
        let weak = Arc::downgrade(&semaphore);
        let rate = rate_per_second;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await; // first tick fires immediately; skip it, bucket already seeded
            loop {
                ticker.tick().await;
                let Some(sem) = weak.upgrade() else { break };
                let available = sem.available_permits();
                let to_add = (rate as usize).saturating_sub(available);
                if to_add > 0 {
                    sem.add_permits(to_add);
                }
            }
        });
        Arc::new(Self { semaphore, rate })
    }
}

#[async_trait]
impl RateLimiter for TokenRateLimiter {
    async fn acquire(&self) {
        if self.rate == 0 {
            return;
        }
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("rate limiter semaphore is never closed");
        permit.forget();
    }
}

/// Combine two limiters so a token is only emitted once both would emit one
/// (spec.md §4.2). Used to compose stage/exec-group/client-group/per-client
/// levels into one effective limiter per client.
pub struct And {
    a: Arc<dyn RateLimiter>,
    b: Arc<dyn RateLimiter>,
}

impl And {
    pub fn new(a: Arc<dyn RateLimiter>, b: Arc<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self { a, b })
    }
}

#[async_trait]
impl RateLimiter for And {
    async fn acquire(&self) {
        tokio::join!(self.a.acquire(), self.b.acquire());
    }
}

/// Debug-only counting limiter used by tests to assert acquire counts
/// without timing dependence.
#[cfg(test)]
pub struct CountingLimiter(pub AtomicUsize);

#[cfg(test)]
#[async_trait]
impl RateLimiter for CountingLimiter {
    async fn acquire(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Unlimited;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn and_waits_for_both_sides() {
        let a = Arc::new(CountingLimiter(AtomicUsize::new(0)));
        let b = Arc::new(CountingLimiter(AtomicUsize::new(0)));
        let combined = And::new(a.clone(), b.clone());
        combined.acquire().await;
        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn and_with_unlimited_defers_to_other_side() {
        let a = Arc::new(CountingLimiter(AtomicUsize::new(0)));
        let combined = And::new(a.clone(), Arc::new(Unlimited));
        combined.acquire().await;
        assert_eq!(a.0.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn token_limiter_allows_burst_up_to_initial_rate() {
        let limiter = TokenRateLimiter::new(4);
        for _ in 0..4 {
            tokio::time::timeout(StdDuration::from_millis(50), limiter.acquire())
                .await
                .expect("initial permits should be immediately available");
        }
    }
}
