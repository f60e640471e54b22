//! Per-statement rate limiting (spec.md §4.2 "Compose rate limiters",
//! §4.3.3 "Rate-limit: if the statement's Begin=true, block on the TPS
//! channel; always block on the QPS channel").

use async_trait::async_trait;

/// A token source a client blocks on before executing a statement. The
/// allocator composes these (stage, exec-group, client-group, per-client)
/// via [`And`] so a token is only emitted when every level would emit one.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self);
}

/// No limit configured at this level.
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        tokio::time::timeout(Duration::from_millis(10), Unlimited.acquire())
            .await
            .expect("unlimited must return immediately");
    }
}
