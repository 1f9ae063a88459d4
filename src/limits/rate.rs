//! Distributed sliding-window rate limiter

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::store::ConstraintStore;
use crate::clock::SharedClock;
use crate::error::StoreError;

/// Current window occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateUsage {
    pub used: u32,
    pub limit: u32,
}

/// Fleet-wide request budget
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one slot if the window has room
    async fn acquire(&self) -> Result<bool, StoreError>;

    /// Poll [`RateLimiter::acquire`] until it succeeds or `max_wait` elapses
    async fn wait_for_slot(&self, max_wait: Duration) -> Result<bool, StoreError>;

    /// Slots used in the current window
    async fn usage(&self) -> Result<RateUsage, StoreError>;
}

/// `limit` requests per `window`, shared through a [`ConstraintStore`]
pub struct SlidingWindowRateLimiter {
    store: Arc<dyn ConstraintStore>,
    clock: SharedClock,
    key: String,
    limit: u32,
    window: Duration,
    poll_interval: Duration,
}

impl SlidingWindowRateLimiter {
    pub fn new(
        store: Arc<dyn ConstraintStore>,
        clock: SharedClock,
        key: impl Into<String>,
        limit: u32,
        window: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key: key.into(),
            limit,
            window,
            poll_interval,
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn acquire(&self) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        // Timestamp alone would collide when two workers share a millisecond
        let member = format!("{now}-{}", uuid::Uuid::new_v4());
        self.store
            .window_try_insert(&self.key, &member, now, self.window_ms(), self.limit)
            .await
    }

    async fn wait_for_slot(&self, max_wait: Duration) -> Result<bool, StoreError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.acquire().await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(key = %self.key, waited_ms = max_wait.as_millis() as u64, "rate limit wait timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn usage(&self) -> Result<RateUsage, StoreError> {
        let used = self
            .store
            .window_count(&self.key, self.clock.now_ms(), self.window_ms())
            .await?;
        Ok(RateUsage {
            used,
            limit: self.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limits::store::MemoryConstraintStore;

    fn limiter(clock: Arc<ManualClock>, limit: u32) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(
            Arc::new(MemoryConstraintStore::new()),
            clock,
            "test:rate",
            limit,
            Duration::from_secs(60),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_acquire_until_full() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock.clone(), 60);

        for _ in 0..60 {
            assert!(limiter.acquire().await.unwrap());
        }
        assert!(!limiter.acquire().await.unwrap());
        assert_eq!(limiter.usage().await.unwrap(), RateUsage { used: 60, limit: 60 });

        clock.advance(Duration::from_secs(60));
        assert!(limiter.acquire().await.unwrap());
        assert_eq!(limiter.usage().await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_wait_for_slot_times_out() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock, 1);

        assert!(limiter.wait_for_slot(Duration::from_millis(20)).await.unwrap());
        assert!(!limiter.wait_for_slot(Duration::from_millis(20)).await.unwrap());
    }
}
