//! Distributed concurrency semaphore
//!
//! Slots live in the same kind of scored set as the rate window, keyed by the
//! caller's request id. An explicit release frees the slot early; otherwise it
//! expires after the TTL, so a crashed worker cannot leak capacity.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::store::ConstraintStore;
use crate::clock::SharedClock;
use crate::error::StoreError;

/// Fleet-wide in-flight call ceiling
#[async_trait]
pub trait ConcurrencyLimiter: Send + Sync {
    /// Claim a slot for `request_id`; re-claiming refreshes its TTL
    async fn acquire(&self, request_id: &str) -> Result<bool, StoreError>;

    /// Free the slot held by `request_id`
    async fn release(&self, request_id: &str) -> Result<(), StoreError>;

    /// Slots currently held
    async fn current(&self) -> Result<u32, StoreError>;

    /// Configured ceiling
    fn capacity(&self) -> u32;

    /// Poll [`ConcurrencyLimiter::acquire`] until it succeeds or `max_wait` elapses
    async fn wait_for_permit(
        &self,
        request_id: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<bool, StoreError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.acquire(request_id).await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Semaphore over a [`ConstraintStore`] scored set
pub struct DistributedSemaphore {
    store: Arc<dyn ConstraintStore>,
    clock: SharedClock,
    key: String,
    capacity: u32,
    ttl: Duration,
}

impl DistributedSemaphore {
    pub fn new(
        store: Arc<dyn ConstraintStore>,
        clock: SharedClock,
        key: impl Into<String>,
        capacity: u32,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key: key.into(),
            capacity,
            ttl,
        }
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl ConcurrencyLimiter for DistributedSemaphore {
    async fn acquire(&self, request_id: &str) -> Result<bool, StoreError> {
        self.store
            .window_try_insert(
                &self.key,
                request_id,
                self.clock.now_ms(),
                self.ttl_ms(),
                self.capacity,
            )
            .await
    }

    async fn release(&self, request_id: &str) -> Result<(), StoreError> {
        self.store.window_remove(&self.key, request_id).await
    }

    async fn current(&self) -> Result<u32, StoreError> {
        self.store
            .window_count(&self.key, self.clock.now_ms(), self.ttl_ms())
            .await
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// A held semaphore slot
///
/// Dropping the permit without calling [`SemaphorePermit::release`] (for
/// example when the owning future is cancelled at a batch deadline) hands the
/// release to a background task, so the slot does not sit idle until its TTL.
pub struct SemaphorePermit {
    limiter: Arc<dyn ConcurrencyLimiter>,
    request_id: String,
    released: bool,
}

impl SemaphorePermit {
    /// Wait up to `max_wait` for a slot tagged with `request_id`
    pub async fn acquire(
        limiter: Arc<dyn ConcurrencyLimiter>,
        request_id: impl Into<String>,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<Option<Self>, StoreError> {
        let request_id = request_id.into();
        if !limiter
            .wait_for_permit(&request_id, max_wait, poll_interval)
            .await?
        {
            return Ok(None);
        }
        Ok(Some(Self {
            limiter,
            request_id,
            released: false,
        }))
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Free the slot now
    pub async fn release(mut self) -> Result<(), StoreError> {
        let result = self.limiter.release(&self.request_id).await;
        self.released = true;
        result
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let limiter = self.limiter.clone();
        let request_id = std::mem::take(&mut self.request_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = limiter.release(&request_id).await {
                        tracing::warn!(
                            request_id = %request_id,
                            error = %e,
                            "Deferred semaphore release failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    "Permit dropped outside a runtime, slot will expire"
                );
            }
        }
    }
}
