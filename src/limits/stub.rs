//! Permissive limiters used when no constraint store is configured

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::rate::{RateLimiter, RateUsage};
use super::semaphore::ConcurrencyLimiter;
use super::store::{BreakerDecision, CircuitState};
use crate::error::StoreError;

/// Always grants a slot
#[derive(Debug, Default)]
pub struct UnlimitedRateLimiter {
    limit: u32,
}

impl UnlimitedRateLimiter {
    /// `limit` is only reported, never enforced
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl RateLimiter for UnlimitedRateLimiter {
    async fn acquire(&self) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn wait_for_slot(&self, _max_wait: Duration) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn usage(&self) -> Result<RateUsage, StoreError> {
        Ok(RateUsage {
            used: 0,
            limit: self.limit,
        })
    }
}

/// Always grants a permit; tracks holders in this process only
#[derive(Debug, Default)]
pub struct UnboundedSemaphore {
    capacity: u32,
    holders: Mutex<HashSet<String>>,
}

impl UnboundedSemaphore {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            holders: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ConcurrencyLimiter for UnboundedSemaphore {
    async fn acquire(&self, request_id: &str) -> Result<bool, StoreError> {
        self.holders
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(request_id.to_string());
        Ok(true)
    }

    async fn release(&self, request_id: &str) -> Result<(), StoreError> {
        self.holders
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .remove(request_id);
        Ok(())
    }

    async fn current(&self) -> Result<u32, StoreError> {
        let holders = self.holders.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(u32::try_from(holders.len()).unwrap_or(u32::MAX))
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Never opens
#[derive(Debug, Default)]
pub struct DisabledCircuitBreaker;

#[async_trait]
impl CircuitBreaker for DisabledCircuitBreaker {
    async fn check(&self) -> Result<BreakerDecision, StoreError> {
        Ok(BreakerDecision::Allow)
    }

    async fn release_probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_success(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_failure(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<BreakerSnapshot, StoreError> {
        Ok(BreakerSnapshot {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stubs_never_block() {
        let rate = UnlimitedRateLimiter::new(60);
        for _ in 0..1_000 {
            assert!(rate.acquire().await.unwrap());
        }

        let sem = UnboundedSemaphore::new(20);
        for i in 0..50 {
            assert!(sem.acquire(&i.to_string()).await.unwrap());
        }
        assert_eq!(sem.current().await.unwrap(), 50);
        sem.release("0").await.unwrap();
        assert_eq!(sem.current().await.unwrap(), 49);

        let breaker = DisabledCircuitBreaker;
        for _ in 0..10 {
            breaker.record_failure().await.unwrap();
        }
        assert!(!breaker.is_open().await.unwrap());
    }
}
