//! Shared circuit breaker
//!
//! States:
//! - Closed: calls pass through; consecutive upstream failures are counted
//! - Open: calls fail fast until the reset timeout elapses
//! - HalfOpen: exactly one caller probes; its outcome closes or re-opens

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::store::{BreakerDecision, CircuitState, ConstraintStore};
use crate::clock::SharedClock;
use crate::error::StoreError;

/// Breaker state for status output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Fleet-wide breaker around the courier API
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Consult the breaker before a call
    ///
    /// When the cooldown has elapsed the first caller flips the breaker to
    /// half-open and gets [`BreakerDecision::Probe`]; everyone else keeps
    /// getting [`BreakerDecision::Reject`]. A probe holder must report back
    /// with a success, a failure or [`CircuitBreaker::release_probe`].
    async fn check(&self) -> Result<BreakerDecision, StoreError>;

    /// True when the caller must not call upstream
    async fn is_open(&self) -> Result<bool, StoreError> {
        Ok(self.check().await? == BreakerDecision::Reject)
    }

    /// Hand back a probe that ended before reaching upstream
    async fn release_probe(&self) -> Result<(), StoreError>;

    async fn record_success(&self) -> Result<(), StoreError>;

    async fn record_failure(&self) -> Result<(), StoreError>;

    async fn snapshot(&self) -> Result<BreakerSnapshot, StoreError>;
}

/// Breaker whose state lives in a [`ConstraintStore`]
pub struct SharedCircuitBreaker {
    store: Arc<dyn ConstraintStore>,
    clock: SharedClock,
    key: String,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl SharedCircuitBreaker {
    pub fn new(
        store: Arc<dyn ConstraintStore>,
        clock: SharedClock,
        key: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key: key.into(),
            failure_threshold,
            reset_timeout,
        }
    }
}

#[async_trait]
impl CircuitBreaker for SharedCircuitBreaker {
    async fn check(&self) -> Result<BreakerDecision, StoreError> {
        let reset_ms = i64::try_from(self.reset_timeout.as_millis()).unwrap_or(i64::MAX);
        let decision = self
            .store
            .breaker_check(&self.key, self.clock.now_ms(), reset_ms)
            .await?;

        if decision == BreakerDecision::Probe {
            tracing::info!(key = %self.key, "circuit half-open, allowing probe");
        }
        Ok(decision)
    }

    async fn release_probe(&self) -> Result<(), StoreError> {
        tracing::debug!(key = %self.key, "probe ended before upstream, releasing");
        self.store.breaker_release_probe(&self.key).await
    }

    async fn record_success(&self) -> Result<(), StoreError> {
        self.store.breaker_record_success(&self.key).await
    }

    async fn record_failure(&self) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let record = self
            .store
            .breaker_record_failure(&self.key, now, self.failure_threshold)
            .await?;

        if record.state == CircuitState::Open && record.opened_at_ms == Some(now) {
            tracing::warn!(
                key = %self.key,
                failures = record.failures,
                reset_secs = self.reset_timeout.as_secs(),
                "circuit opened"
            );
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<BreakerSnapshot, StoreError> {
        let record = self.store.breaker_snapshot(&self.key).await?;
        Ok(BreakerSnapshot {
            state: record.state,
            failures: record.failures,
            opened_at: record
                .opened_at_ms
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limits::store::MemoryConstraintStore;

    fn breaker(clock: Arc<ManualClock>) -> SharedCircuitBreaker {
        SharedCircuitBreaker::new(
            Arc::new(MemoryConstraintStore::new()),
            clock,
            "test:breaker",
            5,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = breaker(clock);

        for _ in 0..4 {
            breaker.record_failure().await.unwrap();
            assert!(!breaker.is_open().await.unwrap());
        }
        breaker.record_failure().await.unwrap();
        assert!(breaker.is_open().await.unwrap());

        let snapshot = breaker.snapshot().await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failures, 5);
        assert!(snapshot.opened_at.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = breaker(clock);

        for _ in 0..4 {
            breaker.record_failure().await.unwrap();
        }
        breaker.record_success().await.unwrap();
        breaker.record_failure().await.unwrap();
        assert!(!breaker.is_open().await.unwrap());
        assert_eq!(breaker.snapshot().await.unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_single_probe_then_close() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure().await.unwrap();
        }

        clock.advance(Duration::from_secs(60));
        assert!(!breaker.is_open().await.unwrap(), "first caller probes");
        assert!(breaker.is_open().await.unwrap(), "second caller is held back");
        assert_eq!(breaker.snapshot().await.unwrap().state, CircuitState::HalfOpen);

        breaker.record_success().await.unwrap();
        assert!(!breaker.is_open().await.unwrap());
        assert_eq!(breaker.snapshot().await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_released_trial_goes_to_next_caller() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure().await.unwrap();
        }

        clock.advance(Duration::from_secs(60));
        assert_eq!(breaker.check().await.unwrap(), BreakerDecision::Probe);
        assert_eq!(breaker.check().await.unwrap(), BreakerDecision::Reject);

        breaker.release_probe().await.unwrap();
        assert_eq!(breaker.check().await.unwrap(), BreakerDecision::Probe);
        assert_eq!(breaker.snapshot().await.unwrap().state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let clock = Arc::new(ManualClock::starting_now());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure().await.unwrap();
        }

        clock.advance(Duration::from_secs(61));
        assert!(!breaker.is_open().await.unwrap());
        breaker.record_failure().await.unwrap();

        assert!(breaker.is_open().await.unwrap());
        assert_eq!(breaker.snapshot().await.unwrap().state, CircuitState::Open);

        clock.advance(Duration::from_secs(59));
        assert!(breaker.is_open().await.unwrap());
    }
}
