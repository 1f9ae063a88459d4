//! Shared Constraint Store
//!
//! The three limiters keep all of their state behind [`ConstraintStore`]. Every
//! method is one atomic read-modify-write: the Redis backend runs each as a
//! single Lua script, the memory backend holds one mutex for the whole call.
//! A check-then-insert split across two round trips would let two workers both
//! see "count < limit" and both proceed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::error::StoreError;

/// Breaker status as stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }

    /// Parse the stored representation; anything unknown reads as closed
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    /// Numeric gauge value (0 closed, 1 half-open, 2 open)
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of consulting the breaker before a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Closed; go ahead
    Allow,
    /// This caller moved the breaker to half-open and owns the probe
    Probe,
    /// Open, or half-open with someone else probing
    Reject,
}

/// Raw breaker record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub failures: u32,
    pub opened_at_ms: Option<i64>,
    pub probe_at_ms: Option<i64>,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at_ms: None,
            probe_at_ms: None,
        }
    }
}

/// Atomic primitives shared by the rate limiter, semaphore and breaker
#[async_trait]
pub trait ConstraintStore: Send + Sync {
    /// Prune members scored at or before `now_ms - window_ms`, then admit
    /// `member` if it is already present (its score is refreshed) or if fewer
    /// than `limit` members remain. Returns whether the member is now held.
    async fn window_try_insert(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<bool, StoreError>;

    /// Remove a member early
    async fn window_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Members still inside the window
    async fn window_count(&self, key: &str, now_ms: i64, window_ms: i64)
        -> Result<u32, StoreError>;

    /// Decide whether a call may proceed, moving open to half-open once
    /// `reset_ms` has elapsed since it opened (or since the last probe).
    async fn breaker_check(
        &self,
        key: &str,
        now_ms: i64,
        reset_ms: i64,
    ) -> Result<BreakerDecision, StoreError>;

    /// Count one failure; opens at `threshold` or immediately from half-open
    async fn breaker_record_failure(
        &self,
        key: &str,
        now_ms: i64,
        threshold: u32,
    ) -> Result<BreakerRecord, StoreError>;

    /// Give back a half-open probe that never reached upstream, so the next
    /// check issues a fresh one instead of waiting out another reset timeout
    async fn breaker_release_probe(&self, key: &str) -> Result<(), StoreError>;

    /// Close the breaker and clear the failure count
    async fn breaker_record_success(&self, key: &str) -> Result<(), StoreError>;

    /// Read the breaker without changing it
    async fn breaker_snapshot(&self, key: &str) -> Result<BreakerRecord, StoreError>;

    /// Check the backend is reachable
    async fn ping(&self) -> Result<(), StoreError>;
}

// ============================================================================
// Pure transitions (shared by the memory backend and mirrored in Lua)
// ============================================================================

pub(crate) fn check_transition(
    record: &mut BreakerRecord,
    now_ms: i64,
    reset_ms: i64,
) -> BreakerDecision {
    match record.state {
        CircuitState::Closed => BreakerDecision::Allow,
        CircuitState::Open => {
            let opened = record.opened_at_ms.unwrap_or(0);
            if now_ms - opened >= reset_ms {
                record.state = CircuitState::HalfOpen;
                record.probe_at_ms = Some(now_ms);
                BreakerDecision::Probe
            } else {
                BreakerDecision::Reject
            }
        }
        CircuitState::HalfOpen => {
            let probe = record.probe_at_ms.unwrap_or(0);
            // Probe holder never reported back
            if now_ms - probe >= reset_ms {
                record.probe_at_ms = Some(now_ms);
                BreakerDecision::Probe
            } else {
                BreakerDecision::Reject
            }
        }
    }
}

pub(crate) fn release_probe_transition(record: &mut BreakerRecord) {
    if record.state == CircuitState::HalfOpen {
        record.probe_at_ms = None;
    }
}

pub(crate) fn failure_transition(record: &mut BreakerRecord, now_ms: i64, threshold: u32) {
    record.failures = record.failures.saturating_add(1);
    match record.state {
        CircuitState::HalfOpen => {
            record.state = CircuitState::Open;
            record.opened_at_ms = Some(now_ms);
            record.probe_at_ms = None;
        }
        CircuitState::Closed if record.failures >= threshold => {
            record.state = CircuitState::Open;
            record.opened_at_ms = Some(now_ms);
        }
        _ => {}
    }
}

// ============================================================================
// Memory backend
// ============================================================================

#[derive(Default)]
struct MemoryState {
    windows: HashMap<String, HashMap<String, i64>>,
    breakers: HashMap<String, BreakerRecord>,
}

/// Process-local store; enforces limits only among tasks of one process
#[derive(Default)]
pub struct MemoryConstraintStore {
    state: Mutex<MemoryState>,
}

impl MemoryConstraintStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn prune(window: &mut HashMap<String, i64>, now_ms: i64, window_ms: i64) {
    let cutoff = now_ms - window_ms;
    window.retain(|_, score| *score > cutoff);
}

#[async_trait]
impl ConstraintStore for MemoryConstraintStore {
    async fn window_try_insert(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let window = state.windows.entry(key.to_string()).or_default();
        prune(window, now_ms, window_ms);

        if let Some(score) = window.get_mut(member) {
            *score = now_ms;
            return Ok(true);
        }
        if window.len() < limit as usize {
            window.insert(member.to_string(), now_ms);
            return Ok(true);
        }
        Ok(false)
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(window) = state.windows.get_mut(key) {
            window.remove(member);
        }
        Ok(())
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<u32, StoreError> {
        let mut state = self.lock()?;
        let Some(window) = state.windows.get_mut(key) else {
            return Ok(0);
        };
        prune(window, now_ms, window_ms);
        Ok(u32::try_from(window.len()).unwrap_or(u32::MAX))
    }

    async fn breaker_check(
        &self,
        key: &str,
        now_ms: i64,
        reset_ms: i64,
    ) -> Result<BreakerDecision, StoreError> {
        let mut state = self.lock()?;
        let record = state.breakers.entry(key.to_string()).or_default();
        Ok(check_transition(record, now_ms, reset_ms))
    }

    async fn breaker_record_failure(
        &self,
        key: &str,
        now_ms: i64,
        threshold: u32,
    ) -> Result<BreakerRecord, StoreError> {
        let mut state = self.lock()?;
        let record = state.breakers.entry(key.to_string()).or_default();
        failure_transition(record, now_ms, threshold);
        Ok(*record)
    }

    async fn breaker_release_probe(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(record) = state.breakers.get_mut(key) {
            release_probe_transition(record);
        }
        Ok(())
    }

    async fn breaker_record_success(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state
            .breakers
            .insert(key.to_string(), BreakerRecord::default());
        Ok(())
    }

    async fn breaker_snapshot(&self, key: &str) -> Result<BreakerRecord, StoreError> {
        let state = self.lock()?;
        Ok(state.breakers.get(key).copied().unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_admits_up_to_limit() {
        let store = MemoryConstraintStore::new();
        for i in 0..3 {
            assert!(store
                .window_try_insert("k", &format!("m{i}"), 1_000, 60_000, 3)
                .await
                .unwrap());
        }
        assert!(!store.window_try_insert("k", "m4", 1_000, 60_000, 3).await.unwrap());
        assert_eq!(store.window_count("k", 1_000, 60_000).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_window_prunes_expired_members() {
        let store = MemoryConstraintStore::new();
        assert!(store.window_try_insert("k", "a", 0, 60_000, 1).await.unwrap());
        assert!(!store.window_try_insert("k", "b", 59_999, 60_000, 1).await.unwrap());
        assert!(store.window_try_insert("k", "b", 60_000, 60_000, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_existing_member_is_refreshed() {
        let store = MemoryConstraintStore::new();
        assert!(store.window_try_insert("k", "a", 0, 10_000, 1).await.unwrap());
        // Full, but "a" already holds the slot
        assert!(store.window_try_insert("k", "a", 9_000, 10_000, 1).await.unwrap());
        // Refreshed score keeps it alive past the original expiry
        assert_eq!(store.window_count("k", 15_000, 10_000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_remove() {
        let store = MemoryConstraintStore::new();
        store.window_try_insert("k", "a", 0, 10_000, 1).await.unwrap();
        store.window_remove("k", "a").await.unwrap();
        assert!(store.window_try_insert("k", "b", 1, 10_000, 1).await.unwrap());
    }

    #[test]
    fn test_breaker_transitions() {
        let mut record = BreakerRecord::default();
        for _ in 0..4 {
            failure_transition(&mut record, 0, 5);
            assert_eq!(record.state, CircuitState::Closed);
        }
        failure_transition(&mut record, 100, 5);
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.opened_at_ms, Some(100));

        assert_eq!(check_transition(&mut record, 1_000, 60_000), BreakerDecision::Reject);
        assert_eq!(check_transition(&mut record, 60_100, 60_000), BreakerDecision::Probe);
        assert_eq!(record.state, CircuitState::HalfOpen);
        assert_eq!(check_transition(&mut record, 60_200, 60_000), BreakerDecision::Reject);

        failure_transition(&mut record, 60_300, 5);
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.opened_at_ms, Some(60_300));
    }

    #[test]
    fn test_abandoned_probe_is_reissued() {
        let mut record = BreakerRecord {
            state: CircuitState::HalfOpen,
            failures: 5,
            opened_at_ms: Some(0),
            probe_at_ms: Some(60_000),
        };
        assert_eq!(check_transition(&mut record, 90_000, 60_000), BreakerDecision::Reject);
        assert_eq!(check_transition(&mut record, 120_000, 60_000), BreakerDecision::Probe);
    }

    #[test]
    fn test_released_trial_is_reissued_at_once() {
        let mut record = BreakerRecord {
            state: CircuitState::HalfOpen,
            failures: 5,
            opened_at_ms: Some(0),
            probe_at_ms: Some(60_000),
        };
        assert_eq!(check_transition(&mut record, 60_500, 60_000), BreakerDecision::Reject);

        release_probe_transition(&mut record);
        assert_eq!(check_transition(&mut record, 60_600, 60_000), BreakerDecision::Probe);
        assert_eq!(check_transition(&mut record, 60_700, 60_000), BreakerDecision::Reject);
    }

    #[test]
    fn test_release_leaves_other_states_alone() {
        let mut open = BreakerRecord {
            state: CircuitState::Open,
            failures: 5,
            opened_at_ms: Some(1_000),
            probe_at_ms: None,
        };
        release_probe_transition(&mut open);
        assert_eq!(open.state, CircuitState::Open);
        assert_eq!(check_transition(&mut open, 2_000, 60_000), BreakerDecision::Reject);
    }

    #[test]
    fn test_circuit_state_strings() {
        for state in [CircuitState::Closed, CircuitState::HalfOpen, CircuitState::Open] {
            assert_eq!(CircuitState::parse(state.as_str()), state);
        }
        assert_eq!(CircuitState::parse("garbage"), CircuitState::Closed);
    }
}
