//! Fleet-wide limits on calls to the courier API
//!
//! Three independent limiters guard every upstream call, all keeping their
//! state in a Shared Constraint Store so the limits hold across processes.
//!
//! # Architecture
//!
//! - [`store`] - `ConstraintStore` primitives and the in-memory backend
//! - [`redis`] - Redis backend (Lua scripts)
//! - [`rate`] - sliding-window rate limiter (60 requests / 60 s)
//! - [`semaphore`] - concurrency semaphore with TTL slots (20)
//! - [`breaker`] - shared closed/open/half-open circuit breaker
//! - [`stub`] - permissive implementations for `LIMITER_BACKEND=none`
//!
//! # Usage
//!
//! ```rust,ignore
//! use awbsync::limits::Limits;
//!
//! let limits = Limits::from_config(&config, clock.clone()).await?;
//! if !limits.breaker.is_open().await? && limits.rate.wait_for_slot(limits.rate_wait).await? {
//!     // call upstream
//! }
//! ```

pub mod breaker;
pub mod rate;
pub mod redis;
pub mod semaphore;
pub mod store;
pub mod stub;

pub use breaker::{BreakerSnapshot, CircuitBreaker, SharedCircuitBreaker};
pub use rate::{RateLimiter, RateUsage, SlidingWindowRateLimiter};
pub use semaphore::{ConcurrencyLimiter, DistributedSemaphore, SemaphorePermit};
pub use store::{BreakerDecision, CircuitState, ConstraintStore, MemoryConstraintStore};
pub use stub::{DisabledCircuitBreaker, UnboundedSemaphore, UnlimitedRateLimiter};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::{Config, LimiterBackend, LimitsConfig};

/// Key of the upstream rate window
pub fn rate_key(prefix: &str) -> String {
    format!("{prefix}:ratelimit:upstream")
}

/// Key of the upstream semaphore set
pub fn semaphore_key(prefix: &str) -> String {
    format!("{prefix}:semaphore:upstream")
}

/// Key of the upstream breaker hash
pub fn breaker_key(prefix: &str) -> String {
    format!("{prefix}:breaker:upstream")
}

/// The limiter trio plus the wait budgets the worker applies
#[derive(Clone)]
pub struct Limits {
    pub rate: Arc<dyn RateLimiter>,
    pub semaphore: Arc<dyn ConcurrencyLimiter>,
    pub breaker: Arc<dyn CircuitBreaker>,
    pub rate_wait: Duration,
    pub semaphore_wait: Duration,
    pub poll_interval: Duration,
}

impl Limits {
    /// Build the limiters selected by `LIMITER_BACKEND`
    ///
    /// An unreachable Redis is a startup error rather than a silent fallback.
    pub async fn from_config(config: &Config, clock: SharedClock) -> Result<Self> {
        match config.limits.backend {
            LimiterBackend::Redis => {
                let store = redis::RedisConstraintStore::connect(&config.redis).await?;
                Ok(Self::with_store(
                    Arc::new(store),
                    &config.limits,
                    &config.redis.key_prefix,
                    clock,
                ))
            }
            LimiterBackend::Memory => {
                tracing::warn!("using in-process limiter store; limits hold for this process only");
                Ok(Self::with_store(
                    Arc::new(MemoryConstraintStore::new()),
                    &config.limits,
                    &config.redis.key_prefix,
                    clock,
                ))
            }
            LimiterBackend::None => {
                tracing::warn!("limiters disabled; upstream quota is not enforced");
                Ok(Self::permissive(&config.limits))
            }
        }
    }

    /// Real limiters over `store`
    pub fn with_store(
        store: Arc<dyn ConstraintStore>,
        limits: &LimitsConfig,
        prefix: &str,
        clock: SharedClock,
    ) -> Self {
        let poll_interval = Duration::from_millis(limits.poll_interval_ms);

        let rate = SlidingWindowRateLimiter::new(
            store.clone(),
            clock.clone(),
            rate_key(prefix),
            limits.requests_per_window,
            Duration::from_secs(limits.window_secs),
            poll_interval,
        );
        let semaphore = DistributedSemaphore::new(
            store.clone(),
            clock.clone(),
            semaphore_key(prefix),
            limits.max_concurrent_requests,
            Duration::from_secs(limits.semaphore_ttl_secs),
        );
        let breaker = SharedCircuitBreaker::new(
            store,
            clock,
            breaker_key(prefix),
            limits.circuit_failure_threshold,
            Duration::from_secs(limits.circuit_reset_timeout_secs),
        );

        Self {
            rate: Arc::new(rate),
            semaphore: Arc::new(semaphore),
            breaker: Arc::new(breaker),
            rate_wait: Duration::from_millis(limits.rate_wait_timeout_ms),
            semaphore_wait: Duration::from_millis(limits.semaphore_wait_timeout_ms),
            poll_interval,
        }
    }

    /// No-limit stubs
    pub fn permissive(limits: &LimitsConfig) -> Self {
        Self {
            rate: Arc::new(UnlimitedRateLimiter::new(limits.requests_per_window)),
            semaphore: Arc::new(UnboundedSemaphore::new(limits.max_concurrent_requests)),
            breaker: Arc::new(DisabledCircuitBreaker),
            rate_wait: Duration::from_millis(limits.rate_wait_timeout_ms),
            semaphore_wait: Duration::from_millis(limits.semaphore_wait_timeout_ms),
            poll_interval: Duration::from_millis(limits.poll_interval_ms),
        }
    }
}
