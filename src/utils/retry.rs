//! Capped exponential backoff
//!
//! One [`Backoff`] schedule serves two callers: the binary retrying its
//! backend connections at startup, and the job queues spacing out redelivery
//! of failed jobs.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::QueueConfig;

/// Delay schedule: `base * factor^(attempt - 1)`, capped at `max`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Backoff {
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            base,
            max,
            factor: 2,
        }
    }

    /// Backend connections at process start: 1s, 2s, 4s, 8s, 15s
    pub fn startup() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(15))
    }

    /// Redelivery schedule for jobs that failed as a whole
    pub fn for_queue(queue: &QueueConfig) -> Self {
        Self::new(
            queue.max_attempts.saturating_sub(1),
            Duration::from_millis(queue.backoff_base_ms),
            Duration::from_millis(queue.backoff_max_ms),
        )
    }

    /// Wait before `attempt`; attempt 0 runs immediately
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base
            .saturating_mul(self.factor.saturating_pow(attempt - 1))
            .min(self.max)
    }
}

/// Run `operation` until it succeeds or the schedule runs out
///
/// `what` names the operation in log lines.
///
/// ```no_run
/// use awbsync::utils::retry::{retry, Backoff};
///
/// # async fn example(config: awbsync::config::Config) -> anyhow::Result<()> {
/// let store = retry(&Backoff::startup(), "open shipment store", || {
///     awbsync::storage::from_config(&config)
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry<T, F, Fut>(backoff: &Backoff, what: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(backoff, what, operation, |_| true).await
}

/// Like [`retry`], but gives up at once on errors `should_retry` rejects
pub async fn retry_if<T, F, Fut, P>(
    backoff: &Backoff,
    what: &str,
    operation: F,
    should_retry: P,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= backoff.max_retries || !should_retry(&e) => return Err(e),
            Err(e) => {
                attempt += 1;
                let delay = backoff.delay(attempt);
                warn!(
                    what,
                    attempt,
                    max_retries = backoff.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
