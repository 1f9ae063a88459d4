//! Sweep scheduler
//!
//! Decides which shipments are due and turns them into queue jobs.
//!
//! # Overview
//!
//! Three sweeps run on fixed cadences (see [`SweepTicker`]):
//!
//! - **Full sweep** (hourly): up to `FULL_SWEEP_LIMIT` due shipments ordered by
//!   priority, staleness and prior failures, cut into batches of `BATCH_SIZE`.
//!   Batch `i` is enqueued with a delay of `i × BATCH_STAGGER_MS` so the fleet
//!   does not hit the rate limiter in one burst.
//! - **Priority sweep** (every 15 minutes): due shipments in volatile statuses
//!   (out for delivery, undelivered), enqueued at high priority.
//! - **Retention sweep** (daily): purges old audit-log and batch rows.
//!
//! Enqueued shipments have `next_sync_at` pushed out by `ENQUEUE_LEASE_SECS`
//! so the next sweep does not select them again while their job is waiting.
//! The worker overwrites it when the shipment is processed.
//!
//! # Overlap
//!
//! Each sweep kind holds its own lock. A sweep that finds the previous run of
//! the same kind still going returns [`SweepOutcome::Skipped`].
//!
//! # Modules
//!
//! - [`policy`] - next-sync interval and failure backoff
//! - [`ticker`] - internal timer driving the three sweeps

pub mod policy;
pub mod ticker;

pub use policy::{backoff_multiplier, next_sync_at, sync_interval};
pub use ticker::SweepTicker;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::Result;
use crate::metrics;
use crate::models::{BatchCounters, BatchStatus, JobKind, StatusClass, SyncBatch, SyncJob};
use crate::queue::JobQueue;
use crate::storage::ShipmentStore;
use crate::utils::chrono_duration;

// ============================================================================
// Types
// ============================================================================

/// The three scheduler passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    Full,
    Priority,
    Retention,
}

impl SweepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepKind::Full => "full",
            SweepKind::Priority => "priority",
            SweepKind::Retention => "retention",
        }
    }
}

impl std::str::FromStr for SweepKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SweepKind::Full),
            "priority" => Ok(SweepKind::Priority),
            "retention" => Ok(SweepKind::Retention),
            other => Err(format!("unknown sweep '{other}' (full, priority, retention)")),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    /// The previous sweep of the same kind was still running
    Skipped,
    /// Due shipments were batched and enqueued
    Enqueued { selected: usize, jobs: usize },
    /// Old rows were deleted
    Purged { logs: u64, batches: u64 },
}

/// Scheduler settings derived from [`Config`]
#[derive(Debug, Clone)]
struct SweepSettings {
    batch_size: usize,
    full_limit: usize,
    priority_limit: usize,
    stagger: Duration,
    enqueue_lease: ChronoDuration,
    log_retention: ChronoDuration,
    batch_retention: ChronoDuration,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Selects due shipments and enqueues sync jobs
pub struct Scheduler {
    store: Arc<dyn ShipmentStore>,
    queue: Arc<dyn JobQueue>,
    clock: SharedClock,
    settings: SweepSettings,
    full_lock: Mutex<()>,
    priority_lock: Mutex<()>,
    retention_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ShipmentStore>,
        queue: Arc<dyn JobQueue>,
        clock: SharedClock,
        config: &Config,
    ) -> Self {
        let s = &config.scheduler;
        Self {
            store,
            queue,
            clock,
            settings: SweepSettings {
                batch_size: config.worker.batch_size.max(1),
                full_limit: s.full_sweep_limit,
                priority_limit: s.priority_sweep_limit,
                stagger: Duration::from_millis(s.batch_stagger_ms),
                enqueue_lease: chrono_duration(Duration::from_secs(s.enqueue_lease_secs)),
                log_retention: ChronoDuration::days(i64::from(s.log_retention_days)),
                batch_retention: ChronoDuration::days(i64::from(s.batch_retention_days)),
            },
            full_lock: Mutex::new(()),
            priority_lock: Mutex::new(()),
            retention_lock: Mutex::new(()),
        }
    }

    /// AWBs per enqueued job
    pub fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    /// Run one sweep of the given kind
    pub async fn run(&self, kind: SweepKind) -> Result<SweepOutcome> {
        let result = match kind {
            SweepKind::Full => self.full_sweep().await,
            SweepKind::Priority => self.priority_sweep().await,
            SweepKind::Retention => self.retention_sweep().await,
        };

        match &result {
            Ok(SweepOutcome::Skipped) => metrics::record_sweep(kind.as_str(), "skipped", 0),
            Ok(SweepOutcome::Enqueued { selected, .. }) => {
                metrics::record_sweep(kind.as_str(), "ran", *selected)
            }
            Ok(SweepOutcome::Purged { .. }) => metrics::record_sweep(kind.as_str(), "ran", 0),
            Err(e) => {
                tracing::error!(sweep = kind.as_str(), error = %e, "sweep failed");
                metrics::record_sweep(kind.as_str(), "error", 0);
            }
        }
        result
    }

    /// Enqueue every due shipment, staggered batch by batch
    pub async fn full_sweep(&self) -> Result<SweepOutcome> {
        let Ok(_guard) = self.full_lock.try_lock() else {
            tracing::info!(sweep = "full", "previous full sweep still running, skipping");
            return Ok(SweepOutcome::Skipped);
        };

        let now = self.clock.now();
        let due = self.store.select_due(now, self.settings.full_limit).await?;
        let awbs: Vec<String> = due.into_iter().map(|d| d.awb).collect();

        let jobs = self
            .enqueue_chunks(&awbs, JobKind::FullSweep, self.settings.stagger)
            .await?;

        tracing::info!(sweep = "full", selected = awbs.len(), jobs, "full sweep enqueued");
        Ok(SweepOutcome::Enqueued {
            selected: awbs.len(),
            jobs,
        })
    }

    /// Enqueue due shipments in volatile statuses at high priority
    pub async fn priority_sweep(&self) -> Result<SweepOutcome> {
        let Ok(_guard) = self.priority_lock.try_lock() else {
            tracing::info!(sweep = "priority", "previous priority sweep still running, skipping");
            return Ok(SweepOutcome::Skipped);
        };

        let now = self.clock.now();
        let due = self
            .store
            .select_volatile_due(now, &StatusClass::volatile_codes(), self.settings.priority_limit)
            .await?;
        let awbs: Vec<String> = due.into_iter().map(|d| d.awb).collect();

        let jobs = self
            .enqueue_chunks(&awbs, JobKind::PrioritySweep, Duration::ZERO)
            .await?;

        tracing::info!(sweep = "priority", selected = awbs.len(), jobs, "priority sweep enqueued");
        Ok(SweepOutcome::Enqueued {
            selected: awbs.len(),
            jobs,
        })
    }

    /// Purge audit-log and finished batch rows past their retention windows
    pub async fn retention_sweep(&self) -> Result<SweepOutcome> {
        let Ok(_guard) = self.retention_lock.try_lock() else {
            tracing::info!(sweep = "retention", "previous retention sweep still running, skipping");
            return Ok(SweepOutcome::Skipped);
        };

        let now = self.clock.now();
        let logs = self
            .store
            .purge_logs(now - self.settings.log_retention)
            .await?;
        let batches = self
            .store
            .purge_batches(now - self.settings.batch_retention)
            .await?;

        metrics::record_purged("sync_logs", logs);
        metrics::record_purged("sync_batches", batches);
        tracing::info!(sweep = "retention", logs, batches, "retention sweep purged rows");

        Ok(SweepOutcome::Purged { logs, batches })
    }

    /// Enqueue one job for `awbs` after `delay`
    ///
    /// Records the pending batch row first, then the queue entry, then pushes
    /// the shipments' `next_sync_at` out by the enqueue lease.
    pub async fn enqueue_batch(
        &self,
        awbs: Vec<String>,
        kind: JobKind,
        delay: Duration,
    ) -> Result<SyncJob> {
        let now = self.clock.now();
        let job = SyncJob::new(awbs, kind);

        self.store
            .create_batch(&SyncBatch {
                batch_id: job.batch_id.clone(),
                total_awbs: i32::try_from(job.awbs.len()).unwrap_or(i32::MAX),
                counters: BatchCounters::default(),
                status: BatchStatus::Pending,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .await?;

        self.queue.enqueue(&job, delay).await?;
        self.store
            .mark_enqueued(&job.awbs, now + self.settings.enqueue_lease)
            .await?;

        tracing::debug!(
            batch_id = %job.batch_id,
            kind = kind.as_str(),
            awbs = job.awbs.len(),
            delay_ms = delay.as_millis() as u64,
            "batch enqueued"
        );
        Ok(job)
    }

    async fn enqueue_chunks(&self, awbs: &[String], kind: JobKind, stagger: Duration) -> Result<usize> {
        let mut jobs = 0usize;
        for (index, chunk) in awbs.chunks(self.settings.batch_size).enumerate() {
            let delay = stagger.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
            self.enqueue_batch(chunk.to_vec(), kind, delay).await?;
            jobs += 1;
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{QueueBackend, QueueConfig};
    use crate::queue::MemoryJobQueue;
    use crate::storage::SqliteStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<SqliteStore>,
        queue: Arc<MemoryJobQueue>,
        scheduler: Scheduler,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue_config = QueueConfig {
            backend: QueueBackend::Memory,
            max_attempts: 3,
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
        };
        let queue = Arc::new(MemoryJobQueue::new(&queue_config, clock.clone()));
        let mut config = Config::default();
        config.worker.batch_size = batch_size;
        let scheduler = Scheduler::new(store.clone(), queue.clone(), clock.clone(), &config);
        Fixture {
            clock,
            store,
            queue,
            scheduler,
        }
    }

    fn awbs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("AWB{i:04}")).collect()
    }

    #[tokio::test]
    async fn test_full_sweep_batches_and_staggers() {
        let f = fixture(20);
        f.store.insert_new(&awbs(45), f.clock.now()).await.unwrap();

        let outcome = f.scheduler.run(SweepKind::Full).await.unwrap();
        assert_eq!(outcome, SweepOutcome::Enqueued { selected: 45, jobs: 3 });

        // Only the first batch is visible immediately
        let depth = f.queue.depth().await.unwrap();
        assert_eq!((depth.waiting, depth.delayed), (1, 2));

        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.queue.depth().await.unwrap().waiting, 3);
        assert_eq!(f.store.recent_batches(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_enqueued_shipments_are_not_reselected() {
        let f = fixture(20);
        f.store.insert_new(&awbs(3), f.clock.now()).await.unwrap();

        f.scheduler.full_sweep().await.unwrap();
        let again = f.scheduler.full_sweep().await.unwrap();
        assert_eq!(again, SweepOutcome::Enqueued { selected: 0, jobs: 0 });

        let s = f.store.get_shipment("AWB0000").await.unwrap().unwrap();
        assert_eq!(s.next_sync_at, f.clock.now() + ChronoDuration::hours(4));
    }

    #[tokio::test]
    async fn test_priority_sweep_selects_volatile_only() {
        use crate::models::ShipmentUpdate;

        let f = fixture(20);
        let now = f.clock.now();
        for (awb, code) in [("OFD1", "OFD"), ("UD1", "UD"), ("DL1", "DL")] {
            f.store
                .upsert_full(&ShipmentUpdate {
                    awb: awb.to_string(),
                    status_code: Some(code.to_string()),
                    status_desc: None,
                    current_location: None,
                    shipper: None,
                    origin: None,
                    destination: None,
                    product_type: None,
                    weight: None,
                    is_rto: false,
                    raw_payload: serde_json::json!({}),
                    data_hash: "h".to_string(),
                    synced_at: now,
                    next_sync_at: now,
                    sync_priority: 1,
                })
                .await
                .unwrap();
        }

        let outcome = f.scheduler.priority_sweep().await.unwrap();
        assert_eq!(outcome, SweepOutcome::Enqueued { selected: 2, jobs: 1 });

        let job = f.queue.reserve(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.job.kind, JobKind::PrioritySweep);
        assert_eq!(job.job.awbs.len(), 2);
        assert!(!job.job.awbs.contains(&"DL1".to_string()));
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let f = fixture(20);
        let _held = f.scheduler.full_lock.lock().await;
        assert_eq!(f.scheduler.run(SweepKind::Full).await.unwrap(), SweepOutcome::Skipped);
        // Other kinds are independent
        assert_ne!(f.scheduler.run(SweepKind::Priority).await.unwrap(), SweepOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        use crate::models::SyncLog;

        let f = fixture(20);
        let now = f.clock.now();
        f.store
            .insert_log(&SyncLog::success(None, "A", true, 10, now - ChronoDuration::days(8)))
            .await
            .unwrap();
        f.store
            .insert_log(&SyncLog::success(None, "A", false, 10, now - ChronoDuration::days(1)))
            .await
            .unwrap();

        let outcome = f.scheduler.retention_sweep().await.unwrap();
        assert_eq!(outcome, SweepOutcome::Purged { logs: 1, batches: 0 });
    }

    #[test]
    fn test_sweep_kind_parse() {
        assert_eq!("Full".parse::<SweepKind>().unwrap(), SweepKind::Full);
        assert!("weekly".parse::<SweepKind>().is_err());
    }
}
