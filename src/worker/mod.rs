//! Sync worker
//!
//! Pulls batch jobs off the [`JobQueue`] and syncs their AWBs one at a time.
//!
//! # Per-AWB protocol
//!
//! ```text
//!  breaker open? ──yes──► log CIRCUIT_OPEN, leave shipment alone
//!       │ no (a probe that times out on a permit is handed back)
//!  rate slot ──timeout──┐
//!       │               │
//!  semaphore permit ────┤ (released on every path, cancellation included)
//!       │               │
//!  GET upstream ──error─┴──► breaker failure (upstream errors only)
//!       │                    sync_failures + 1, backoff next_sync_at
//!       │                    last_error, log success=false
//!  breaker success
//!  digest == data_hash ? ──yes──► refresh sync timestamps, log changed=false
//!       │ no
//!  upsert full record, log changed=true
//! ```
//!
//! AWBs inside a batch run sequentially with a pacing pause between them;
//! fleet parallelism comes from running more workers. A batch that runs past
//! its deadline, or is interrupted by shutdown, counts the AWBs it never
//! reached as skipped.
//!
//! Per-AWB failures never fail the batch. Storage failures do: the batch row
//! is marked failed and the queue redelivers the job with backoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::clock::SharedClock;
use crate::config::WorkerConfig;
use crate::error::{Result, StorageError, SyncError};
use crate::limits::{BreakerDecision, Limits, SemaphorePermit};
use crate::metrics;
use crate::models::{
    BatchCounters, BatchStatus, JobKind, Shipment, ShipmentUpdate, StatusClass, SyncJob, SyncLog,
    MAX_SYNC_FAILURES,
};
use crate::queue::{FailOutcome, JobQueue};
use crate::scheduler::next_sync_at;
use crate::storage::ShipmentStore;
use crate::upstream::{FetchedTracking, TrackingApi};
use crate::utils::{jittered, truncate_text};

/// Longest error text stored in `last_error`
const MAX_ERROR_LEN: usize = 500;

/// Extra lease on top of the batch timeout before a job counts as stalled
const LEASE_GRACE: Duration = Duration::from_secs(60);

/// Everything a worker talks to
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn ShipmentStore>,
    pub queue: Arc<dyn JobQueue>,
    pub api: Arc<dyn TrackingApi>,
    pub limits: Limits,
    pub clock: SharedClock,
}

/// Result of one processed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: String,
    pub kind: JobKind,
    pub status: BatchStatus,
    pub counters: BatchCounters,
}

/// One queue consumer
pub struct SyncWorker {
    name: String,
    ctx: SyncContext,
    batch_timeout: Duration,
    lease: Duration,
    pacing: Duration,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncWorker {
    pub fn new(
        name: impl Into<String>,
        ctx: SyncContext,
        config: &WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let batch_timeout = Duration::from_secs(config.batch_timeout_secs);
        Self {
            name: name.into(),
            ctx,
            batch_timeout,
            lease: batch_timeout + LEASE_GRACE,
            pacing: Duration::from_millis(config.pacing_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            shutdown_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Process jobs until shutdown is signalled
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!("Worker started");

        while !self.is_shutting_down() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    let sleep_for = jittered(self.poll_interval, self.jitter);
                    trace!("No jobs waiting, polling again in {sleep_for:?}");
                    sleep_for
                }
                Err(e) => {
                    error!(error = %e, "Failed to run job");
                    jittered(self.poll_interval, self.jitter)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("Worker shutting down");
    }

    /// Reserve and process at most one job
    ///
    /// Returns `Ok(None)` when nothing was ready.
    pub async fn run_once(&self) -> Result<Option<BatchReport>> {
        let Some(reserved) = self.ctx.queue.reserve(self.lease).await? else {
            return Ok(None);
        };
        let job = reserved.job;
        let kind = job.kind.as_str();

        let span = info_span!(
            "job",
            batch_id = %job.batch_id,
            kind,
            awbs = job.awbs.len(),
            attempt = reserved.attempt
        );
        self.handle(job, reserved.attempt).instrument(span).await.map(Some)
    }

    async fn handle(&self, job: SyncJob, attempt: u32) -> Result<BatchReport> {
        let kind = job.kind.as_str();
        let _timer = metrics::start_batch_timer(kind);

        let mut counters = BatchCounters::default();
        let status = match self.process_job(&job, &mut counters).await {
            Ok(()) => {
                self.ctx.queue.complete(&job.batch_id).await?;
                metrics::record_job(kind, "completed");
                info!(
                    succeeded = counters.succeeded,
                    failed = counters.failed,
                    skipped = counters.skipped,
                    "Batch completed"
                );
                BatchStatus::Completed
            }
            Err(e) => {
                warn!(error = %e, attempt, "Batch failed");
                if let Err(mark) = self
                    .ctx
                    .store
                    .finish_batch(&job.batch_id, BatchStatus::Failed, &counters, self.ctx.clock.now())
                    .await
                {
                    warn!(error = %mark, "Could not mark batch failed");
                }

                match self.ctx.queue.fail(&job.batch_id, &e.to_string()).await? {
                    FailOutcome::Retrying { delay } => {
                        metrics::record_job(kind, "retrying");
                        debug!(delay_ms = millis(delay), "Job will be redelivered");
                    }
                    FailOutcome::Dead => {
                        metrics::record_job(kind, "dead");
                        error!("Job out of attempts, moved to dead letters");
                    }
                }
                BatchStatus::Failed
            }
        };

        Ok(BatchReport {
            batch_id: job.batch_id,
            kind: job.kind,
            status,
            counters,
        })
    }

    async fn process_job(&self, job: &SyncJob, counters: &mut BatchCounters) -> Result<()> {
        let store = &self.ctx.store;
        let total = job.awbs.len();
        let deadline = Instant::now() + self.batch_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();

        store
            .start_batch(
                &job.batch_id,
                i32::try_from(total).unwrap_or(i32::MAX),
                self.ctx.clock.now(),
            )
            .await?;

        for (index, awb) in job.awbs.iter().enumerate() {
            if self.is_shutting_down() || Instant::now() >= deadline {
                counters.skip(total - index);
                warn!(skipped = total - index, "Batch cut short");
                break;
            }

            match tokio::time::timeout_at(deadline, self.sync_awb(Some(&job.batch_id), awb)).await {
                Ok(Ok(success)) => counters.record(success),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    counters.skip(total - index);
                    warn!(awb = %awb, skipped = total - index, "Batch deadline reached");
                    break;
                }
            }
            store.update_batch_progress(&job.batch_id, counters).await?;

            if !self.pacing.is_zero() && index + 1 < total {
                let wake = (Instant::now() + self.pacing).min(deadline);
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }

        store
            .finish_batch(
                &job.batch_id,
                BatchStatus::Completed,
                counters,
                self.ctx.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// Sync one AWB and record the outcome
    ///
    /// Returns whether the attempt succeeded. Only storage failures are
    /// returned as errors; everything else is written to the shipment and the
    /// audit log.
    pub async fn sync_awb(
        &self,
        batch_id: Option<&str>,
        awb: &str,
    ) -> std::result::Result<bool, StorageError> {
        let attempt = self.attempt(awb).await;
        let existing = self.ctx.store.get_shipment(awb).await?;
        let now = self.ctx.clock.now();

        match attempt {
            Ok(fetched) => {
                self.record_success(batch_id, awb, existing.as_ref(), fetched, now)
                    .await?;
                Ok(true)
            }
            Err(err) => {
                self.record_failure(batch_id, awb, existing.as_ref(), &err, now)
                    .await?;
                Ok(false)
            }
        }
    }

    /// Breaker check, then the permits and the upstream call
    ///
    /// A half-open probe that never reaches upstream is handed back so
    /// another worker can probe straight away.
    async fn attempt(&self, awb: &str) -> std::result::Result<FetchedTracking, SyncError> {
        let breaker = &self.ctx.limits.breaker;

        let probing = match breaker.check().await? {
            BreakerDecision::Reject => return Err(SyncError::BreakerOpen),
            BreakerDecision::Probe => true,
            BreakerDecision::Allow => false,
        };

        let result = self.call_upstream(awb).await;

        if probing {
            if let Err(e) = &result {
                if !e.counts_toward_breaker() {
                    if let Err(release) = breaker.release_probe().await {
                        warn!(error = %release, "Could not hand back breaker probe");
                    }
                }
            }
        }
        result
    }

    async fn call_upstream(&self, awb: &str) -> std::result::Result<FetchedTracking, SyncError> {
        let limits = &self.ctx.limits;

        if !limits.rate.wait_for_slot(limits.rate_wait).await? {
            return Err(SyncError::RateLimitTimeout {
                waited_ms: millis(limits.rate_wait),
            });
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let Some(permit) = SemaphorePermit::acquire(
            limits.semaphore.clone(),
            request_id,
            limits.semaphore_wait,
            limits.poll_interval,
        )
        .await?
        else {
            return Err(SyncError::ConcurrencyTimeout {
                waited_ms: millis(limits.semaphore_wait),
            });
        };

        // Cancellation at the batch deadline drops the permit mid-call
        let result = self.ctx.api.fetch(awb).await;

        if let Err(e) = permit.release().await {
            warn!(awb = %awb, error = %e, "Semaphore release failed, slot will expire");
        }
        result
    }

    async fn record_success(
        &self,
        batch_id: Option<&str>,
        awb: &str,
        existing: Option<&Shipment>,
        fetched: FetchedTracking,
        now: chrono::DateTime<chrono::Utc>,
    ) -> std::result::Result<(), StorageError> {
        let store = &self.ctx.store;

        if let Err(e) = self.ctx.limits.breaker.record_success().await {
            warn!(error = %e, "Could not record breaker success");
        }

        let record = fetched.record;
        let digest = record.digest();
        let class = StatusClass::from_code(record.status_code.as_deref());
        let next = next_sync_at(now, class, 0);
        let changed = existing.and_then(|s| s.data_hash.as_deref()) != Some(digest.as_str());

        if changed {
            store
                .upsert_full(&ShipmentUpdate {
                    awb: awb.to_string(),
                    status_code: record.status_code,
                    status_desc: record.status_desc,
                    current_location: record.current_location,
                    shipper: record.shipper,
                    origin: record.origin,
                    destination: record.destination,
                    product_type: record.product_type,
                    weight: record.weight,
                    is_rto: record.is_rto,
                    raw_payload: fetched.raw,
                    data_hash: digest,
                    synced_at: now,
                    next_sync_at: next,
                    sync_priority: class.sync_priority(),
                })
                .await?;
        } else {
            store
                .touch_unchanged(awb, now, next, class.sync_priority())
                .await?;
        }

        store
            .insert_log(&SyncLog::success(
                batch_id,
                awb,
                changed,
                fetched.response_time_ms,
                now,
            ))
            .await?;

        metrics::record_sync(changed, None);
        metrics::observe_upstream(fetched.response_time_ms);
        debug!(awb = %awb, changed, class = %class, "Shipment synced");
        Ok(())
    }

    async fn record_failure(
        &self,
        batch_id: Option<&str>,
        awb: &str,
        existing: Option<&Shipment>,
        err: &SyncError,
        now: chrono::DateTime<chrono::Utc>,
    ) -> std::result::Result<(), StorageError> {
        let message = truncate_text(&err.to_string(), MAX_ERROR_LEN);

        if err.counts_toward_breaker() {
            if let Err(e) = self.ctx.limits.breaker.record_failure().await {
                warn!(error = %e, "Could not record breaker failure");
            }
        }

        if err.counts_toward_shipment() {
            if let Some(shipment) = existing {
                let failures = (shipment.sync_failures + 1).min(MAX_SYNC_FAILURES);
                let next = next_sync_at(now, shipment.status_class(), failures);
                self.ctx
                    .store
                    .record_failure(awb, failures, next, &message)
                    .await?;
                if failures >= MAX_SYNC_FAILURES {
                    warn!(awb = %awb, failures, "Shipment quarantined until reset");
                }
            }
        }

        self.ctx
            .store
            .insert_log(&SyncLog::failure(batch_id, awb, err.code(), &message, None, now))
            .await?;

        metrics::record_sync(false, Some(err.code()));
        warn!(awb = %awb, code = err.code(), error = %err, "Sync attempt failed");
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Start `count` workers, each in its own `worker` span
pub fn spawn_workers(
    count: usize,
    ctx: SyncContext,
    config: &WorkerConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (1..=count.max(1))
        .map(|i| {
            let name = format!("sync-worker-{i}");
            info!(worker.name = %name, "Starting worker");
            let worker = SyncWorker::new(name.clone(), ctx.clone(), config, shutdown_rx.clone());
            let span = info_span!("worker", worker.name = %name);
            tokio::spawn(async move { worker.run().instrument(span).await })
        })
        .collect()
}
