//! Operator and dashboard entrypoints
//!
//! [`SyncService`] is what the HTTP surface and the CLI call. It holds no
//! orchestration logic of its own: force sync and add-to-tracking go through
//! [`Scheduler::enqueue_batch`], and the status snapshot is a set of reads
//! over the store, the queue and the limiters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::limits::{BreakerSnapshot, CircuitState, Limits, RateUsage};
use crate::metrics;
use crate::models::{
    sanitize_awb, sanitize_awbs, Backlog, JobKind, SyncBatch, SyncJob, SyncLog, UPSTREAM_MAX_BATCH,
};
use crate::queue::{JobQueue, QueueDepth};
use crate::scheduler::Scheduler;
use crate::storage::ShipmentStore;

/// Most AWBs accepted by one add-to-tracking call
pub const MAX_TRACK_REQUEST: usize = 1_000;

/// Rows returned in the status snapshot's recent lists
const RECENT_LIMIT: usize = 20;

// ============================================================================
// Response types
// ============================================================================

/// Semaphore occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SemaphoreUsage {
    pub in_flight: u32,
    pub capacity: u32,
}

/// Everything an operator looks at
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub queue: QueueDepth,
    pub rate_limiter: RateUsage,
    pub semaphore: SemaphoreUsage,
    pub circuit_breaker: BreakerSnapshot,
    pub backlog: Backlog,
    /// Seconds since the oldest successful sync, if any
    pub stale_seconds: Option<i64>,
    pub recent_batches: Vec<SyncBatch>,
    pub recent_failures: Vec<SyncLog>,
}

/// Result of an add-to-tracking call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackOutcome {
    /// AWBs that were not tracked before
    pub inserted: Vec<String>,
    /// AWBs that were already tracked and left alone
    pub already_tracked: usize,
    /// Batch ids enqueued for the inserted AWBs
    pub batch_ids: Vec<String>,
}

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one dependency
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

/// Health of the service and its dependencies
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub checks: Vec<ComponentHealth>,
}

// ============================================================================
// Service
// ============================================================================

pub struct SyncService {
    store: Arc<dyn ShipmentStore>,
    queue: Arc<dyn JobQueue>,
    scheduler: Arc<Scheduler>,
    limits: Limits,
    clock: SharedClock,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn ShipmentStore>,
        queue: Arc<dyn JobQueue>,
        scheduler: Arc<Scheduler>,
        limits: Limits,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            queue,
            scheduler,
            limits,
            clock,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Enqueue 1 to 20 AWBs as one job at the highest priority
    ///
    /// Untracked AWBs are created by their first successful sync.
    pub async fn force_sync<S: AsRef<str>>(&self, awbs: &[S]) -> Result<SyncJob> {
        if awbs.len() > UPSTREAM_MAX_BATCH {
            return Err(Error::InvalidInput(format!(
                "at most {UPSTREAM_MAX_BATCH} AWBs per force sync, got {}",
                awbs.len()
            )));
        }
        let awbs = sanitize_awbs(awbs);
        if awbs.is_empty() {
            return Err(Error::InvalidInput("no valid AWB given".into()));
        }

        let job = self
            .scheduler
            .enqueue_batch(awbs, JobKind::Manual, Duration::ZERO)
            .await?;
        tracing::info!(batch_id = %job.batch_id, awbs = job.awbs.len(), "Force sync enqueued");
        Ok(job)
    }

    /// Start tracking new AWBs and sync them right away
    pub async fn add_to_tracking<S: AsRef<str>>(&self, awbs: &[S]) -> Result<TrackOutcome> {
        if awbs.len() > MAX_TRACK_REQUEST {
            return Err(Error::InvalidInput(format!(
                "at most {MAX_TRACK_REQUEST} AWBs per request, got {}",
                awbs.len()
            )));
        }
        let awbs = sanitize_awbs(awbs);
        if awbs.is_empty() {
            return Err(Error::InvalidInput("no valid AWB given".into()));
        }

        let inserted = self.store.insert_new(&awbs, self.clock.now()).await?;
        let mut batch_ids = Vec::new();
        for chunk in inserted.chunks(self.scheduler.batch_size()) {
            let job = self
                .scheduler
                .enqueue_batch(chunk.to_vec(), JobKind::Manual, Duration::ZERO)
                .await?;
            batch_ids.push(job.batch_id);
        }

        tracing::info!(
            requested = awbs.len(),
            inserted = inserted.len(),
            jobs = batch_ids.len(),
            "AWBs added to tracking"
        );
        Ok(TrackOutcome {
            already_tracked: awbs.len() - inserted.len(),
            inserted,
            batch_ids,
        })
    }

    /// Clear a shipment's failures and make it due now
    ///
    /// Returns `false` when the AWB is not tracked.
    pub async fn reset_shipment(&self, awb: &str) -> Result<bool> {
        let awb = sanitize_awb(awb).ok_or_else(|| Error::InvalidInput(format!("invalid AWB {awb:?}")))?;
        let found = self.store.reset_failures(&awb, self.clock.now()).await?;
        if found {
            tracing::info!(awb = %awb, "Shipment re-armed");
        }
        Ok(found)
    }

    /// Read-only snapshot of queue, limiters and backlog
    ///
    /// Also refreshes the Prometheus gauges with what it read.
    pub async fn status(&self) -> Result<StatusSnapshot> {
        let now = self.clock.now();

        let queue = self.queue.depth().await?;
        let rate_limiter = self.limits.rate.usage().await?;
        let semaphore = SemaphoreUsage {
            in_flight: self.limits.semaphore.current().await?,
            capacity: self.limits.semaphore.capacity(),
        };
        let circuit_breaker = self.limits.breaker.snapshot().await?;
        let backlog = self.store.backlog(now).await?;
        let recent_batches = self.store.recent_batches(RECENT_LIMIT).await?;
        let recent_failures = self.store.recent_logs(true, RECENT_LIMIT).await?;

        metrics::set_queue_depth(&queue);
        metrics::set_rate_usage(rate_limiter.used, rate_limiter.limit);
        metrics::set_semaphore(semaphore.in_flight, semaphore.capacity);
        metrics::set_breaker(&circuit_breaker);
        metrics::set_backlog(&backlog, now);

        Ok(StatusSnapshot {
            generated_at: now,
            stale_seconds: backlog
                .oldest_synced_at
                .map(|at| (now - at).num_seconds().max(0)),
            queue,
            rate_limiter,
            semaphore,
            circuit_breaker,
            backlog,
            recent_batches,
            recent_failures,
        })
    }

    /// Probe the store, the queue and the constraint store
    pub async fn health(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(3);

        let started = Instant::now();
        checks.push(match self.store.ping().await {
            Ok(()) => component("shipment_store", HealthStatus::Healthy, None, started),
            Err(e) => component("shipment_store", HealthStatus::Unhealthy, Some(e.to_string()), started),
        });

        let started = Instant::now();
        checks.push(match self.queue.depth().await {
            Ok(depth) => component(
                "job_queue",
                HealthStatus::Healthy,
                Some(format!("{} waiting, {} dead", depth.waiting, depth.dead)),
                started,
            ),
            Err(e) => component("job_queue", HealthStatus::Unhealthy, Some(e.to_string()), started),
        });

        // Limiters fail closed, so an unreachable store stops syncing but not the service
        let started = Instant::now();
        checks.push(match self.limits.breaker.snapshot().await {
            Ok(snapshot) if snapshot.state == CircuitState::Closed => {
                component("constraint_store", HealthStatus::Healthy, None, started)
            }
            Ok(snapshot) => component(
                "constraint_store",
                HealthStatus::Degraded,
                Some(format!("circuit breaker {}", snapshot.state.as_str())),
                started,
            ),
            Err(e) => component("constraint_store", HealthStatus::Degraded, Some(e.to_string()), started),
        });

        let status = if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks,
        }
    }
}

fn component(
    name: &str,
    status: HealthStatus,
    message: Option<String>,
    started: Instant,
) -> ComponentHealth {
    ComponentHealth {
        name: name.to_string(),
        status,
        message,
        latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use crate::limits::MemoryConstraintStore;
    use crate::queue::MemoryJobQueue;
    use crate::storage::SqliteStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<SqliteStore>,
        queue: Arc<MemoryJobQueue>,
        service: SyncService,
    }

    fn fixture() -> Fixture {
        let config = Config::default();
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue = Arc::new(MemoryJobQueue::new(&config.queue, clock.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            &config,
        ));
        let limits = Limits::with_store(
            Arc::new(MemoryConstraintStore::new()),
            &config.limits,
            "test",
            clock.clone(),
        );
        let service = SyncService::new(store.clone(), queue.clone(), scheduler, limits, clock.clone());
        Fixture {
            clock,
            store,
            queue,
            service,
        }
    }

    #[tokio::test]
    async fn test_force_sync_enqueues_manual_job() {
        let f = fixture();
        let job = f.service.force_sync(&["awb-0001", "AWB0002", "AWB0001"]).await.unwrap();
        assert_eq!(job.awbs, vec!["awb0001", "AWB0002", "AWB0001"]);
        assert_eq!(job.kind, JobKind::Manual);

        let reserved = f.queue.reserve(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(reserved.job.batch_id, job.batch_id);
        assert!(f.store.get_batch(&job.batch_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_force_sync_validates_size() {
        let f = fixture();
        let too_many: Vec<String> = (0..21).map(|i| format!("AWB{i}")).collect();
        assert!(matches!(
            f.service.force_sync(too_many.as_slice()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.service.force_sync(&["--", " "]).await,
            Err(Error::InvalidInput(_))
        ));
        let none: [&str; 0] = [];
        assert!(f.service.force_sync(&none).await.is_err());
    }

    #[tokio::test]
    async fn test_add_to_tracking_inserts_and_enqueues_new_only() {
        let f = fixture();
        f.store
            .insert_new(&["AWB0001".to_string()], f.clock.now())
            .await
            .unwrap();

        let outcome = f
            .service
            .add_to_tracking(&["AWB0001", "AWB0002", "AWB0003"])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, vec!["AWB0002", "AWB0003"]);
        assert_eq!(outcome.already_tracked, 1);
        assert_eq!(outcome.batch_ids.len(), 1);

        let s = f.store.get_shipment("AWB0002").await.unwrap().unwrap();
        assert_eq!(s.sync_priority, 1);

        let job = f.queue.reserve(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(job.job.awbs, vec!["AWB0002", "AWB0003"]);
    }

    #[tokio::test]
    async fn test_reset_shipment() {
        let f = fixture();
        assert!(!f.service.reset_shipment("AWB0001").await.unwrap());

        f.store
            .insert_new(&["AWB0001".to_string()], f.clock.now())
            .await
            .unwrap();
        f.store
            .record_failure("AWB0001", 10, f.clock.now() + chrono::Duration::days(1), "boom")
            .await
            .unwrap();

        assert!(f.service.reset_shipment("AWB0001").await.unwrap());
        let s = f.store.get_shipment("AWB0001").await.unwrap().unwrap();
        assert_eq!(s.sync_failures, 0);
        assert!(s.last_error.is_none());
        assert_eq!(s.next_sync_at, f.clock.now());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let f = fixture();
        f.service.add_to_tracking(&["AWB0001", "AWB0002"]).await.unwrap();

        let status = f.service.status().await.unwrap();
        assert_eq!(status.queue.waiting, 1);
        assert_eq!(status.backlog.total, 2);
        assert_eq!(status.semaphore.capacity, 20);
        assert_eq!(status.rate_limiter.limit, 60);
        assert_eq!(status.circuit_breaker.state, CircuitState::Closed);
        assert_eq!(status.recent_batches.len(), 1);
        assert!(status.stale_seconds.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["circuit_breaker"]["state"], "closed");
    }

    #[tokio::test]
    async fn test_health_all_healthy() {
        let f = fixture();
        let report = f.service.health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 3);
    }
}
