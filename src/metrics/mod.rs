//! Prometheus metrics for the sync orchestrator
//!
//! This module provides metrics tracking for:
//! - Sync: per-AWB outcomes, error codes, upstream latency, job results
//! - Scheduler: sweep runs and AWBs enqueued, retention purges
//! - Constraints: rate window usage, semaphore in-flight, breaker state
//! - Backlog: queue depth, due/quarantined shipments, stale-data age
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use chrono::{DateTime, Utc};
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

use crate::limits::BreakerSnapshot;
use crate::models::Backlog;
use crate::queue::QueueDepth;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Counters and histograms written by workers and the scheduler
struct SyncMetrics {
    attempts: CounterVec,
    errors: CounterVec,
    upstream_duration: Histogram,
    jobs: CounterVec,
    batch_duration: HistogramVec,
    sweeps: CounterVec,
    sweep_enqueued: CounterVec,
    purged_rows: CounterVec,
}

/// Gauges mirroring the shared constraints and the backlog
struct ConstraintMetrics {
    rate_used: Gauge,
    rate_limit: Gauge,
    semaphore_in_flight: Gauge,
    semaphore_capacity: Gauge,
    breaker_state: Gauge,
    breaker_failures: Gauge,
    queue_depth: GaugeVec,
    backlog: GaugeVec,
    stale_seconds: Gauge,
}

static SYNC_METRICS: OnceLock<SyncMetrics> = OnceLock::new();

static CONSTRAINT_METRICS: OnceLock<ConstraintMetrics> = OnceLock::new();

/// Outcome of the one registration attempt
static METRICS_INIT: OnceLock<Result<(), String>> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; later calls return the first result.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = awbsync::metrics::init_metrics() {
///     tracing::warn!(error = %e, "metrics disabled");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    METRICS_INIT
        .get_or_init(|| register_all().map_err(|e| e.to_string()))
        .clone()
        .map_err(Into::into)
}

fn register_all() -> Result<(), prometheus::Error> {
    let sync = SyncMetrics {
        attempts: register_counter_vec!(
            "awbsync_sync_attempts_total",
            "Per-AWB sync attempts by outcome (changed, unchanged, failed)",
            &["outcome"]
        )?,
        errors: register_counter_vec!(
            "awbsync_sync_errors_total",
            "Failed sync attempts by error code",
            &["code"]
        )?,
        upstream_duration: register_histogram!(
            "awbsync_upstream_request_duration_seconds",
            "Courier API response time in seconds",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0]
        )?,
        jobs: register_counter_vec!(
            "awbsync_jobs_total",
            "Jobs finished by kind and result (completed, retrying, dead)",
            &["kind", "result"]
        )?,
        batch_duration: register_histogram_vec!(
            "awbsync_batch_duration_seconds",
            "Wall-clock time to process one batch",
            &["kind"],
            vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0]
        )?,
        sweeps: register_counter_vec!(
            "awbsync_sweeps_total",
            "Scheduler sweeps by kind and result (ran, skipped, error)",
            &["sweep", "result"]
        )?,
        sweep_enqueued: register_counter_vec!(
            "awbsync_sweep_enqueued_awbs_total",
            "AWBs enqueued by sweeps",
            &["sweep"]
        )?,
        purged_rows: register_counter_vec!(
            "awbsync_retention_purged_rows_total",
            "Rows deleted by the retention sweep",
            &["table"]
        )?,
    };

    let constraints = ConstraintMetrics {
        rate_used: register_gauge!(
            "awbsync_rate_window_used",
            "Upstream requests in the current sliding window"
        )?,
        rate_limit: register_gauge!(
            "awbsync_rate_window_limit",
            "Upstream request budget per window"
        )?,
        semaphore_in_flight: register_gauge!(
            "awbsync_semaphore_in_flight",
            "Upstream calls currently holding a concurrency slot"
        )?,
        semaphore_capacity: register_gauge!(
            "awbsync_semaphore_capacity",
            "Concurrency slots available fleet-wide"
        )?,
        breaker_state: register_gauge!(
            "awbsync_circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
        )?,
        breaker_failures: register_gauge!(
            "awbsync_circuit_breaker_failures",
            "Consecutive upstream failures counted by the breaker"
        )?,
        queue_depth: register_gauge_vec!(
            "awbsync_queue_jobs",
            "Jobs in the queue by state",
            &["state"]
        )?,
        backlog: register_gauge_vec!(
            "awbsync_shipments",
            "Tracked shipments by scheduling state (total, due, quarantined)",
            &["state"]
        )?,
        stale_seconds: register_gauge!(
            "awbsync_oldest_sync_age_seconds",
            "Age of the least recently synced shipment"
        )?,
    };

    // Only reachable once, from inside METRICS_INIT
    let _ = SYNC_METRICS.set(sync);
    let _ = CONSTRAINT_METRICS.set(constraints);

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SYNC_METRICS.get().is_some() && CONSTRAINT_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one per-AWB attempt
///
/// `error_code` is `None` for successful attempts.
pub fn record_sync(changed: bool, error_code: Option<&str>) {
    let Some(m) = SYNC_METRICS.get() else {
        return;
    };

    match error_code {
        None => {
            let outcome = if changed { "changed" } else { "unchanged" };
            m.attempts.with_label_values(&[outcome]).inc();
        }
        Some(code) => {
            m.attempts.with_label_values(&["failed"]).inc();
            m.errors.with_label_values(&[code]).inc();
        }
    }
}

/// Record a courier API response time
pub fn observe_upstream(response_time_ms: i64) {
    if let Some(m) = SYNC_METRICS.get() {
        m.upstream_duration
            .observe(response_time_ms.max(0) as f64 / 1000.0);
    }
}

/// Record how a job ended
pub fn record_job(kind: &str, result: &str) {
    if let Some(m) = SYNC_METRICS.get() {
        m.jobs.with_label_values(&[kind, result]).inc();
    }
}

/// Record a sweep run
pub fn record_sweep(sweep: &str, result: &str, awbs_enqueued: usize) {
    let Some(m) = SYNC_METRICS.get() else {
        return;
    };

    m.sweeps.with_label_values(&[sweep, result]).inc();
    if awbs_enqueued > 0 {
        m.sweep_enqueued
            .with_label_values(&[sweep])
            .inc_by(awbs_enqueued as f64);
    }
}

/// Record rows removed by the retention sweep
pub fn record_purged(table: &str, rows: u64) {
    if rows == 0 {
        return;
    }
    if let Some(m) = SYNC_METRICS.get() {
        m.purged_rows.with_label_values(&[table]).inc_by(rows as f64);
    }
}

/// Update rate window usage
pub fn set_rate_usage(used: u32, limit: u32) {
    if let Some(m) = CONSTRAINT_METRICS.get() {
        m.rate_used.set(f64::from(used));
        m.rate_limit.set(f64::from(limit));
    }
}

/// Update semaphore occupancy
pub fn set_semaphore(in_flight: u32, capacity: u32) {
    if let Some(m) = CONSTRAINT_METRICS.get() {
        m.semaphore_in_flight.set(f64::from(in_flight));
        m.semaphore_capacity.set(f64::from(capacity));
    }
}

/// Update circuit breaker state
pub fn set_breaker(snapshot: &BreakerSnapshot) {
    if let Some(m) = CONSTRAINT_METRICS.get() {
        m.breaker_state.set(snapshot.state.as_gauge() as f64);
        m.breaker_failures.set(f64::from(snapshot.failures));
    }
}

/// Update queue depth by state
pub fn set_queue_depth(depth: &QueueDepth) {
    let Some(m) = CONSTRAINT_METRICS.get() else {
        return;
    };

    for (state, value) in [
        ("waiting", depth.waiting),
        ("delayed", depth.delayed),
        ("active", depth.active),
        ("dead", depth.dead),
    ] {
        m.queue_depth.with_label_values(&[state]).set(value as f64);
    }
}

/// Update backlog gauges
pub fn set_backlog(backlog: &Backlog, now: DateTime<Utc>) {
    let Some(m) = CONSTRAINT_METRICS.get() else {
        return;
    };

    m.backlog.with_label_values(&["total"]).set(backlog.total as f64);
    m.backlog.with_label_values(&["due"]).set(backlog.due as f64);
    m.backlog
        .with_label_values(&["quarantined"])
        .set(backlog.quarantined as f64);

    let age = backlog
        .oldest_synced_at
        .map_or(0, |at| (now - at).num_seconds().max(0));
    m.stale_seconds.set(age as f64);
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a batch timer (returns a timer handle)
pub fn start_batch_timer(kind: &str) -> MetricsTimer {
    match SYNC_METRICS.get() {
        Some(m) => MetricsTimer::new(m.batch_duration.with_label_values(&[kind]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::CircuitState;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        // Idempotent
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_initialized() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_sync(true, None);
        let text = encode_metrics().unwrap();
        assert!(text.contains("awbsync_sync_attempts_total"));
    }

    #[test]
    fn test_constraint_gauges() {
        ensure_metrics_initialized();
        set_rate_usage(12, 60);
        set_semaphore(3, 20);
        set_breaker(&BreakerSnapshot {
            state: CircuitState::Open,
            failures: 5,
            opened_at: Some(Utc::now()),
        });
        set_queue_depth(&QueueDepth {
            waiting: 2,
            delayed: 1,
            active: 1,
            dead: 0,
        });
        set_backlog(
            &Backlog {
                total: 10,
                due: 4,
                quarantined: 1,
                oldest_synced_at: Some(Utc::now() - chrono::Duration::hours(2)),
            },
            Utc::now(),
        );

        let text = encode_metrics().unwrap();
        assert!(text.contains("awbsync_circuit_breaker_state 2"));
        assert!(text.contains("awbsync_semaphore_capacity 20"));
    }

    #[test]
    fn test_sync_recording() {
        ensure_metrics_initialized();
        record_sync(false, None);
        record_sync(false, Some("UPSTREAM_HTTP_STATUS"));
        observe_upstream(240);
        record_job("full", "completed");
        record_sweep("priority", "ran", 20);
        record_purged("sync_logs", 5);
        let _timer = start_batch_timer("manual");
    }
}
