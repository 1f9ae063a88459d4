//! Common test utilities

#![allow(dead_code)]

use awbsync::clock::ManualClock;
use awbsync::config::{Config, LimiterBackend, QueueBackend, StorageBackend};
use awbsync::limits::{Limits, MemoryConstraintStore};
use awbsync::queue::MemoryJobQueue;
use awbsync::scheduler::Scheduler;
use awbsync::storage::SqliteStore;
use awbsync::upstream::{CourierClient, TrackingApi};
use awbsync::worker::{SyncContext, SyncWorker};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;

/// Config with in-process backends and no pacing between AWBs
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.limits.backend = LimiterBackend::Memory;
    config.storage.backend = StorageBackend::Sqlite;
    config.queue.backend = QueueBackend::Memory;
    config.worker.pacing_ms = 0;
    config.upstream.timeout_secs = 2;
    config
}

/// A successful courier envelope for one shipment
pub fn envelope(awb: &str, status_code: &str, location: &str) -> Value {
    json!({
        "status": "Success",
        "data": [{
            "awb": awb,
            "status_code": status_code,
            "status_desc": "In transit",
            "status_time": "2024-03-01T09:00:00Z",
            "current_location": location,
            "shipper": "ACME Retail",
            "weight": 1.5,
            "scans": [{"code": "PU"}, {"code": status_code}]
        }]
    })
}

/// One process worth of components over shared in-memory backends
pub struct Harness {
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SqliteStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub constraints: Arc<MemoryConstraintStore>,
    pub scheduler: Arc<Scheduler>,
    _shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue = Arc::new(MemoryJobQueue::new(&config.queue, clock.clone()));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            &config,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            config,
            clock,
            store,
            queue,
            constraints: Arc::new(MemoryConstraintStore::new()),
            scheduler,
            _shutdown: shutdown,
            shutdown_rx,
        }
    }

    /// Limiters over the harness' constraint store, as another process would see them
    pub fn limits(&self) -> Limits {
        Limits::with_store(
            self.constraints.clone(),
            &self.config.limits,
            &self.config.redis.key_prefix,
            self.clock.clone(),
        )
    }

    /// Worker talking to `api`
    pub fn worker(&self, api: Arc<dyn TrackingApi>) -> SyncWorker {
        let ctx = SyncContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            api,
            limits: self.limits(),
            clock: self.clock.clone(),
        };
        SyncWorker::new("test-worker", ctx, &self.config.worker, self.shutdown_rx.clone())
    }

    /// Worker talking to a courier at `base_url`
    pub fn http_worker(&self, base_url: &str) -> SyncWorker {
        let mut upstream = self.config.upstream.clone();
        upstream.base_url = format!("{base_url}/v1/track");
        self.worker(Arc::new(CourierClient::new(&upstream).unwrap()))
    }
}
