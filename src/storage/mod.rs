//! Shipment store: shipments, sync batches and the sync audit log
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Scheduler   │   │    Worker    │   │ SyncService  │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!                 ┌───────────────────┐
//!                 │   ShipmentStore   │
//!                 └─────────┬─────────┘
//!              ┌────────────┴────────────┐
//!              ▼                         ▼
//!     ┌─────────────────┐       ┌─────────────────┐
//!     │   PostgreSQL    │       │     SQLite      │
//!     │ (fleet, pooled) │       │ (single node)   │
//!     └─────────────────┘       └─────────────────┘
//! ```
//!
//! Every shipment write is scoped to a single AWB, so no operation takes
//! cross-row locks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use awbsync::storage::{ShipmentStore, SqliteStore};
//!
//! let store = SqliteStore::in_memory()?;
//! let due = store.select_due(chrono::Utc::now(), 100).await?;
//! ```

pub mod postgres;
pub mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{Config, StorageBackend};
use crate::error::StorageError;
use crate::models::{
    Backlog, BatchCounters, BatchStatus, DueShipment, Shipment, ShipmentUpdate, SyncBatch,
    SyncLog,
};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StorageError>;

/// Persistence used by the scheduler, the worker and the service facade
#[async_trait]
pub trait ShipmentStore: Send + Sync {
    /// Create tables and indexes if they do not exist
    async fn migrate(&self) -> StoreResult<()>;

    /// Cheap connectivity check
    async fn ping(&self) -> StoreResult<()>;

    // ---- shipments --------------------------------------------------------

    /// Due, non-quarantined shipments ordered by priority, staleness, failures
    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DueShipment>>;

    /// Due shipments whose status code is one of `codes` (upper case)
    async fn select_volatile_due(
        &self,
        now: DateTime<Utc>,
        codes: &[String],
        limit: usize,
    ) -> StoreResult<Vec<DueShipment>>;

    /// Push `next_sync_at` forward to `until` for enqueued shipments
    async fn mark_enqueued(&self, awbs: &[String], until: DateTime<Utc>) -> StoreResult<u64>;

    async fn get_shipment(&self, awb: &str) -> StoreResult<Option<Shipment>>;

    /// Insert rows for AWBs not yet tracked; returns the AWBs inserted
    async fn insert_new(&self, awbs: &[String], now: DateTime<Utc>) -> StoreResult<Vec<String>>;

    /// Write the full record after a changed (or first) sync
    async fn upsert_full(&self, update: &ShipmentUpdate) -> StoreResult<()>;

    /// Refresh scheduling metadata only, after an unchanged sync
    ///
    /// Writes exactly `last_synced_at`, `next_sync_at`, `sync_priority`,
    /// `sync_failures = 0` and `last_error = NULL`. The tracking fields,
    /// `raw_payload`, `data_hash` and `updated_at` are left as they were.
    async fn touch_unchanged(
        &self,
        awb: &str,
        synced_at: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
        sync_priority: i16,
    ) -> StoreResult<()>;

    /// Store a failed attempt's backoff and error
    async fn record_failure(
        &self,
        awb: &str,
        sync_failures: i32,
        next_sync_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;

    /// Re-arm a shipment; false if the AWB is unknown
    async fn reset_failures(&self, awb: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Pending-sync backlog for operators
    async fn backlog(&self, now: DateTime<Utc>) -> StoreResult<Backlog>;

    // ---- batches ----------------------------------------------------------

    /// Insert a pending batch; an existing id is left as is
    async fn create_batch(&self, batch: &SyncBatch) -> StoreResult<()>;

    /// Mark a batch running, creating it if it was never recorded
    async fn start_batch(&self, batch_id: &str, total_awbs: i32, now: DateTime<Utc>)
        -> StoreResult<()>;

    async fn update_batch_progress(&self, batch_id: &str, counters: &BatchCounters)
        -> StoreResult<()>;

    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        counters: &BatchCounters,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<SyncBatch>>;

    /// Most recently created batches first
    async fn recent_batches(&self, limit: usize) -> StoreResult<Vec<SyncBatch>>;

    // ---- audit log --------------------------------------------------------

    async fn insert_log(&self, log: &SyncLog) -> StoreResult<()>;

    /// Newest first, optionally failures only
    async fn recent_logs(&self, failed_only: bool, limit: usize) -> StoreResult<Vec<SyncLog>>;

    /// Log rows for one AWB, newest first
    async fn logs_for(&self, awb: &str, limit: usize) -> StoreResult<Vec<SyncLog>>;

    // ---- retention --------------------------------------------------------

    /// Delete log rows created before `before`
    async fn purge_logs(&self, before: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete finished batches completed before `before`
    async fn purge_batches(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

/// Open the store selected by `STORAGE_BACKEND`
pub async fn from_config(config: &Config) -> anyhow::Result<Arc<dyn ShipmentStore>> {
    match config.storage.backend {
        StorageBackend::Postgres => {
            let store = PgStore::connect(&config.storage).await?;
            Ok(Arc::new(store))
        }
        StorageBackend::Sqlite => {
            let store = SqliteStore::new(&config.storage.sqlite_path)?;
            Ok(Arc::new(store))
        }
    }
}

/// Clamp a caller-supplied limit into an SQL `LIMIT` value
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
