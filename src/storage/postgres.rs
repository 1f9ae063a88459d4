//! PostgreSQL shipment store for fleet deployments
//!
//! Workers on many hosts share one database through a deadpool connection
//! pool. Array parameters (`= ANY($n)`) keep multi-AWB statements to a single
//! round trip.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use std::collections::HashSet;
use tokio_postgres::{NoTls, Row};

use super::{sql_limit, ShipmentStore, StoreResult};
use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::models::{
    Backlog, BatchCounters, BatchStatus, DueShipment, Shipment, ShipmentUpdate, SyncBatch,
    SyncLog, MAX_SYNC_FAILURES, NEW_SHIPMENT_PRIORITY,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS shipments (
        awb VARCHAR(40) PRIMARY KEY,
        status_code TEXT,
        status_desc TEXT,
        current_location TEXT,
        shipper TEXT,
        origin TEXT,
        destination TEXT,
        product_type TEXT,
        weight DOUBLE PRECISION,
        is_rto BOOLEAN NOT NULL DEFAULT FALSE,
        raw_payload JSONB,
        data_hash VARCHAR(64),
        last_synced_at TIMESTAMPTZ,
        next_sync_at TIMESTAMPTZ NOT NULL,
        sync_priority SMALLINT NOT NULL DEFAULT 5,
        sync_failures INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_shipments_due
        ON shipments(sync_priority, next_sync_at, sync_failures)
        WHERE sync_failures < 10;

    CREATE INDEX IF NOT EXISTS idx_shipments_status
        ON shipments(UPPER(status_code));

    CREATE TABLE IF NOT EXISTS sync_batches (
        batch_id VARCHAR(64) PRIMARY KEY,
        total_awbs INTEGER NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0,
        succeeded INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        skipped INTEGER NOT NULL DEFAULT 0,
        status VARCHAR(16) NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ
    );

    CREATE INDEX IF NOT EXISTS idx_sync_batches_created
        ON sync_batches(created_at DESC);

    CREATE TABLE IF NOT EXISTS sync_logs (
        id BIGSERIAL PRIMARY KEY,
        batch_id VARCHAR(64),
        awb VARCHAR(40) NOT NULL,
        success BOOLEAN NOT NULL,
        changed BOOLEAN NOT NULL DEFAULT FALSE,
        error_code VARCHAR(32),
        error_message TEXT,
        response_time_ms BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_sync_logs_created
        ON sync_logs(created_at);

    CREATE INDEX IF NOT EXISTS idx_sync_logs_awb
        ON sync_logs(awb, id DESC);
"#;

const SHIPMENT_COLUMNS: &str = "awb, status_code, status_desc, current_location, shipper, origin, \
     destination, product_type, weight, is_rto, raw_payload, data_hash, last_synced_at, \
     next_sync_at, sync_priority, sync_failures, last_error, created_at, updated_at";

const BATCH_COLUMNS: &str = "batch_id, total_awbs, processed, succeeded, failed, skipped, status, \
     created_at, started_at, completed_at";

const LOG_COLUMNS: &str = "batch_id, awb, success, changed, error_code, error_message, \
     response_time_ms, created_at";

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Wrap an existing pool
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the connection pool and verify connectivity
    pub async fn connect(config: &StorageConfig) -> anyhow::Result<Self> {
        let mut pool_config = PoolConfig::new();
        pool_config.url = Some(config.postgres_url.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("Failed to create PostgreSQL connection pool")?;

        let client = pool
            .get()
            .await
            .context("Failed to get PostgreSQL connection")?;
        client
            .simple_query("SELECT 1")
            .await
            .context("Failed to reach PostgreSQL")?;

        tracing::info!(pool_size = config.pool_size, "Connected to PostgreSQL");

        Ok(Self { pool })
    }

    async fn client(&self) -> StoreResult<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Pool(e.to_string()))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn shipment_from_row(row: &Row) -> StoreResult<Shipment> {
    Ok(Shipment {
        awb: row.try_get(0)?,
        status_code: row.try_get(1)?,
        status_desc: row.try_get(2)?,
        current_location: row.try_get(3)?,
        shipper: row.try_get(4)?,
        origin: row.try_get(5)?,
        destination: row.try_get(6)?,
        product_type: row.try_get(7)?,
        weight: row.try_get(8)?,
        is_rto: row.try_get(9)?,
        raw_payload: row.try_get(10)?,
        data_hash: row.try_get(11)?,
        last_synced_at: row.try_get(12)?,
        next_sync_at: row.try_get(13)?,
        sync_priority: row.try_get(14)?,
        sync_failures: row.try_get(15)?,
        last_error: row.try_get(16)?,
        created_at: row.try_get(17)?,
        updated_at: row.try_get(18)?,
    })
}

fn due_from_row(row: &Row) -> StoreResult<DueShipment> {
    Ok(DueShipment {
        awb: row.try_get(0)?,
        sync_priority: row.try_get(1)?,
        next_sync_at: row.try_get(2)?,
        sync_failures: row.try_get(3)?,
    })
}

fn batch_from_row(row: &Row) -> StoreResult<SyncBatch> {
    let status: String = row.try_get(6)?;
    let status = status.parse::<BatchStatus>().map_err(StorageError::Corrupt)?;

    Ok(SyncBatch {
        batch_id: row.try_get(0)?,
        total_awbs: row.try_get(1)?,
        counters: BatchCounters {
            processed: row.try_get(2)?,
            succeeded: row.try_get(3)?,
            failed: row.try_get(4)?,
            skipped: row.try_get(5)?,
        },
        status,
        created_at: row.try_get(7)?,
        started_at: row.try_get(8)?,
        completed_at: row.try_get(9)?,
    })
}

fn log_from_row(row: &Row) -> StoreResult<SyncLog> {
    Ok(SyncLog {
        batch_id: row.try_get(0)?,
        awb: row.try_get(1)?,
        success: row.try_get(2)?,
        changed: row.try_get(3)?,
        error_code: row.try_get(4)?,
        error_message: row.try_get(5)?,
        response_time_ms: row.try_get(6)?,
        created_at: row.try_get(7)?,
    })
}

fn map_rows<T>(rows: &[Row], f: fn(&Row) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(f).collect()
}

// ============================================================================
// ShipmentStore
// ============================================================================

#[async_trait]
impl ShipmentStore for PgStore {
    async fn migrate(&self) -> StoreResult<()> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await?;
        tracing::info!("PostgreSQL schema ready");
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DueShipment>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT awb, sync_priority, next_sync_at, sync_failures FROM shipments
                 WHERE next_sync_at <= $1 AND sync_failures < $2
                 ORDER BY sync_priority ASC, next_sync_at ASC, sync_failures ASC
                 LIMIT $3",
                &[&now, &MAX_SYNC_FAILURES, &sql_limit(limit)],
            )
            .await?;
        map_rows(&rows, due_from_row)
    }

    async fn select_volatile_due(
        &self,
        now: DateTime<Utc>,
        codes: &[String],
        limit: usize,
    ) -> StoreResult<Vec<DueShipment>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT awb, sync_priority, next_sync_at, sync_failures FROM shipments
                 WHERE next_sync_at <= $1 AND sync_failures < $2 AND UPPER(status_code) = ANY($3)
                 ORDER BY sync_priority ASC, next_sync_at ASC, sync_failures ASC
                 LIMIT $4",
                &[&now, &MAX_SYNC_FAILURES, &codes, &sql_limit(limit)],
            )
            .await?;
        map_rows(&rows, due_from_row)
    }

    async fn mark_enqueued(&self, awbs: &[String], until: DateTime<Utc>) -> StoreResult<u64> {
        if awbs.is_empty() {
            return Ok(0);
        }
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE shipments SET next_sync_at = $1
                 WHERE awb = ANY($2) AND next_sync_at < $1",
                &[&until, &awbs],
            )
            .await?;
        Ok(updated)
    }

    async fn get_shipment(&self, awb: &str) -> StoreResult<Option<Shipment>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!("SELECT {SHIPMENT_COLUMNS} FROM shipments WHERE awb = $1"),
                &[&awb],
            )
            .await?;
        row.as_ref().map(shipment_from_row).transpose()
    }

    async fn insert_new(&self, awbs: &[String], now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        if awbs.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client().await?;
        let rows = client
            .query(
                "INSERT INTO shipments (awb, next_sync_at, sync_priority, sync_failures, is_rto, created_at, updated_at)
                 SELECT a, $2::timestamptz, $3::smallint, 0, FALSE, $2::timestamptz, $2::timestamptz
                 FROM UNNEST($1::text[]) AS a
                 ON CONFLICT (awb) DO NOTHING
                 RETURNING awb",
                &[&awbs, &now, &NEW_SHIPMENT_PRIORITY],
            )
            .await?;

        let inserted: HashSet<String> = rows
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<_, _>>()?;
        Ok(awbs.iter().filter(|a| inserted.contains(*a)).cloned().collect())
    }

    async fn upsert_full(&self, update: &ShipmentUpdate) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO shipments (
                     awb, status_code, status_desc, current_location, shipper, origin, destination,
                     product_type, weight, is_rto, raw_payload, data_hash, last_synced_at,
                     next_sync_at, sync_priority, sync_failures, last_error, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 0, NULL, $13, $13)
                 ON CONFLICT (awb) DO UPDATE SET
                     status_code = EXCLUDED.status_code,
                     status_desc = EXCLUDED.status_desc,
                     current_location = EXCLUDED.current_location,
                     shipper = EXCLUDED.shipper,
                     origin = EXCLUDED.origin,
                     destination = EXCLUDED.destination,
                     product_type = EXCLUDED.product_type,
                     weight = EXCLUDED.weight,
                     is_rto = EXCLUDED.is_rto,
                     raw_payload = EXCLUDED.raw_payload,
                     data_hash = EXCLUDED.data_hash,
                     last_synced_at = EXCLUDED.last_synced_at,
                     next_sync_at = EXCLUDED.next_sync_at,
                     sync_priority = EXCLUDED.sync_priority,
                     sync_failures = 0,
                     last_error = NULL,
                     updated_at = EXCLUDED.updated_at",
                &[
                    &update.awb,
                    &update.status_code,
                    &update.status_desc,
                    &update.current_location,
                    &update.shipper,
                    &update.origin,
                    &update.destination,
                    &update.product_type,
                    &update.weight,
                    &update.is_rto,
                    &update.raw_payload,
                    &update.data_hash,
                    &update.synced_at,
                    &update.next_sync_at,
                    &update.sync_priority,
                ],
            )
            .await?;
        Ok(())
    }

    async fn touch_unchanged(
        &self,
        awb: &str,
        synced_at: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
        sync_priority: i16,
    ) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE shipments
                 SET last_synced_at = $1, next_sync_at = $2, sync_priority = $3,
                     sync_failures = 0, last_error = NULL
                 WHERE awb = $4",
                &[&synced_at, &next_sync_at, &sync_priority, &awb],
            )
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        awb: &str,
        sync_failures: i32,
        next_sync_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE shipments SET sync_failures = $1, next_sync_at = $2, last_error = $3
                 WHERE awb = $4",
                &[&sync_failures, &next_sync_at, &error, &awb],
            )
            .await?;
        Ok(())
    }

    async fn reset_failures(&self, awb: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let client = self.client().await?;
        let changed = client
            .execute(
                "UPDATE shipments SET sync_failures = 0, last_error = NULL, next_sync_at = $1
                 WHERE awb = $2",
                &[&now, &awb],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn backlog(&self, now: DateTime<Utc>) -> StoreResult<Backlog> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*),
                        COUNT(*) FILTER (WHERE next_sync_at <= $1 AND sync_failures < $2),
                        COUNT(*) FILTER (WHERE sync_failures >= $2),
                        MIN(last_synced_at)
                 FROM shipments",
                &[&now, &MAX_SYNC_FAILURES],
            )
            .await?;

        let count = |idx: usize| -> StoreResult<u64> {
            Ok(row.try_get::<_, i64>(idx)?.max(0) as u64)
        };
        Ok(Backlog {
            total: count(0)?,
            due: count(1)?,
            quarantined: count(2)?,
            oldest_synced_at: row.try_get(3)?,
        })
    }

    async fn create_batch(&self, batch: &SyncBatch) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO sync_batches (batch_id, total_awbs, status, created_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (batch_id) DO NOTHING",
                &[
                    &batch.batch_id,
                    &batch.total_awbs,
                    &batch.status.as_str(),
                    &batch.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn start_batch(
        &self,
        batch_id: &str,
        total_awbs: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO sync_batches (batch_id, total_awbs, status, created_at, started_at)
                 VALUES ($1, $2, 'running', $3, $3)
                 ON CONFLICT (batch_id) DO UPDATE SET
                     total_awbs = EXCLUDED.total_awbs,
                     processed = 0, succeeded = 0, failed = 0, skipped = 0,
                     status = 'running',
                     started_at = EXCLUDED.started_at,
                     completed_at = NULL",
                &[&batch_id, &total_awbs, &now],
            )
            .await?;
        Ok(())
    }

    async fn update_batch_progress(
        &self,
        batch_id: &str,
        counters: &BatchCounters,
    ) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE sync_batches SET processed = $1, succeeded = $2, failed = $3, skipped = $4
                 WHERE batch_id = $5",
                &[
                    &counters.processed,
                    &counters.succeeded,
                    &counters.failed,
                    &counters.skipped,
                    &batch_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        counters: &BatchCounters,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE sync_batches
                 SET processed = $1, succeeded = $2, failed = $3, skipped = $4,
                     status = $5, completed_at = $6
                 WHERE batch_id = $7",
                &[
                    &counters.processed,
                    &counters.succeeded,
                    &counters.failed,
                    &counters.skipped,
                    &status.as_str(),
                    &now,
                    &batch_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<SyncBatch>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!("SELECT {BATCH_COLUMNS} FROM sync_batches WHERE batch_id = $1"),
                &[&batch_id],
            )
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn recent_batches(&self, limit: usize) -> StoreResult<Vec<SyncBatch>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM sync_batches ORDER BY created_at DESC LIMIT $1"
                ),
                &[&sql_limit(limit)],
            )
            .await?;
        map_rows(&rows, batch_from_row)
    }

    async fn insert_log(&self, log: &SyncLog) -> StoreResult<()> {
        let client = self.client().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO sync_logs ({LOG_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
                ),
                &[
                    &log.batch_id,
                    &log.awb,
                    &log.success,
                    &log.changed,
                    &log.error_code,
                    &log.error_message,
                    &log.response_time_ms,
                    &log.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn recent_logs(&self, failed_only: bool, limit: usize) -> StoreResult<Vec<SyncLog>> {
        let filter = if failed_only { "WHERE NOT success" } else { "" };
        let client = self.client().await?;
        let rows = client
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM sync_logs {filter} ORDER BY id DESC LIMIT $1"),
                &[&sql_limit(limit)],
            )
            .await?;
        map_rows(&rows, log_from_row)
    }

    async fn logs_for(&self, awb: &str, limit: usize) -> StoreResult<Vec<SyncLog>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM sync_logs WHERE awb = $1 ORDER BY id DESC LIMIT $2"
                ),
                &[&awb, &sql_limit(limit)],
            )
            .await?;
        map_rows(&rows, log_from_row)
    }

    async fn purge_logs(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let client = self.client().await?;
        let deleted = client
            .execute("DELETE FROM sync_logs WHERE created_at < $1", &[&before])
            .await?;
        Ok(deleted)
    }

    async fn purge_batches(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM sync_batches
                 WHERE status IN ('completed', 'failed') AND completed_at < $1",
                &[&before],
            )
            .await?;
        Ok(deleted)
    }
}
