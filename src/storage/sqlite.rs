//! SQLite shipment store for single-node runs and tests
//!
//! Timestamps are stored as Unix milliseconds so comparisons stay numeric.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{sql_limit, ShipmentStore, StoreResult};
use crate::error::StorageError;
use crate::models::{
    Backlog, BatchCounters, BatchStatus, DueShipment, Shipment, ShipmentUpdate, SyncBatch,
    SyncLog, MAX_SYNC_FAILURES,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS shipments (
        awb TEXT PRIMARY KEY,
        status_code TEXT,
        status_desc TEXT,
        current_location TEXT,
        shipper TEXT,
        origin TEXT,
        destination TEXT,
        product_type TEXT,
        weight REAL,
        is_rto INTEGER NOT NULL DEFAULT 0,
        raw_payload TEXT,
        data_hash TEXT,
        last_synced_at INTEGER,
        next_sync_at INTEGER NOT NULL,
        sync_priority INTEGER NOT NULL DEFAULT 5,
        sync_failures INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_shipments_due
        ON shipments(sync_priority, next_sync_at, sync_failures);

    CREATE INDEX IF NOT EXISTS idx_shipments_status
        ON shipments(status_code);

    CREATE TABLE IF NOT EXISTS sync_batches (
        batch_id TEXT PRIMARY KEY,
        total_awbs INTEGER NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0,
        succeeded INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        skipped INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_sync_batches_created
        ON sync_batches(created_at);

    CREATE TABLE IF NOT EXISTS sync_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id TEXT,
        awb TEXT NOT NULL,
        success INTEGER NOT NULL,
        changed INTEGER NOT NULL DEFAULT 0,
        error_code TEXT,
        error_message TEXT,
        response_time_ms INTEGER,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sync_logs_created
        ON sync_logs(created_at);

    CREATE INDEX IF NOT EXISTS idx_sync_logs_awb
        ON sync_logs(awb);
"#;

const SHIPMENT_COLUMNS: &str = "awb, status_code, status_desc, current_location, shipper, origin, \
     destination, product_type, weight, is_rto, raw_payload, data_hash, last_synced_at, \
     next_sync_at, sync_priority, sync_failures, last_error, created_at, updated_at";

const BATCH_COLUMNS: &str = "batch_id, total_awbs, processed, succeeded, failed, skipped, status, \
     created_at, started_at, completed_at";

const LOG_COLUMNS: &str = "batch_id, awb, success, changed, error_code, error_message, \
     response_time_ms, created_at";

/// SQLite-backed store
///
/// Uses `Mutex` to serialise access to the single connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory SQLite")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn create_schema(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

fn shipment_from_row(row: &Row<'_>) -> rusqlite::Result<Shipment> {
    let raw_payload = match row.get::<_, Option<String>>(10)? {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };

    Ok(Shipment {
        awb: row.get(0)?,
        status_code: row.get(1)?,
        status_desc: row.get(2)?,
        current_location: row.get(3)?,
        shipper: row.get(4)?,
        origin: row.get(5)?,
        destination: row.get(6)?,
        product_type: row.get(7)?,
        weight: row.get(8)?,
        is_rto: row.get(9)?,
        raw_payload,
        data_hash: row.get(11)?,
        last_synced_at: opt_ts(row, 12)?,
        next_sync_at: ts(row, 13)?,
        sync_priority: row.get(14)?,
        sync_failures: row.get(15)?,
        last_error: row.get(16)?,
        created_at: ts(row, 17)?,
        updated_at: ts(row, 18)?,
    })
}

fn due_from_row(row: &Row<'_>) -> rusqlite::Result<DueShipment> {
    Ok(DueShipment {
        awb: row.get(0)?,
        sync_priority: row.get(1)?,
        next_sync_at: ts(row, 2)?,
        sync_failures: row.get(3)?,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<SyncBatch> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<BatchStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into()))?;

    Ok(SyncBatch {
        batch_id: row.get(0)?,
        total_awbs: row.get(1)?,
        counters: BatchCounters {
            processed: row.get(2)?,
            succeeded: row.get(3)?,
            failed: row.get(4)?,
            skipped: row.get(5)?,
        },
        status,
        created_at: ts(row, 7)?,
        started_at: opt_ts(row, 8)?,
        completed_at: opt_ts(row, 9)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<SyncLog> {
    Ok(SyncLog {
        batch_id: row.get(0)?,
        awb: row.get(1)?,
        success: row.get(2)?,
        changed: row.get(3)?,
        error_code: row.get(4)?,
        error_message: row.get(5)?,
        response_time_ms: row.get(6)?,
        created_at: ts(row, 7)?,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

// ============================================================================
// ShipmentStore
// ============================================================================

#[async_trait]
impl ShipmentStore for SqliteStore {
    async fn migrate(&self) -> StoreResult<()> {
        self.create_schema()
    }

    async fn ping(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DueShipment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT awb, sync_priority, next_sync_at, sync_failures FROM shipments
             WHERE next_sync_at <= ?1 AND sync_failures < ?2
             ORDER BY sync_priority ASC, next_sync_at ASC, sync_failures ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![now.timestamp_millis(), MAX_SYNC_FAILURES, sql_limit(limit)],
                due_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
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

        let query = format!(
            "SELECT awb, sync_priority, next_sync_at, sync_failures FROM shipments
             WHERE next_sync_at <= ? AND sync_failures < ? AND UPPER(status_code) IN ({})
             ORDER BY sync_priority ASC, next_sync_at ASC, sync_failures ASC
             LIMIT ?",
            placeholders(codes.len())
        );

        let now_ms = now.timestamp_millis();
        let limit = sql_limit(limit);
        let mut values: Vec<&dyn ToSql> = vec![&now_ms, &MAX_SYNC_FAILURES];
        values.extend(codes.iter().map(|c| c as &dyn ToSql));
        values.push(&limit);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(values), due_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn mark_enqueued(&self, awbs: &[String], until: DateTime<Utc>) -> StoreResult<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut updated = 0u64;
        {
            let mut stmt = tx.prepare(
                "UPDATE shipments SET next_sync_at = ?1 WHERE awb = ?2 AND next_sync_at < ?1",
            )?;
            for awb in awbs {
                updated += stmt.execute(params![until.timestamp_millis(), awb])? as u64;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    async fn get_shipment(&self, awb: &str) -> StoreResult<Option<Shipment>> {
        let conn = self.conn()?;
        let shipment = conn
            .query_row(
                &format!("SELECT {SHIPMENT_COLUMNS} FROM shipments WHERE awb = ?1"),
                params![awb],
                shipment_from_row,
            )
            .optional()?;
        Ok(shipment)
    }

    async fn insert_new(&self, awbs: &[String], now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO shipments (awb, next_sync_at, sync_priority, sync_failures, is_rto, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, ?4)
                 ON CONFLICT(awb) DO NOTHING",
            )?;
            for awb in awbs {
                let fresh = Shipment::new_tracked(awb, now);
                let changed = stmt.execute(params![
                    fresh.awb,
                    fresh.next_sync_at.timestamp_millis(),
                    fresh.sync_priority,
                    fresh.created_at.timestamp_millis(),
                ])?;
                if changed > 0 {
                    inserted.push(fresh.awb);
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    async fn upsert_full(&self, update: &ShipmentUpdate) -> StoreResult<()> {
        let payload = serde_json::to_string(&update.raw_payload)?;
        let synced_ms = update.synced_at.timestamp_millis();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO shipments (
                 awb, status_code, status_desc, current_location, shipper, origin, destination,
                 product_type, weight, is_rto, raw_payload, data_hash, last_synced_at,
                 next_sync_at, sync_priority, sync_failures, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, NULL, ?13, ?13)
             ON CONFLICT(awb) DO UPDATE SET
                 status_code = excluded.status_code,
                 status_desc = excluded.status_desc,
                 current_location = excluded.current_location,
                 shipper = excluded.shipper,
                 origin = excluded.origin,
                 destination = excluded.destination,
                 product_type = excluded.product_type,
                 weight = excluded.weight,
                 is_rto = excluded.is_rto,
                 raw_payload = excluded.raw_payload,
                 data_hash = excluded.data_hash,
                 last_synced_at = excluded.last_synced_at,
                 next_sync_at = excluded.next_sync_at,
                 sync_priority = excluded.sync_priority,
                 sync_failures = 0,
                 last_error = NULL,
                 updated_at = excluded.updated_at",
            params![
                update.awb,
                update.status_code,
                update.status_desc,
                update.current_location,
                update.shipper,
                update.origin,
                update.destination,
                update.product_type,
                update.weight,
                update.is_rto,
                payload,
                update.data_hash,
                synced_ms,
                update.next_sync_at.timestamp_millis(),
                update.sync_priority,
            ],
        )?;
        Ok(())
    }

    async fn touch_unchanged(
        &self,
        awb: &str,
        synced_at: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
        sync_priority: i16,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE shipments
             SET last_synced_at = ?1, next_sync_at = ?2, sync_priority = ?3,
                 sync_failures = 0, last_error = NULL
             WHERE awb = ?4",
            params![
                synced_at.timestamp_millis(),
                next_sync_at.timestamp_millis(),
                sync_priority,
                awb
            ],
        )?;
        Ok(())
    }

    async fn record_failure(
        &self,
        awb: &str,
        sync_failures: i32,
        next_sync_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE shipments SET sync_failures = ?1, next_sync_at = ?2, last_error = ?3
             WHERE awb = ?4",
            params![sync_failures, next_sync_at.timestamp_millis(), error, awb],
        )?;
        Ok(())
    }

    async fn reset_failures(&self, awb: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE shipments SET sync_failures = 0, last_error = NULL, next_sync_at = ?1
             WHERE awb = ?2",
            params![now.timestamp_millis(), awb],
        )?;
        Ok(changed > 0)
    }

    async fn backlog(&self, now: DateTime<Utc>) -> StoreResult<Backlog> {
        let conn = self.conn()?;
        let (total, due, quarantined, oldest) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE next_sync_at <= ?1 AND sync_failures < ?2),
                    COUNT(*) FILTER (WHERE sync_failures >= ?2),
                    MIN(last_synced_at)
             FROM shipments",
            params![now.timestamp_millis(), MAX_SYNC_FAILURES],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    opt_ts(row, 3)?,
                ))
            },
        )?;

        Ok(Backlog {
            total: total.max(0) as u64,
            due: due.max(0) as u64,
            quarantined: quarantined.max(0) as u64,
            oldest_synced_at: oldest,
        })
    }

    async fn create_batch(&self, batch: &SyncBatch) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_batches (batch_id, total_awbs, status, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(batch_id) DO NOTHING",
            params![
                batch.batch_id,
                batch.total_awbs,
                batch.status.as_str(),
                batch.created_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    async fn start_batch(
        &self,
        batch_id: &str,
        total_awbs: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_batches (batch_id, total_awbs, status, created_at, started_at)
             VALUES (?1, ?2, 'running', ?3, ?3)
             ON CONFLICT(batch_id) DO UPDATE SET
                 total_awbs = excluded.total_awbs,
                 processed = 0, succeeded = 0, failed = 0, skipped = 0,
                 status = 'running',
                 started_at = excluded.started_at,
                 completed_at = NULL",
            params![batch_id, total_awbs, now.timestamp_millis()],
        )?;
        Ok(())
    }

    async fn update_batch_progress(
        &self,
        batch_id: &str,
        counters: &BatchCounters,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_batches SET processed = ?1, succeeded = ?2, failed = ?3, skipped = ?4
             WHERE batch_id = ?5",
            params![
                counters.processed,
                counters.succeeded,
                counters.failed,
                counters.skipped,
                batch_id
            ],
        )?;
        Ok(())
    }

    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        counters: &BatchCounters,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_batches
             SET processed = ?1, succeeded = ?2, failed = ?3, skipped = ?4,
                 status = ?5, completed_at = ?6
             WHERE batch_id = ?7",
            params![
                counters.processed,
                counters.succeeded,
                counters.failed,
                counters.skipped,
                status.as_str(),
                now.timestamp_millis(),
                batch_id
            ],
        )?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> StoreResult<Option<SyncBatch>> {
        let conn = self.conn()?;
        let batch = conn
            .query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM sync_batches WHERE batch_id = ?1"),
                params![batch_id],
                batch_from_row,
            )
            .optional()?;
        Ok(batch)
    }

    async fn recent_batches(&self, limit: usize) -> StoreResult<Vec<SyncBatch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BATCH_COLUMNS} FROM sync_batches ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![sql_limit(limit)], batch_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn insert_log(&self, log: &SyncLog) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO sync_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                log.batch_id,
                log.awb,
                log.success,
                log.changed,
                log.error_code,
                log.error_message,
                log.response_time_ms,
                log.created_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    async fn recent_logs(&self, failed_only: bool, limit: usize) -> StoreResult<Vec<SyncLog>> {
        let filter = if failed_only { "WHERE success = 0" } else { "" };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM sync_logs {filter} ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![sql_limit(limit)], log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn logs_for(&self, awb: &str, limit: usize) -> StoreResult<Vec<SyncLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM sync_logs WHERE awb = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![awb, sql_limit(limit)], log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn purge_logs(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM sync_logs WHERE created_at < ?1",
            params![before.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }

    async fn purge_batches(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM sync_batches
             WHERE status IN ('completed', 'failed') AND completed_at < ?1",
            params![before.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn update(awb: &str, code: &str, at: DateTime<Utc>) -> ShipmentUpdate {
        ShipmentUpdate {
            awb: awb.to_string(),
            status_code: Some(code.to_string()),
            status_desc: Some("desc".to_string()),
            current_location: Some("Mumbai Hub".to_string()),
            shipper: None,
            origin: Some("BOM".to_string()),
            destination: Some("PNQ".to_string()),
            product_type: None,
            weight: Some(1.5),
            is_rto: false,
            raw_payload: json!({"status": "Success"}),
            data_hash: "abc".to_string(),
            synced_at: at,
            next_sync_at: at + Duration::minutes(30),
            sync_priority: 1,
        }
    }

    #[tokio::test]
    async fn test_insert_new_skips_existing() {
        let store = SqliteStore::in_memory().unwrap();
        let awbs = vec!["AWB1".to_string(), "AWB2".to_string()];
        assert_eq!(store.insert_new(&awbs, t0()).await.unwrap(), awbs);

        let again = vec!["AWB2".to_string(), "AWB3".to_string()];
        assert_eq!(store.insert_new(&again, t0()).await.unwrap(), vec!["AWB3".to_string()]);

        let s = store.get_shipment("AWB1").await.unwrap().unwrap();
        assert_eq!(s.next_sync_at, t0());
        assert_eq!(s.sync_priority, 1);
        assert!(s.status_code.is_none());
    }

    #[tokio::test]
    async fn test_select_due_ordering_and_quarantine() {
        let store = SqliteStore::in_memory().unwrap();
        let awbs: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        store.insert_new(&awbs, t0()).await.unwrap();

        // B: lower priority; C: more failures; D: quarantined
        store.touch_unchanged("B", t0(), t0(), 5).await.unwrap();
        store.record_failure("C", 2, t0(), "boom").await.unwrap();
        store.record_failure("D", MAX_SYNC_FAILURES, t0(), "boom").await.unwrap();

        let due = store.select_due(t0(), 10).await.unwrap();
        let order: Vec<&str> = due.iter().map(|d| d.awb.as_str()).collect();
        assert_eq!(order, vec!["A", "C", "B"]);

        assert_eq!(store.select_due(t0(), 1).await.unwrap().len(), 1);
        assert!(store.select_due(t0() - Duration::seconds(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_select_volatile_due() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_full(&update("OFD1", "ofd", t0())).await.unwrap();
        store.upsert_full(&update("DL1", "DL", t0())).await.unwrap();

        let later = t0() + Duration::hours(1);
        let codes = vec!["OFD".to_string(), "UD".to_string()];
        let due = store.select_volatile_due(later, &codes, 100).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].awb, "OFD1");

        assert!(store.select_volatile_due(t0(), &codes, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_enqueued_only_moves_forward() {
        let store = SqliteStore::in_memory().unwrap();
        let awbs = vec!["A".to_string()];
        store.insert_new(&awbs, t0()).await.unwrap();

        let lease = t0() + Duration::hours(4);
        assert_eq!(store.mark_enqueued(&awbs, lease).await.unwrap(), 1);
        assert_eq!(store.mark_enqueued(&awbs, t0()).await.unwrap(), 0);
        assert_eq!(store.get_shipment("A").await.unwrap().unwrap().next_sync_at, lease);
    }

    #[tokio::test]
    async fn test_upsert_then_touch_keeps_record() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_new(&["AWB1".to_string()], t0()).await.unwrap();
        store.record_failure("AWB1", 3, t0(), "timeout").await.unwrap();
        store.upsert_full(&update("AWB1", "OFD", t0())).await.unwrap();

        let first = store.get_shipment("AWB1").await.unwrap().unwrap();
        assert_eq!(first.sync_failures, 0);
        assert!(first.last_error.is_none());
        assert_eq!(first.created_at, t0());
        assert_eq!(first.data_hash.as_deref(), Some("abc"));
        assert_eq!(first.raw_payload, Some(json!({"status": "Success"})));

        let later = t0() + Duration::minutes(45);
        store
            .touch_unchanged("AWB1", later, later + Duration::minutes(30), 1)
            .await
            .unwrap();
        let second = store.get_shipment("AWB1").await.unwrap().unwrap();
        assert_eq!(second.last_synced_at, Some(later));
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(second.status_desc, first.status_desc);
        assert_eq!(second.raw_payload, first.raw_payload);
    }

    #[tokio::test]
    async fn test_touch_writes_only_scheduling_columns() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_full(&update("AWB1", "RTO", t0())).await.unwrap();
        store.record_failure("AWB1", 2, t0(), "timeout").await.unwrap();
        let before = store.get_shipment("AWB1").await.unwrap().unwrap();

        let later = t0() + Duration::hours(2);
        let next = later + Duration::hours(12);
        store.touch_unchanged("AWB1", later, next, 7).await.unwrap();
        let after = store.get_shipment("AWB1").await.unwrap().unwrap();

        assert_eq!(after.last_synced_at, Some(later));
        assert_eq!(after.next_sync_at, next);
        assert_eq!(after.sync_priority, 7);
        assert_eq!(after.sync_failures, 0);
        assert!(after.last_error.is_none());

        assert_eq!(after.status_code, before.status_code);
        assert_eq!(after.current_location, before.current_location);
        assert_eq!(after.weight, before.weight);
        assert_eq!(after.data_hash, before.data_hash);
        assert_eq!(after.raw_payload, before.raw_payload);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn test_reset_failures() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_new(&["AWB1".to_string()], t0()).await.unwrap();
        store
            .record_failure("AWB1", MAX_SYNC_FAILURES, t0() + Duration::days(1), "boom")
            .await
            .unwrap();

        let now = t0() + Duration::hours(2);
        assert!(store.reset_failures("AWB1", now).await.unwrap());
        assert!(!store.reset_failures("NOPE", now).await.unwrap());

        let s = store.get_shipment("AWB1").await.unwrap().unwrap();
        assert_eq!(s.sync_failures, 0);
        assert!(s.is_due(now));
    }

    #[tokio::test]
    async fn test_backlog() {
        let store = SqliteStore::in_memory().unwrap();
        let awbs: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        store.insert_new(&awbs, t0()).await.unwrap();
        store.record_failure("B", MAX_SYNC_FAILURES, t0(), "boom").await.unwrap();
        store.upsert_full(&update("C", "OFD", t0())).await.unwrap();

        let backlog = store.backlog(t0()).await.unwrap();
        assert_eq!(backlog.total, 3);
        assert_eq!(backlog.due, 1);
        assert_eq!(backlog.quarantined, 1);
        assert_eq!(backlog.oldest_synced_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let batch = SyncBatch {
            batch_id: "b1".to_string(),
            total_awbs: 3,
            counters: BatchCounters::default(),
            status: BatchStatus::Pending,
            created_at: t0(),
            started_at: None,
            completed_at: None,
        };
        store.create_batch(&batch).await.unwrap();
        store.create_batch(&batch).await.unwrap();

        store.start_batch("b1", 3, t0()).await.unwrap();
        let mut counters = BatchCounters::default();
        counters.record(true);
        counters.record(false);
        store.update_batch_progress("b1", &counters).await.unwrap();
        counters.skip(1);
        let done = t0() + Duration::minutes(1);
        store
            .finish_batch("b1", BatchStatus::Completed, &counters, done)
            .await
            .unwrap();

        let stored = store.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.counters, BatchCounters { processed: 2, succeeded: 1, failed: 1, skipped: 1 });
        assert_eq!(stored.completed_at, Some(done));

        // Unknown batch ids are created on start
        store.start_batch("b2", 1, t0()).await.unwrap();
        assert_eq!(store.get_batch("b2").await.unwrap().unwrap().status, BatchStatus::Running);
        assert_eq!(store.recent_batches(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_logs_and_retention() {
        let store = SqliteStore::in_memory().unwrap();
        let old = t0() - Duration::days(8);
        store.insert_log(&SyncLog::success(None, "A", true, 120, old)).await.unwrap();
        store
            .insert_log(&SyncLog::failure(Some("b1"), "A", "CIRCUIT_OPEN", "open", None, t0()))
            .await
            .unwrap();

        let failed = store.recent_logs(true, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_code.as_deref(), Some("CIRCUIT_OPEN"));
        assert_eq!(store.logs_for("A", 10).await.unwrap().len(), 2);

        assert_eq!(store.purge_logs(t0() - Duration::days(7)).await.unwrap(), 1);
        assert_eq!(store.recent_logs(false, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_batches_keeps_running() {
        let store = SqliteStore::in_memory().unwrap();
        let old = t0() - Duration::days(31);
        store.start_batch("done", 1, old).await.unwrap();
        store
            .finish_batch("done", BatchStatus::Completed, &BatchCounters::default(), old)
            .await
            .unwrap();
        store.start_batch("stuck", 1, old).await.unwrap();

        assert_eq!(store.purge_batches(t0() - Duration::days(30)).await.unwrap(), 1);
        assert!(store.get_batch("stuck").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("awbsync.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store.insert_new(&["AWB1".to_string()], t0()).await.unwrap();
        }
        let reopened = SqliteStore::new(&path).unwrap();
        reopened.ping().await.unwrap();
        assert!(reopened.get_shipment("AWB1").await.unwrap().is_some());
    }
}
