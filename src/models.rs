//! Core data structures shared by the scheduler, worker and stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure count at which a shipment leaves automatic scheduling
pub const MAX_SYNC_FAILURES: i32 = 10;

/// Hard concurrency ceiling imposed by the courier API
pub const UPSTREAM_MAX_CONCURRENCY: u32 = 20;

/// Hard request budget per minute imposed by the courier API
pub const UPSTREAM_MAX_REQUESTS_PER_MINUTE: u32 = 60;

/// Maximum AWBs in one logical batch
pub const UPSTREAM_MAX_BATCH: usize = 20;

/// Sync priority of a shipment that has never been synced
pub const NEW_SHIPMENT_PRIORITY: i16 = 1;

/// Longest AWB accepted after sanitisation
const MAX_AWB_LEN: usize = 40;

// ============================================================================
// AWB handling
// ============================================================================

/// Strip everything but ASCII letters and digits from an AWB
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_awb(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_AWB_LEN)
        .collect();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Sanitise a list of AWBs, dropping empties and duplicates while keeping order
pub fn sanitize_awbs<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.iter()
        .filter_map(|a| sanitize_awb(a.as_ref()))
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

// ============================================================================
// Status classes
// ============================================================================

/// Scheduling class derived from an upstream status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// Delivered or cancelled; nothing more will happen
    Terminal,
    /// Travelling back to the shipper
    ReturnToOrigin,
    /// Out for delivery or delivery scheduled today
    OutForDelivery,
    /// Delivery attempted and failed
    Undelivered,
    /// Anything else, including never synced
    InTransit,
}

const TERMINAL_CODES: &[&str] = &["DL", "DELIVERED", "CN", "CANCELLED", "CANCELED", "RTD"];
const RTO_CODES: &[&str] = &["RTO", "RTO-IT", "RTO_IN_TRANSIT", "RT"];
const OFD_CODES: &[&str] = &["OFD", "OUT_FOR_DELIVERY", "DS", "DELIVERY_SCHEDULED"];
const UNDELIVERED_CODES: &[&str] = &["UD", "UNDELIVERED", "NDR"];

impl StatusClass {
    /// Classify a raw status code (case-insensitive); `None` is in transit
    pub fn from_code(code: Option<&str>) -> Self {
        let Some(code) = code else {
            return Self::InTransit;
        };
        let upper = code.trim().to_ascii_uppercase();
        let code = upper.as_str();

        if TERMINAL_CODES.contains(&code) {
            Self::Terminal
        } else if RTO_CODES.contains(&code) {
            Self::ReturnToOrigin
        } else if OFD_CODES.contains(&code) {
            Self::OutForDelivery
        } else if UNDELIVERED_CODES.contains(&code) {
            Self::Undelivered
        } else {
            Self::InTransit
        }
    }

    /// Base interval between syncs for this class
    pub fn base_interval(self) -> chrono::Duration {
        match self {
            Self::Terminal => chrono::Duration::hours(24),
            Self::ReturnToOrigin => chrono::Duration::hours(12),
            Self::OutForDelivery => chrono::Duration::minutes(30),
            Self::Undelivered => chrono::Duration::hours(2),
            Self::InTransit => chrono::Duration::hours(1),
        }
    }

    /// Scheduling priority written back to the shipment (1 = highest)
    pub fn sync_priority(self) -> i16 {
        match self {
            Self::OutForDelivery => 1,
            Self::Undelivered => 2,
            Self::InTransit => 5,
            Self::ReturnToOrigin => 7,
            Self::Terminal => 10,
        }
    }

    /// Whether the priority sweep should look at this class
    pub fn is_volatile(self) -> bool {
        matches!(self, Self::OutForDelivery | Self::Undelivered)
    }

    /// Upper-cased status codes the priority sweep selects on
    pub fn volatile_codes() -> Vec<String> {
        OFD_CODES
            .iter()
            .chain(UNDELIVERED_CODES.iter())
            .map(|c| (*c).to_string())
            .collect()
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Terminal => "terminal",
            Self::ReturnToOrigin => "return_to_origin",
            Self::OutForDelivery => "out_for_delivery",
            Self::Undelivered => "undelivered",
            Self::InTransit => "in_transit",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Shipment
// ============================================================================

/// One tracked AWB as mirrored in the shipment store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub awb: String,
    pub status_code: Option<String>,
    pub status_desc: Option<String>,
    pub current_location: Option<String>,
    pub shipper: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub product_type: Option<String>,
    pub weight: Option<f64>,
    pub is_rto: bool,
    pub raw_payload: Option<serde_json::Value>,
    pub data_hash: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub next_sync_at: DateTime<Utc>,
    pub sync_priority: i16,
    pub sync_failures: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shipment {
    /// A freshly tracked shipment, due immediately
    pub fn new_tracked(awb: &str, now: DateTime<Utc>) -> Self {
        Self {
            awb: awb.to_string(),
            next_sync_at: now,
            sync_priority: NEW_SHIPMENT_PRIORITY,
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    /// Status class of the last known status
    pub fn status_class(&self) -> StatusClass {
        StatusClass::from_code(self.status_code.as_deref())
    }

    /// Whether automatic scheduling has given up on this shipment
    pub fn is_quarantined(&self) -> bool {
        self.sync_failures >= MAX_SYNC_FAILURES
    }

    /// Whether the sweeps would pick this shipment up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_quarantined() && self.next_sync_at <= now
    }
}

/// Minimal projection the sweeps work with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DueShipment {
    pub awb: String,
    pub sync_priority: i16,
    pub next_sync_at: DateTime<Utc>,
    pub sync_failures: i32,
}

/// Full record written when the upstream data changed (or on first sync)
#[derive(Debug, Clone, PartialEq)]
pub struct ShipmentUpdate {
    pub awb: String,
    pub status_code: Option<String>,
    pub status_desc: Option<String>,
    pub current_location: Option<String>,
    pub shipper: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub product_type: Option<String>,
    pub weight: Option<f64>,
    pub is_rto: bool,
    pub raw_payload: serde_json::Value,
    pub data_hash: String,
    pub synced_at: DateTime<Utc>,
    pub next_sync_at: DateTime<Utc>,
    pub sync_priority: i16,
}

/// Operator-facing backlog figures
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Backlog {
    /// All tracked shipments
    pub total: u64,
    /// Shipments due now and eligible for automatic scheduling
    pub due: u64,
    /// Shipments at the failure cap
    pub quarantined: u64,
    /// Oldest successful sync among tracked shipments
    pub oldest_synced_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Batches
// ============================================================================

/// Lifecycle of a sync batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    /// Whether the batch has finished one way or another
    pub fn is_final(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status '{other}'")),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-batch progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub processed: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub skipped: i32,
}

impl BatchCounters {
    /// Count one finished AWB attempt
    pub fn record(&mut self, success: bool) {
        self.processed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Count AWBs left untouched
    pub fn skip(&mut self, count: usize) {
        self.skipped += i32::try_from(count).unwrap_or(i32::MAX);
    }
}

/// One sync batch (exactly one per enqueued job)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub batch_id: String,
    pub total_awbs: i32,
    pub counters: BatchCounters,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Audit log
// ============================================================================

/// Append-only audit row for one AWB attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub batch_id: Option<String>,
    pub awb: String,
    pub success: bool,
    pub changed: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl SyncLog {
    /// Successful attempt
    pub fn success(
        batch_id: Option<&str>,
        awb: &str,
        changed: bool,
        response_time_ms: i64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: batch_id.map(str::to_string),
            awb: awb.to_string(),
            success: true,
            changed,
            error_code: None,
            error_message: None,
            response_time_ms: Some(response_time_ms),
            created_at: at,
        }
    }

    /// Failed attempt
    pub fn failure(
        batch_id: Option<&str>,
        awb: &str,
        code: &str,
        message: &str,
        response_time_ms: Option<i64>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: batch_id.map(str::to_string),
            awb: awb.to_string(),
            success: false,
            changed: false,
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            response_time_ms,
            created_at: at,
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Where a job came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullSweep,
    PrioritySweep,
    Manual,
}

impl JobKind {
    /// Queue priority for jobs of this kind (1 = highest)
    pub fn queue_priority(self) -> u8 {
        match self {
            JobKind::Manual => 1,
            JobKind::PrioritySweep => 2,
            JobKind::FullSweep => 5,
        }
    }

    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::FullSweep => "full",
            JobKind::PrioritySweep => "priority",
            JobKind::Manual => "manual",
        }
    }
}

/// Queue payload: one batch of AWBs to sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Also the job id in the queue
    pub batch_id: String,
    pub awbs: Vec<String>,
    pub kind: JobKind,
}

impl SyncJob {
    /// Create a job with a fresh batch id
    pub fn new(awbs: Vec<String>, kind: JobKind) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            awbs,
            kind,
        }
    }

    /// Queue priority of this job
    pub fn priority(&self) -> u8 {
        self.kind.queue_priority()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_awb() {
        assert_eq!(sanitize_awb("AWB-0001"), Some("AWB0001".to_string()));
        assert_eq!(sanitize_awb(" 12 34\n"), Some("1234".to_string()));
        assert_eq!(sanitize_awb("'; DROP TABLE--"), Some("DROPTABLE".to_string()));
        assert_eq!(sanitize_awb("--"), None);
        assert_eq!(sanitize_awb("ａｂｃ"), None);
    }

    #[test]
    fn test_sanitize_awbs_dedups() {
        let cleaned = sanitize_awbs(&["A-1", "A1", "", "B2"]);
        assert_eq!(cleaned, vec!["A1".to_string(), "B2".to_string()]);
    }

    #[test]
    fn test_status_class_mapping() {
        assert_eq!(StatusClass::from_code(Some("DL")), StatusClass::Terminal);
        assert_eq!(StatusClass::from_code(Some("cancelled")), StatusClass::Terminal);
        assert_eq!(StatusClass::from_code(Some("RTO")), StatusClass::ReturnToOrigin);
        assert_eq!(StatusClass::from_code(Some("ofd")), StatusClass::OutForDelivery);
        assert_eq!(StatusClass::from_code(Some("DS")), StatusClass::OutForDelivery);
        assert_eq!(StatusClass::from_code(Some("UD")), StatusClass::Undelivered);
        assert_eq!(StatusClass::from_code(Some("IT")), StatusClass::InTransit);
        assert_eq!(StatusClass::from_code(None), StatusClass::InTransit);
    }

    #[test]
    fn test_base_intervals() {
        assert_eq!(StatusClass::Terminal.base_interval(), chrono::Duration::hours(24));
        assert_eq!(StatusClass::ReturnToOrigin.base_interval(), chrono::Duration::hours(12));
        assert_eq!(StatusClass::OutForDelivery.base_interval(), chrono::Duration::minutes(30));
        assert_eq!(StatusClass::Undelivered.base_interval(), chrono::Duration::hours(2));
        assert_eq!(StatusClass::InTransit.base_interval(), chrono::Duration::hours(1));
    }

    #[test]
    fn test_volatile_codes_cover_volatile_classes() {
        for code in StatusClass::volatile_codes() {
            assert!(StatusClass::from_code(Some(&code)).is_volatile(), "{code}");
        }
    }

    #[test]
    fn test_shipment_due_and_quarantine() {
        let now = Utc::now();
        let mut shipment = Shipment::new_tracked("AWB1", now);
        assert!(shipment.is_due(now));

        shipment.sync_failures = MAX_SYNC_FAILURES;
        assert!(shipment.is_quarantined());
        assert!(!shipment.is_due(now));
    }

    #[test]
    fn test_batch_status_round_trip() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>(), Ok(status));
        }
        assert!("bogus".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_batch_counters() {
        let mut counters = BatchCounters::default();
        counters.record(true);
        counters.record(false);
        counters.skip(3);
        assert_eq!(counters.processed, 2);
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.skipped, 3);
    }

    #[test]
    fn test_job_priorities() {
        assert!(JobKind::Manual.queue_priority() < JobKind::PrioritySweep.queue_priority());
        assert!(JobKind::PrioritySweep.queue_priority() < JobKind::FullSweep.queue_priority());
    }
}
