//! Unified error handling for the awbsync crate
//!
//! Domain errors are typed per layer and folded into a single [`Error`] at
//! module boundaries.
//!
//! # Architecture
//!
//! - [`SyncErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification driving breaker and retry decisions
//! - [`SyncError`] - Outcome of one failed AWB attempt, with a stable code
//! - [`StoreError`] - Shared Constraint Store failures
//! - [`QueueError`] - Job queue failures
//! - [`StorageError`] - Shipment store failures
//! - [`Error`] - Unified error enum wrapping all of the above
//!
//! # Usage
//!
//! ```rust,ignore
//! use awbsync::error::{SyncError, SyncErrorTrait};
//!
//! fn on_attempt_failed(err: &SyncError) {
//!     if err.counts_toward_breaker() {
//!         // breaker.record_failure().await
//!     }
//!     tracing::warn!(code = err.code(), "attempt failed: {err}");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Common trait for all awbsync error types
pub trait SyncErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rate-limit or concurrency-slot exhaustion
    Quota,
    /// Non-success status, transport failure or bad payload from the courier
    Upstream,
    /// Short-circuited by an open breaker
    Breaker,
    /// Shipment store, audit log or queue persistence
    Storage,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quota => "quota",
            Self::Upstream => "upstream",
            Self::Breaker => "breaker",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

// ============================================================================
// Domain errors
// ============================================================================

/// Errors raised by a Shared Constraint Store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis command or script failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Could not obtain a pooled connection
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Script returned something we could not interpret
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// In-process state lock was poisoned
    #[error("Lock poisoned")]
    Poisoned,
}

/// Errors raised by the job queue
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis command or script failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Could not obtain a pooled connection
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Payload could not be encoded or decoded
    #[error("Job payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Job id not known to the queue
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// In-process state lock was poisoned
    #[error("Lock poisoned")]
    Poisoned,
}

/// Errors raised by the shipment store
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL failure
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Could not obtain a pooled connection
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Stored JSON could not be encoded or decoded
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A row held a value outside its domain
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// In-process connection lock was poisoned
    #[error("Lock poisoned")]
    Poisoned,
}

/// Why a single AWB attempt failed
///
/// Every variant maps to one of the classes in [`ErrorCategory`]
/// and carries a stable [`SyncError::code`] that is written to the audit log.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No rate-limit slot within the wait budget
    #[error("Rate limit slot not acquired within {waited_ms}ms")]
    RateLimitTimeout { waited_ms: u64 },

    /// No concurrency slot within the wait budget
    #[error("Concurrency slot not acquired within {waited_ms}ms")]
    ConcurrencyTimeout { waited_ms: u64 },

    /// Limiter backend could not be consulted; treated as no permit
    #[error("Limiter unavailable: {0}")]
    LimiterUnavailable(#[from] StoreError),

    /// Courier answered with a non-success HTTP status
    #[error("Upstream returned HTTP {status}")]
    UpstreamStatus { status: u16 },

    /// Connection, TLS or protocol failure talking to the courier
    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Courier call exceeded its timeout
    #[error("Upstream call timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    /// Envelope status was not a success
    #[error("Upstream rejected request: {message}")]
    UpstreamRejected { message: String },

    /// Body was not a usable tracking envelope
    #[error("Malformed upstream payload: {0}")]
    MalformedPayload(String),

    /// Breaker is open; no call was made
    #[error("Circuit breaker open")]
    BreakerOpen,

    /// Writing the outcome failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// AWB had no usable characters after sanitisation
    #[error("Invalid AWB: {0:?}")]
    InvalidAwb(String),
}

impl SyncError {
    /// Stable code stored in `SyncLog.error_code`
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitTimeout { .. } => "RATE_LIMIT_TIMEOUT",
            Self::ConcurrencyTimeout { .. } => "CONCURRENCY_TIMEOUT",
            Self::LimiterUnavailable(_) => "LIMITER_UNAVAILABLE",
            Self::UpstreamStatus { .. } => "UPSTREAM_HTTP_STATUS",
            Self::UpstreamTransport(_) => "UPSTREAM_TRANSPORT",
            Self::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            Self::UpstreamRejected { .. } => "UPSTREAM_REJECTED",
            Self::MalformedPayload(_) => "UPSTREAM_MALFORMED",
            Self::BreakerOpen => "CIRCUIT_OPEN",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::InvalidAwb(_) => "INVALID_AWB",
        }
    }

    /// Whether this outcome feeds the circuit breaker failure counter
    pub fn counts_toward_breaker(&self) -> bool {
        self.category() == ErrorCategory::Upstream
    }

    /// Whether the shipment's failure counter and backoff should advance
    pub fn counts_toward_shipment(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Quota | ErrorCategory::Upstream
        )
    }
}

impl SyncErrorTrait for SyncError {
    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidAwb(_))
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimitTimeout { .. }
            | Self::ConcurrencyTimeout { .. }
            | Self::LimiterUnavailable(_) => ErrorCategory::Quota,
            Self::UpstreamStatus { .. }
            | Self::UpstreamTransport(_)
            | Self::UpstreamTimeout { .. }
            | Self::UpstreamRejected { .. }
            | Self::MalformedPayload(_) => ErrorCategory::Upstream,
            Self::BreakerOpen => ErrorCategory::Breaker,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::InvalidAwb(_) => ErrorCategory::Other,
        }
    }
}

// ============================================================================
// Unified error
// ============================================================================

/// Unified error type for the awbsync crate
#[derive(Error, Debug)]
pub enum Error {
    /// Per-AWB sync failures that escaped local handling
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Shared Constraint Store errors
    #[error("Constraint store error: {0}")]
    Store(#[from] StoreError),

    /// Job queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Shipment store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Caller supplied unusable input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SyncErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Sync(e) => e.is_recoverable(),
            Self::Store(_) | Self::Queue(_) | Self::Storage(_) => true,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) | Self::InvalidInput(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Sync(e) => e.category(),
            Self::Store(_) => ErrorCategory::Quota,
            Self::Queue(_) | Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Other,
            Self::Config(_) => ErrorCategory::Config,
            Self::InvalidInput(_) | Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
