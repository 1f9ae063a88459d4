//! awbsync - courier tracking sync orchestrator
//!
//! Mirrors shipment tracking state from a courier API into a local store while
//! keeping the whole fleet of workers inside the API's hard limits: at most 20
//! concurrent requests and 60 requests per minute.
//!
//! # Architecture
//!
//! ```text
//!   SweepTicker ──► Scheduler ──enqueue──► JobQueue ──reserve──► SyncWorker ×N
//!                      │                                            │
//!                      │ select due                                 │ breaker / rate / semaphore
//!                      ▼                                            ▼
//!                ShipmentStore ◄──────── upsert / log ──────── CourierClient
//! ```
//!
//! - [`config`] - Configuration from environment or TOML
//! - [`error`] - Error taxonomy and unified error type
//! - [`clock`] - Injectable time source
//! - [`models`] - Shipments, batches, logs, jobs
//! - [`limits`] - Rate limiter, concurrency semaphore, circuit breaker
//! - [`queue`] - Durable job queue
//! - [`scheduler`] - Due selection, sweeps, next-sync policy
//! - [`upstream`] - Courier API client and change-detection digest
//! - [`storage`] - Shipment store (PostgreSQL, SQLite)
//! - [`worker`] - Job loop and per-AWB sync protocol
//! - [`service`] - Force sync, add to tracking, re-arm, status
//! - [`metrics`] - Prometheus metrics
//! - [`api`] - HTTP surface
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use awbsync::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let clock = awbsync::clock::system_clock();
//!     let store = awbsync::storage::from_config(&config).await?;
//!     let queue = awbsync::queue::from_config(&config, clock.clone()).await?;
//!     let scheduler = Scheduler::new(store, queue, clock, &config);
//!     scheduler.run(SweepKind::Full).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod upstream;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, SharedClock};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result, SyncError, SyncErrorTrait};
    pub use crate::limits::Limits;
    pub use crate::models::{BatchStatus, JobKind, Shipment, StatusClass, SyncBatch, SyncJob, SyncLog};
    pub use crate::queue::JobQueue;
    pub use crate::scheduler::{Scheduler, SweepKind, SweepOutcome, SweepTicker};
    pub use crate::service::SyncService;
    pub use crate::storage::ShipmentStore;
    pub use crate::upstream::{CourierClient, TrackingApi};
    pub use crate::worker::{SyncContext, SyncWorker};
}

pub use models::{Shipment, SyncBatch, SyncJob, SyncLog};
