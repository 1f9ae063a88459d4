//! Durable job queue for sync batches
//!
//! Each job carries one [`SyncJob`] (a batch of at most 20 AWBs). Jobs are
//! ordered by priority (1 highest) and then by readiness time; a job enqueued
//! with a delay is invisible until the delay passes.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ──► delayed ──(due)──► waiting ──reserve──► active ──complete──► gone
//!                ▲                  ▲                   │
//!                │                  └──(lease lapses)───┤
//!                └──────────(fail, attempts left)───────┤
//!                                                       └──(fail, exhausted)──► dead
//! ```
//!
//! Delivery is at-least-once: a worker that dies mid-job loses its lease and
//! the job is handed to someone else.

pub mod memory;
pub mod redis;

pub use memory::MemoryJobQueue;
pub use self::redis::RedisJobQueue;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::{Config, QueueBackend};
use crate::error::QueueError;
use crate::models::SyncJob;

/// Maximum entries kept on the dead-letter list
pub const DEAD_LETTER_CAP: usize = 1_000;

/// A job handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub job: SyncJob,
    /// 1 on first delivery
    pub attempt: u32,
}

/// What happened to a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another delivery after `delay`
    Retrying { delay: Duration },
    /// Out of attempts; moved to the dead-letter list
    Dead,
}

/// Job counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub dead: u64,
}

/// Dead-letter entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadJob {
    pub job: SyncJob,
    pub reason: String,
    pub failed_at_ms: i64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job, visible after `delay`; a job id already queued is ignored
    async fn enqueue(&self, job: &SyncJob, delay: Duration) -> Result<bool, QueueError>;

    /// Take the next ready job and hold it for `lease`
    async fn reserve(&self, lease: Duration) -> Result<Option<ReservedJob>, QueueError>;

    /// Drop a finished job
    async fn complete(&self, job_id: &str) -> Result<(), QueueError>;

    /// Retry with backoff or dead-letter a job
    async fn fail(&self, job_id: &str, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Counts by state
    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

/// Build the queue selected by `QUEUE_BACKEND`
pub async fn from_config(config: &Config, clock: SharedClock) -> Result<Arc<dyn JobQueue>> {
    match config.queue.backend {
        QueueBackend::Redis => {
            let queue = RedisJobQueue::connect(config, clock).await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Memory => {
            tracing::warn!("using in-process job queue; jobs are lost on restart");
            Ok(Arc::new(MemoryJobQueue::new(&config.queue, clock)))
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
