//! In-process job queue for single-node runs and tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{duration_ms, DeadJob, FailOutcome, JobQueue, QueueDepth, ReservedJob, DEAD_LETTER_CAP};
use crate::clock::SharedClock;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::models::SyncJob;
use crate::utils::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Ready once the clock reaches `ready_at_ms`
    Queued { ready_at_ms: i64 },
    /// Held by a worker until `lease_until_ms`
    Active { lease_until_ms: i64 },
}

#[derive(Debug, Clone)]
struct Entry {
    job: SyncJob,
    attempts: u32,
    seq: u64,
    slot: Slot,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    dead: VecDeque<DeadJob>,
    next_seq: u64,
}

/// Queue held in process memory
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    clock: SharedClock,
    max_attempts: u32,
    backoff: Backoff,
}

impl MemoryJobQueue {
    pub fn new(config: &QueueConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            max_attempts: config.max_attempts,
            backoff: Backoff::for_queue(config),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Dead-letter entries, newest first
    pub fn dead_jobs(&self) -> Result<Vec<DeadJob>, QueueError> {
        Ok(self.lock()?.dead.iter().cloned().collect())
    }
}

fn bury(inner: &mut Inner, job: SyncJob, reason: &str, now_ms: i64) {
    inner.dead.push_front(DeadJob {
        job,
        reason: reason.to_string(),
        failed_at_ms: now_ms,
    });
    inner.dead.truncate(DEAD_LETTER_CAP);
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &SyncJob, delay: Duration) -> Result<bool, QueueError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        if inner.entries.contains_key(&job.batch_id) {
            return Ok(false);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            job.batch_id.clone(),
            Entry {
                job: job.clone(),
                attempts: 0,
                seq,
                slot: Slot::Queued {
                    ready_at_ms: now + duration_ms(delay),
                },
            },
        );
        Ok(true)
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<ReservedJob>, QueueError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;

        // Recover jobs whose worker went away
        let stalled: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.slot, Slot::Active { lease_until_ms } if lease_until_ms <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            let Some(entry) = inner.entries.get(&id).cloned() else {
                continue;
            };
            if entry.attempts >= self.max_attempts {
                inner.entries.remove(&id);
                tracing::warn!(job_id = %id, "job lease expired on final attempt, dead-lettering");
                bury(&mut inner, entry.job, "lease expired", now);
            } else if let Some(e) = inner.entries.get_mut(&id) {
                tracing::warn!(job_id = %id, "job lease expired, requeueing");
                e.slot = Slot::Queued { ready_at_ms: now };
            }
        }

        let next = inner
            .entries
            .iter()
            .filter_map(|(id, e)| match e.slot {
                Slot::Queued { ready_at_ms } if ready_at_ms <= now => {
                    Some(((e.job.priority(), ready_at_ms, e.seq), id.clone()))
                }
                _ => None,
            })
            .min_by_key(|(key, _)| *key)
            .map(|(_, id)| id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.entries.get_mut(&id) else {
            return Ok(None);
        };
        entry.attempts += 1;
        entry.slot = Slot::Active {
            lease_until_ms: now + duration_ms(lease),
        };

        Ok(Some(ReservedJob {
            job: entry.job.clone(),
            attempt: entry.attempts,
        }))
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        inner
            .entries
            .remove(job_id)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))
    }

    async fn fail(&self, job_id: &str, reason: &str) -> Result<FailOutcome, QueueError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        let entry = inner
            .entries
            .get(job_id)
            .cloned()
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;

        if entry.attempts >= self.max_attempts {
            inner.entries.remove(job_id);
            bury(&mut inner, entry.job, reason, now);
            return Ok(FailOutcome::Dead);
        }

        let delay = self.backoff.delay(entry.attempts);
        if let Some(e) = inner.entries.get_mut(job_id) {
            e.slot = Slot::Queued {
                ready_at_ms: now + duration_ms(delay),
            };
        }
        Ok(FailOutcome::Retrying { delay })
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = self.clock.now_ms();
        let inner = self.lock()?;
        let mut depth = QueueDepth {
            dead: inner.dead.len() as u64,
            ..Default::default()
        };
        for entry in inner.entries.values() {
            match entry.slot {
                Slot::Queued { ready_at_ms } if ready_at_ms <= now => depth.waiting += 1,
                Slot::Queued { .. } => depth.delayed += 1,
                Slot::Active { .. } => depth.active += 1,
            }
        }
        Ok(depth)
    }
}
