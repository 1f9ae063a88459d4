//! Redis-backed job queue shared by every worker process
//!
//! # Keys (`{prefix}:queue:` + ...)
//!
//! - `jobs` - hash, job id → JSON payload
//! - `prio` - hash, job id → priority
//! - `attempts` - hash, job id → deliveries so far
//! - `delayed` - sorted set, score = ready time (ms)
//! - `waiting` - sorted set, score = priority × 10¹³ + ready time (ms)
//! - `active` - sorted set, score = lease deadline (ms)
//! - `dead` - list of [`DeadJob`] JSON, newest first, capped

use anyhow::Result;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use std::sync::OnceLock;
use std::time::Duration;

use super::{duration_ms, DeadJob, FailOutcome, JobQueue, QueueDepth, ReservedJob, DEAD_LETTER_CAP};
use crate::clock::SharedClock;
use crate::config::{Config, QueueConfig};
use crate::error::QueueError;
use crate::models::SyncJob;
use crate::utils::retry::Backoff;

const ENQUEUE: &str = r#"
local jobs, prio, delayed, waiting = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
local id, payload = ARGV[1], ARGV[2]
local ready_at, now, priority = tonumber(ARGV[3]), tonumber(ARGV[4]), tonumber(ARGV[5])
if redis.call('HSETNX', jobs, id, payload) == 0 then
  return 0
end
redis.call('HSET', prio, id, priority)
if ready_at > now then
  redis.call('ZADD', delayed, ready_at, id)
else
  redis.call('ZADD', waiting, priority * 1e13 + now, id)
end
return 1
"#;

const RESERVE: &str = r#"
local jobs, prio, attempts, delayed, waiting, active, dead =
  KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6], KEYS[7]
local now, lease, max_attempts, dead_cap =
  tonumber(ARGV[1]), tonumber(ARGV[2]), tonumber(ARGV[3]), tonumber(ARGV[4])

local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now, 'WITHSCORES')
for i = 1, #due, 2 do
  local id, ready_at = due[i], tonumber(due[i + 1])
  local p = tonumber(redis.call('HGET', prio, id) or '5')
  redis.call('ZREM', delayed, id)
  redis.call('ZADD', waiting, p * 1e13 + ready_at, id)
end

for _, id in ipairs(redis.call('ZRANGEBYSCORE', active, '-inf', now)) do
  redis.call('ZREM', active, id)
  local n = tonumber(redis.call('HGET', attempts, id) or '0')
  local payload = redis.call('HGET', jobs, id)
  if payload then
    if n >= max_attempts then
      redis.call('LPUSH', dead, cjson.encode({job = cjson.decode(payload), reason = 'lease expired', failed_at_ms = now}))
      redis.call('LTRIM', dead, 0, dead_cap - 1)
      redis.call('HDEL', jobs, id)
      redis.call('HDEL', prio, id)
      redis.call('HDEL', attempts, id)
    else
      local p = tonumber(redis.call('HGET', prio, id) or '5')
      redis.call('ZADD', waiting, p * 1e13 + now, id)
    end
  end
end

while true do
  local popped = redis.call('ZPOPMIN', waiting)
  if #popped == 0 then
    return false
  end
  local id = popped[1]
  local payload = redis.call('HGET', jobs, id)
  if payload then
    local n = redis.call('HINCRBY', attempts, id, 1)
    redis.call('ZADD', active, now + lease, id)
    return {id, payload, tostring(n)}
  end
end
"#;

static ENQUEUE_SCRIPT: OnceLock<Script> = OnceLock::new();
static RESERVE_SCRIPT: OnceLock<Script> = OnceLock::new();

struct Keys {
    jobs: String,
    prio: String,
    attempts: String,
    delayed: String,
    waiting: String,
    active: String,
    dead: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        let k = |name: &str| format!("{prefix}:queue:{name}");
        Self {
            jobs: k("jobs"),
            prio: k("prio"),
            attempts: k("attempts"),
            delayed: k("delayed"),
            waiting: k("waiting"),
            active: k("active"),
            dead: k("dead"),
        }
    }
}

/// Queue on Redis
pub struct RedisJobQueue {
    pool: Pool,
    keys: Keys,
    clock: SharedClock,
    max_attempts: u32,
    backoff: Backoff,
}

impl RedisJobQueue {
    /// Wrap an existing pool
    pub fn new(pool: Pool, prefix: &str, config: &QueueConfig, clock: SharedClock) -> Self {
        Self {
            pool,
            keys: Keys::new(prefix),
            clock,
            max_attempts: config.max_attempts,
            backoff: Backoff::for_queue(config),
        }
    }

    /// Connect using the Redis and queue sections of the configuration
    pub async fn connect(config: &Config, clock: SharedClock) -> Result<Self> {
        let pool = crate::limits::redis::connect_pool(&config.redis).await?;
        Ok(Self::new(pool, &config.redis.key_prefix, &config.queue, clock))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Pool(e.to_string()))
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &SyncJob, delay: Duration) -> Result<bool, QueueError> {
        let payload = serde_json::to_string(job)?;
        let now = self.clock.now_ms();
        let mut conn = self.conn().await?;

        let added: i64 = ENQUEUE_SCRIPT
            .get_or_init(|| Script::new(ENQUEUE))
            .key(&self.keys.jobs)
            .key(&self.keys.prio)
            .key(&self.keys.delayed)
            .key(&self.keys.waiting)
            .arg(&job.batch_id)
            .arg(payload)
            .arg(now + duration_ms(delay))
            .arg(now)
            .arg(u32::from(job.priority()))
            .invoke_async(&mut *conn)
            .await?;
        Ok(added == 1)
    }

    async fn reserve(&self, lease: Duration) -> Result<Option<ReservedJob>, QueueError> {
        let mut conn = self.conn().await?;
        let reply: Option<Vec<String>> = RESERVE_SCRIPT
            .get_or_init(|| Script::new(RESERVE))
            .key(&self.keys.jobs)
            .key(&self.keys.prio)
            .key(&self.keys.attempts)
            .key(&self.keys.delayed)
            .key(&self.keys.waiting)
            .key(&self.keys.active)
            .key(&self.keys.dead)
            .arg(self.clock.now_ms())
            .arg(duration_ms(lease))
            .arg(self.max_attempts)
            .arg(DEAD_LETTER_CAP)
            .invoke_async(&mut *conn)
            .await?;

        let Some(reply) = reply else {
            return Ok(None);
        };
        let [_id, payload, attempts] = reply.as_slice() else {
            return Err(QueueError::Payload(serde::de::Error::custom(format!(
                "unexpected reserve reply of {} fields",
                reply.len()
            ))));
        };
        Ok(Some(ReservedJob {
            job: serde_json::from_str(payload)?,
            attempt: attempts.parse().unwrap_or(1),
        }))
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&self.keys.active)
            .arg(job_id)
            .ignore()
            .cmd("HDEL")
            .arg(&self.keys.jobs)
            .arg(job_id)
            .ignore()
            .cmd("HDEL")
            .arg(&self.keys.prio)
            .arg(job_id)
            .ignore()
            .cmd("HDEL")
            .arg(&self.keys.attempts)
            .arg(job_id)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn fail(&self, job_id: &str, reason: &str) -> Result<FailOutcome, QueueError> {
        let mut conn = self.conn().await?;
        let (payload, attempts): (Option<String>, Option<u32>) = redis::pipe()
            .cmd("HGET")
            .arg(&self.keys.jobs)
            .arg(job_id)
            .cmd("HGET")
            .arg(&self.keys.attempts)
            .arg(job_id)
            .query_async(&mut *conn)
            .await?;

        let payload = payload.ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        let attempts = attempts.unwrap_or(1);
        let now = self.clock.now_ms();

        if attempts >= self.max_attempts {
            let dead = DeadJob {
                job: serde_json::from_str(&payload)?,
                reason: reason.to_string(),
                failed_at_ms: now,
            };
            let _: () = redis::pipe()
                .atomic()
                .cmd("ZREM")
                .arg(&self.keys.active)
                .arg(job_id)
                .ignore()
                .cmd("LPUSH")
                .arg(&self.keys.dead)
                .arg(serde_json::to_string(&dead)?)
                .ignore()
                .cmd("LTRIM")
                .arg(&self.keys.dead)
                .arg(0)
                .arg(DEAD_LETTER_CAP - 1)
                .ignore()
                .cmd("HDEL")
                .arg(&self.keys.jobs)
                .arg(job_id)
                .ignore()
                .cmd("HDEL")
                .arg(&self.keys.prio)
                .arg(job_id)
                .ignore()
                .cmd("HDEL")
                .arg(&self.keys.attempts)
                .arg(job_id)
                .ignore()
                .query_async(&mut *conn)
                .await?;
            return Ok(FailOutcome::Dead);
        }

        let delay = self.backoff.delay(attempts);
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&self.keys.active)
            .arg(job_id)
            .ignore()
            .cmd("ZADD")
            .arg(&self.keys.delayed)
            .arg(now + duration_ms(delay))
            .arg(job_id)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(FailOutcome::Retrying { delay })
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = self.clock.now_ms();
        let mut conn = self.conn().await?;
        let (waiting, delayed_due, delayed_total, active, dead): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("ZCARD")
                .arg(&self.keys.waiting)
                .cmd("ZCOUNT")
                .arg(&self.keys.delayed)
                .arg("-inf")
                .arg(now)
                .cmd("ZCARD")
                .arg(&self.keys.delayed)
                .cmd("ZCARD")
                .arg(&self.keys.active)
                .cmd("LLEN")
                .arg(&self.keys.dead)
                .query_async(&mut *conn)
                .await?;

        // Delayed jobs already due are promoted on the next reserve
        Ok(QueueDepth {
            waiting: waiting + delayed_due,
            delayed: delayed_total - delayed_due,
            active,
            dead,
        })
    }
}
