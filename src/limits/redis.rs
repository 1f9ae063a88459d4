//! Redis-backed Shared Constraint Store
//!
//! Each primitive is one Lua script, so Redis executes the prune, count and
//! insert of a window (or the read and update of a breaker) without any other
//! client interleaving. Timestamps come from the caller's clock.
//!
//! # Keys
//!
//! - `{prefix}:ratelimit:upstream` - sorted set, score = request time (ms)
//! - `{prefix}:semaphore:upstream` - sorted set, member = request id, score = acquire time
//! - `{prefix}:breaker:upstream` - hash with `status`, `failures`, `opened_at`, `probe_at`

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::store::{BreakerDecision, BreakerRecord, CircuitState, ConstraintStore};
use crate::config::RedisConfig;
use crate::error::StoreError;

const WINDOW_TRY_INSERT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
if redis.call('ZSCORE', key, member) then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  return 1
end
if redis.call('ZCARD', key) < limit then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, window)
  return 1
end
return 0
"#;

const WINDOW_COUNT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
return redis.call('ZCARD', key)
"#;

const BREAKER_CHECK: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local reset = tonumber(ARGV[2])
local status = redis.call('HGET', key, 'status') or 'closed'
if status == 'open' then
  local opened = tonumber(redis.call('HGET', key, 'opened_at') or '0')
  if now - opened >= reset then
    redis.call('HSET', key, 'status', 'half_open', 'probe_at', now)
    return 'probe'
  end
  return 'reject'
elseif status == 'half_open' then
  local probe = tonumber(redis.call('HGET', key, 'probe_at') or '0')
  if now - probe >= reset then
    redis.call('HSET', key, 'probe_at', now)
    return 'probe'
  end
  return 'reject'
end
return 'allow'
"#;

const BREAKER_FAILURE: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local status = redis.call('HGET', key, 'status') or 'closed'
local failures = redis.call('HINCRBY', key, 'failures', 1)
if status == 'half_open' or (status == 'closed' and failures >= threshold) then
  status = 'open'
  redis.call('HSET', key, 'status', 'open', 'opened_at', now)
  redis.call('HDEL', key, 'probe_at')
end
local opened = redis.call('HGET', key, 'opened_at') or ''
local probe = redis.call('HGET', key, 'probe_at') or ''
return {status, tostring(failures), opened, probe}
"#;

const BREAKER_RELEASE_PROBE: &str = r#"
local key = KEYS[1]
if redis.call('HGET', key, 'status') == 'half_open' then
  redis.call('HDEL', key, 'probe_at')
end
return 1
"#;

fn script(cell: &'static OnceLock<Script>, source: &'static str) -> &'static Script {
    cell.get_or_init(|| Script::new(source))
}

static WINDOW_TRY_INSERT_SCRIPT: OnceLock<Script> = OnceLock::new();
static WINDOW_COUNT_SCRIPT: OnceLock<Script> = OnceLock::new();
static BREAKER_CHECK_SCRIPT: OnceLock<Script> = OnceLock::new();
static BREAKER_FAILURE_SCRIPT: OnceLock<Script> = OnceLock::new();
static BREAKER_RELEASE_PROBE_SCRIPT: OnceLock<Script> = OnceLock::new();

/// Build a Redis pool and verify it with PING
pub async fn connect_pool(config: &RedisConfig) -> Result<Pool> {
    let pool_config = PoolConfig::from_url(&config.url);
    let pool = pool_config
        .builder()
        .map_err(|e| anyhow::anyhow!("Failed to create pool builder: {e}"))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create Redis connection pool")?;

    let mut conn = pool.get().await.context("Failed to get Redis connection")?;

    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .context("Failed to ping Redis")?;

    tracing::info!(url = %config.url, "Connected to Redis");

    Ok(pool)
}

/// Shared Constraint Store on Redis
#[derive(Clone)]
pub struct RedisConstraintStore {
    pool: Pool,
}

impl RedisConstraintStore {
    /// Wrap an existing pool
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Connect using the Redis section of the configuration
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        Ok(Self::new(connect_pool(config).await?))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

fn parse_ms(raw: Option<&String>) -> Option<i64> {
    raw.filter(|s| !s.is_empty()).and_then(|s| s.parse().ok())
}

#[async_trait]
impl ConstraintStore for RedisConstraintStore {
    async fn window_try_insert(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let admitted: i64 = script(&WINDOW_TRY_INSERT_SCRIPT, WINDOW_TRY_INSERT)
            .key(key)
            .arg(member)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut *conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<u32, StoreError> {
        let mut conn = self.conn().await?;
        let count: u32 = script(&WINDOW_COUNT_SCRIPT, WINDOW_COUNT)
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn breaker_check(
        &self,
        key: &str,
        now_ms: i64,
        reset_ms: i64,
    ) -> Result<BreakerDecision, StoreError> {
        let mut conn = self.conn().await?;
        let decision: String = script(&BREAKER_CHECK_SCRIPT, BREAKER_CHECK)
            .key(key)
            .arg(now_ms)
            .arg(reset_ms)
            .invoke_async(&mut *conn)
            .await?;
        match decision.as_str() {
            "allow" => Ok(BreakerDecision::Allow),
            "probe" => Ok(BreakerDecision::Probe),
            "reject" => Ok(BreakerDecision::Reject),
            other => Err(StoreError::UnexpectedReply(other.to_string())),
        }
    }

    async fn breaker_record_failure(
        &self,
        key: &str,
        now_ms: i64,
        threshold: u32,
    ) -> Result<BreakerRecord, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Vec<String> = script(&BREAKER_FAILURE_SCRIPT, BREAKER_FAILURE)
            .key(key)
            .arg(now_ms)
            .arg(threshold)
            .invoke_async(&mut *conn)
            .await?;

        let [status, failures, opened, probe] = reply.as_slice() else {
            return Err(StoreError::UnexpectedReply(format!("{reply:?}")));
        };
        Ok(BreakerRecord {
            state: CircuitState::parse(status),
            failures: failures.parse().unwrap_or(0),
            opened_at_ms: parse_ms(Some(opened)),
            probe_at_ms: parse_ms(Some(probe)),
        })
    }

    async fn breaker_release_probe(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = script(&BREAKER_RELEASE_PROBE_SCRIPT, BREAKER_RELEASE_PROBE)
            .key(key)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn breaker_record_success(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(key)
            .arg("status")
            .arg(CircuitState::Closed.as_str())
            .arg("failures")
            .arg(0)
            .ignore()
            .cmd("HDEL")
            .arg(key)
            .arg("opened_at")
            .arg("probe_at")
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn breaker_snapshot(&self, key: &str) -> Result<BreakerRecord, StoreError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut *conn)
            .await?;

        Ok(BreakerRecord {
            state: fields
                .get("status")
                .map(|s| CircuitState::parse(s))
                .unwrap_or(CircuitState::Closed),
            failures: fields
                .get("failures")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            opened_at_ms: parse_ms(fields.get("opened_at")),
            probe_at_ms: parse_ms(fields.get("probe_at")),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> RedisConstraintStore {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
            pool_size: 2,
            key_prefix: "awbsync-test".into(),
        };
        RedisConstraintStore::connect(&config).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_redis_window_limit() {
        let store = store().await;
        let key = format!("awbsync-test:window:{}", uuid::Uuid::new_v4());
        assert!(store.window_try_insert(&key, "a", 0, 60_000, 2).await.unwrap());
        assert!(store.window_try_insert(&key, "b", 1, 60_000, 2).await.unwrap());
        assert!(!store.window_try_insert(&key, "c", 2, 60_000, 2).await.unwrap());
        assert!(store.window_try_insert(&key, "a", 3, 60_000, 2).await.unwrap());
        assert_eq!(store.window_count(&key, 3, 60_000).await.unwrap(), 2);
        store.window_remove(&key, "a").await.unwrap();
        assert!(store.window_try_insert(&key, "c", 4, 60_000, 2).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_redis_breaker_cycle() {
        let store = store().await;
        let key = format!("awbsync-test:breaker:{}", uuid::Uuid::new_v4());

        for _ in 0..2 {
            store.breaker_record_failure(&key, 0, 2).await.unwrap();
        }
        assert_eq!(
            store.breaker_snapshot(&key).await.unwrap().state,
            CircuitState::Open
        );
        assert_eq!(
            store.breaker_check(&key, 10, 1_000).await.unwrap(),
            BreakerDecision::Reject
        );
        assert_eq!(
            store.breaker_check(&key, 1_000, 1_000).await.unwrap(),
            BreakerDecision::Probe
        );
        store.breaker_release_probe(&key).await.unwrap();
        assert_eq!(
            store.breaker_check(&key, 1_001, 1_000).await.unwrap(),
            BreakerDecision::Probe
        );
        store.breaker_record_success(&key).await.unwrap();
        let record = store.breaker_snapshot(&key).await.unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failures, 0);
    }
}
