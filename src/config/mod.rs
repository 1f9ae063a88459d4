//! Configuration management for awbsync
//!
//! Everything is read once at startup, either from environment variables
//! ([`Config::from_env`]) or from a TOML file ([`Config::from_file`]), and then
//! checked with [`Config::validate`]. The courier's own limits (20 concurrent
//! requests, 60 requests per minute, 20 AWBs per batch) are ceilings: the
//! configuration may lower them but never raise them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::models::{
    UPSTREAM_MAX_BATCH, UPSTREAM_MAX_CONCURRENCY, UPSTREAM_MAX_REQUESTS_PER_MINUTE,
};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Courier API client
    pub upstream: UpstreamConfig,

    /// Rate limiter, semaphore and circuit breaker
    pub limits: LimitsConfig,

    /// Redis connection shared by the limiters and the queue
    pub redis: RedisConfig,

    /// Shipment store
    pub storage: StorageConfig,

    /// Job queue
    pub queue: QueueConfig,

    /// Worker loop
    pub worker: WorkerConfig,

    /// Sweep cadences and caps
    pub scheduler: SchedulerConfig,

    /// HTTP status surface
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Courier API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Tracking endpoint, one GET per AWB
    pub base_url: String,

    /// Optional bearer token
    pub api_key: Option<String>,

    /// Query parameter carrying the AWB
    pub awb_param: String,

    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

/// Which Shared Constraint Store backs the limiters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterBackend {
    /// Redis, shared by every process in the fleet
    Redis,
    /// Process-local store, correct only for a single process
    Memory,
    /// Permissive stubs, no limiting at all
    None,
}

impl FromStr for LimiterBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            "none" | "disabled" => Ok(Self::None),
            other => Err(format!("unknown limiter backend '{other}'")),
        }
    }
}

/// Limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Backend for the Shared Constraint Store
    pub backend: LimiterBackend,

    /// Global concurrency ceiling (at most 20)
    pub max_concurrent_requests: u32,

    /// Global request budget per window (at most 60)
    pub requests_per_window: u32,

    /// Sliding window length in seconds
    pub window_secs: u64,

    /// How long to wait for a rate-limit slot
    pub rate_wait_timeout_ms: u64,

    /// How long to wait for a concurrency slot
    pub semaphore_wait_timeout_ms: u64,

    /// Expiry of an unreleased concurrency slot
    pub semaphore_ttl_secs: u64,

    /// Poll interval while waiting for either limiter
    pub poll_interval_ms: u64,

    /// Consecutive upstream failures that open the breaker
    pub circuit_failure_threshold: u32,

    /// Cooldown before a half-open probe
    pub circuit_reset_timeout_secs: u64,
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,

    /// Maximum pool size
    pub pool_size: usize,

    /// Prefix for every key this crate writes
    pub key_prefix: String,
}

/// Which database holds shipments, batches and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

/// Shipment store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    pub backend: StorageBackend,

    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size
    pub pool_size: usize,

    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// Which queue implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown queue backend '{other}'")),
        }
    }
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backend selection
    pub backend: QueueBackend,

    /// Deliveries before a job is dead-lettered
    pub max_attempts: u32,

    /// First retry delay
    pub backoff_base_ms: u64,

    /// Retry delay ceiling
    pub backoff_max_ms: u64,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// AWBs per job (at most 20)
    pub batch_size: usize,

    /// Wall-clock budget for one job
    pub batch_timeout_secs: u64,

    /// Pause between AWBs inside a job
    pub pacing_ms: u64,

    /// Idle poll interval
    pub poll_interval_ms: u64,

    /// Random extra idle delay
    pub jitter_ms: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub full_sweep_interval_secs: u64,
    pub priority_sweep_interval_secs: u64,
    pub retention_sweep_interval_secs: u64,

    /// Max shipments selected by one full sweep
    pub full_sweep_limit: usize,

    /// Max shipments selected by one priority sweep
    pub priority_sweep_limit: usize,

    /// Delay added per batch index in the full sweep
    pub batch_stagger_ms: u64,

    /// How far `next_sync_at` is pushed when a shipment is enqueued
    pub enqueue_lease_secs: u64,

    pub log_retention_days: u32,
    pub batch_retention_days: u32,
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Read and parse an environment variable, falling back on absence or parse failure
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| String::from(default))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let timeout_secs = env_or("UPSTREAM_TIMEOUT_SECS", defaults.upstream.timeout_secs);
        let semaphore_ttl_secs = env_or("SEMAPHORE_TTL_SECS", timeout_secs + 5);

        let limiter_backend = match std::env::var("LIMITER_BACKEND") {
            Ok(v) => v.parse().map_err(anyhow::Error::msg)?,
            Err(_) => defaults.limits.backend,
        };
        let storage_backend = match std::env::var("STORAGE_BACKEND") {
            Ok(v) => v.parse().map_err(anyhow::Error::msg)?,
            Err(_) => defaults.storage.backend,
        };
        let queue_backend = match std::env::var("QUEUE_BACKEND") {
            Ok(v) => v.parse().map_err(anyhow::Error::msg)?,
            Err(_) => defaults.queue.backend,
        };

        let api_key = std::env::var("UPSTREAM_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        Ok(Self {
            upstream: UpstreamConfig {
                base_url: env_string("UPSTREAM_BASE_URL", &defaults.upstream.base_url),
                api_key,
                awb_param: env_string("UPSTREAM_AWB_PARAM", &defaults.upstream.awb_param),
                timeout_secs,
            },
            limits: LimitsConfig {
                backend: limiter_backend,
                max_concurrent_requests: env_or(
                    "MAX_CONCURRENT_REQUESTS",
                    defaults.limits.max_concurrent_requests,
                ),
                requests_per_window: env_or(
                    "REQUESTS_PER_MINUTE",
                    defaults.limits.requests_per_window,
                ),
                window_secs: env_or("RATE_WINDOW_SECS", defaults.limits.window_secs),
                rate_wait_timeout_ms: env_or(
                    "RATE_WAIT_TIMEOUT_MS",
                    defaults.limits.rate_wait_timeout_ms,
                ),
                semaphore_wait_timeout_ms: env_or(
                    "SEMAPHORE_WAIT_TIMEOUT_MS",
                    defaults.limits.semaphore_wait_timeout_ms,
                ),
                semaphore_ttl_secs,
                poll_interval_ms: env_or("LIMITER_POLL_MS", defaults.limits.poll_interval_ms),
                circuit_failure_threshold: env_or(
                    "CIRCUIT_FAILURE_THRESHOLD",
                    defaults.limits.circuit_failure_threshold,
                ),
                circuit_reset_timeout_secs: env_or(
                    "CIRCUIT_RESET_TIMEOUT_SECS",
                    defaults.limits.circuit_reset_timeout_secs,
                ),
            },
            redis: RedisConfig {
                url: env_string("REDIS_URL", &defaults.redis.url),
                pool_size: env_or("REDIS_POOL_SIZE", defaults.redis.pool_size),
                key_prefix: env_string("REDIS_KEY_PREFIX", &defaults.redis.key_prefix),
            },
            storage: StorageConfig {
                backend: storage_backend,
                postgres_url: env_string("DATABASE_URL", &defaults.storage.postgres_url),
                pool_size: env_or("DB_POOL_SIZE", defaults.storage.pool_size),
                sqlite_path: env_string(
                    "SQLITE_PATH",
                    &defaults.storage.sqlite_path.to_string_lossy(),
                )
                .into(),
            },
            queue: QueueConfig {
                backend: queue_backend,
                max_attempts: env_or("JOB_MAX_ATTEMPTS", defaults.queue.max_attempts),
                backoff_base_ms: env_or("JOB_BACKOFF_BASE_MS", defaults.queue.backoff_base_ms),
                backoff_max_ms: env_or("JOB_BACKOFF_MAX_MS", defaults.queue.backoff_max_ms),
            },
            worker: WorkerConfig {
                batch_size: env_or("BATCH_SIZE", defaults.worker.batch_size),
                batch_timeout_secs: env_or(
                    "BATCH_TIMEOUT_SECS",
                    defaults.worker.batch_timeout_secs,
                ),
                pacing_ms: env_or("SYNC_PACING_MS", defaults.worker.pacing_ms),
                poll_interval_ms: env_or(
                    "WORKER_POLL_INTERVAL_MS",
                    defaults.worker.poll_interval_ms,
                ),
                jitter_ms: env_or("WORKER_JITTER_MS", defaults.worker.jitter_ms),
            },
            scheduler: SchedulerConfig {
                full_sweep_interval_secs: env_or(
                    "FULL_SWEEP_INTERVAL_SECS",
                    defaults.scheduler.full_sweep_interval_secs,
                ),
                priority_sweep_interval_secs: env_or(
                    "PRIORITY_SWEEP_INTERVAL_SECS",
                    defaults.scheduler.priority_sweep_interval_secs,
                ),
                retention_sweep_interval_secs: env_or(
                    "RETENTION_SWEEP_INTERVAL_SECS",
                    defaults.scheduler.retention_sweep_interval_secs,
                ),
                full_sweep_limit: env_or("FULL_SWEEP_LIMIT", defaults.scheduler.full_sweep_limit),
                priority_sweep_limit: env_or(
                    "PRIORITY_SWEEP_LIMIT",
                    defaults.scheduler.priority_sweep_limit,
                ),
                batch_stagger_ms: env_or("BATCH_STAGGER_MS", defaults.scheduler.batch_stagger_ms),
                enqueue_lease_secs: env_or(
                    "ENQUEUE_LEASE_SECS",
                    defaults.scheduler.enqueue_lease_secs,
                ),
                log_retention_days: env_or(
                    "LOG_RETENTION_DAYS",
                    defaults.scheduler.log_retention_days,
                ),
                batch_retention_days: env_or(
                    "BATCH_RETENTION_DAYS",
                    defaults.scheduler.batch_retention_days,
                ),
            },
            server: ServerConfig {
                bind: env_string("AWBSYNC_BIND", &defaults.server.bind),
            },
            logging: LoggingConfig {
                level: env_string("AWBSYNC_LOG_LEVEL", &defaults.logging.level),
                format: env_string("AWBSYNC_LOG_FORMAT", &defaults.logging.format),
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;

        if limits.max_concurrent_requests == 0
            || limits.max_concurrent_requests > UPSTREAM_MAX_CONCURRENCY
        {
            anyhow::bail!(
                "max_concurrent_requests must be between 1 and {UPSTREAM_MAX_CONCURRENCY}, got {}",
                limits.max_concurrent_requests
            );
        }

        if limits.requests_per_window == 0
            || limits.requests_per_window > UPSTREAM_MAX_REQUESTS_PER_MINUTE
        {
            anyhow::bail!(
                "requests_per_minute must be between 1 and {UPSTREAM_MAX_REQUESTS_PER_MINUTE}, got {}",
                limits.requests_per_window
            );
        }

        if limits.window_secs < 60 {
            anyhow::bail!("rate window must be at least 60 seconds");
        }

        if limits.circuit_failure_threshold == 0 {
            anyhow::bail!("circuit_failure_threshold must be greater than 0");
        }

        if limits.poll_interval_ms == 0 {
            anyhow::bail!("limiter poll interval must be greater than 0");
        }

        if limits.semaphore_ttl_secs <= self.upstream.timeout_secs {
            anyhow::bail!("semaphore_ttl_secs must exceed the upstream timeout");
        }

        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("upstream timeout must be greater than 0");
        }

        url::Url::parse(&self.upstream.base_url)
            .with_context(|| format!("Invalid upstream base URL: {}", self.upstream.base_url))?;

        if self.worker.batch_size == 0 || self.worker.batch_size > UPSTREAM_MAX_BATCH {
            anyhow::bail!(
                "batch_size must be between 1 and {UPSTREAM_MAX_BATCH}, got {}",
                self.worker.batch_size
            );
        }

        if self.worker.batch_timeout_secs == 0 {
            anyhow::bail!("batch_timeout_secs must be greater than 0");
        }

        if self.queue.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.redis.pool_size == 0 || self.storage.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        let s = &self.scheduler;
        if s.full_sweep_interval_secs == 0
            || s.priority_sweep_interval_secs == 0
            || s.retention_sweep_interval_secs == 0
        {
            anyhow::bail!("sweep intervals must be greater than 0");
        }

        Ok(())
    }

    /// Get upstream call timeout as Duration
    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    /// Get job wall-clock budget as Duration
    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.batch_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                base_url: String::from("https://api.courier.example/v1/track"),
                api_key: None,
                awb_param: String::from("awb"),
                timeout_secs: 30,
            },
            limits: LimitsConfig {
                backend: LimiterBackend::Redis,
                max_concurrent_requests: UPSTREAM_MAX_CONCURRENCY,
                requests_per_window: UPSTREAM_MAX_REQUESTS_PER_MINUTE,
                window_secs: 60,
                rate_wait_timeout_ms: 30_000,
                semaphore_wait_timeout_ms: 30_000,
                semaphore_ttl_secs: 35,
                poll_interval_ms: 100,
                circuit_failure_threshold: 5,
                circuit_reset_timeout_secs: 60,
            },
            redis: RedisConfig {
                url: String::from("redis://localhost:6379"),
                pool_size: 10,
                key_prefix: String::from("awbsync"),
            },
            storage: StorageConfig {
                backend: StorageBackend::Postgres,
                postgres_url: String::from("postgresql://localhost/awbsync"),
                pool_size: 10,
                sqlite_path: PathBuf::from("data/awbsync.db"),
            },
            queue: QueueConfig {
                backend: QueueBackend::Redis,
                max_attempts: 3,
                backoff_base_ms: 5_000,
                backoff_max_ms: 300_000,
            },
            worker: WorkerConfig {
                batch_size: UPSTREAM_MAX_BATCH,
                batch_timeout_secs: 900,
                pacing_ms: 1_000,
                poll_interval_ms: 1_000,
                jitter_ms: 250,
            },
            scheduler: SchedulerConfig {
                full_sweep_interval_secs: 3_600,
                priority_sweep_interval_secs: 900,
                retention_sweep_interval_secs: 86_400,
                full_sweep_limit: 10_000,
                priority_sweep_limit: 100,
                batch_stagger_ms: 1_000,
                enqueue_lease_secs: 14_400,
                log_retention_days: 7,
                batch_retention_days: 30,
            },
            server: ServerConfig {
                bind: String::from("0.0.0.0:8080"),
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}
