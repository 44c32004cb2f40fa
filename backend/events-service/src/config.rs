//! Environment-driven configuration.
//!
//! `.env` is loaded first (if present), then each section is read with envy.
//! Unprefixed settings live in [`AppConfig`]; ClickHouse, queue and outbox
//! settings use the `CLICKHOUSE_`, `QUEUE_` and `OUTBOX_` prefixes.
//! PostgreSQL is configured separately through `db_pool::DbConfig`.

use anyhow::{Context, Result};
use resilience::RetryConfig;
use serde::Deserialize;
use std::time::Duration;
use transactional_outbox::OutboxProcessorConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub clickhouse: ClickHouseConfig,
    pub queue: QueueConfig,
    pub outbox: OutboxConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            app: envy::from_env().context("Invalid service configuration")?,
            clickhouse: envy::prefixed("CLICKHOUSE_")
                .from_env()
                .context("Invalid CLICKHOUSE_* configuration")?,
            queue: envy::prefixed("QUEUE_")
                .from_env()
                .context("Invalid QUEUE_* configuration")?,
            outbox: envy::prefixed("OUTBOX_")
                .from_env()
                .context("Invalid OUTBOX_* configuration")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// An inline ClickHouse write that timed out on our side may still land.
    /// The relay must not pick the entry up (grace) or take it from a slow
    /// relay (lease) before that write has either finished or been abandoned
    /// by the server.
    pub fn validate(&self) -> Result<()> {
        let timeout = self.clickhouse.timeout();
        if self.outbox.grace() <= timeout {
            anyhow::bail!(
                "OUTBOX_GRACE_SECS ({}s) must be greater than CLICKHOUSE_TIMEOUT_MS ({}ms)",
                self.outbox.grace_secs,
                self.clickhouse.timeout_ms
            );
        }
        if self.outbox.lease() <= timeout {
            anyhow::bail!(
                "OUTBOX_LEASE_SECS ({}s) must be greater than CLICKHOUSE_TIMEOUT_MS ({}ms)",
                self.outbox.lease_secs,
                self.clickhouse.timeout_ms
            );
        }
        // A batch still inside its ClickHouse write must not be redelivered
        if self.queue.lease() <= timeout {
            anyhow::bail!(
                "QUEUE_LEASE_MS ({}ms) must be greater than CLICKHOUSE_TIMEOUT_MS ({}ms)",
                self.queue.lease_ms,
                self.clickhouse.timeout_ms
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u64,
    #[serde(default = "default_rate_limit_timeout_ms")]
    pub rate_limit_timeout_ms: u64,
    #[serde(default = "default_hot_retention_days")]
    pub hot_events_retention_days: u64,
    /// Unset keeps markers forever
    #[serde(default)]
    pub marker_retention_days: Option<u64>,
    #[serde(default = "default_chunk_size")]
    pub import_chunk_size: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl AppConfig {
    pub fn hot_events_retention(&self) -> Duration {
        days(self.hot_events_retention_days)
    }

    pub fn marker_retention(&self) -> Option<Duration> {
        self.marker_retention_days.map(days)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_database")]
    pub database: String,
    #[serde(default = "default_clickhouse_user")]
    pub user: String,
    #[serde(default = "default_clickhouse_password")]
    pub password: String,
    #[serde(default = "default_clickhouse_timeout_ms")]
    pub timeout_ms: u64,
}

impl ClickHouseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_namespace")]
    pub namespace: String,
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_queue_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_queue_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_queue_poll_wait_ms")]
    pub poll_wait_ms: u64,
    /// How long a worker holds a reserved batch before another may take it
    #[serde(default = "default_queue_lease_ms")]
    pub lease_ms: u64,
    #[serde(default = "default_queue_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,
}

impl QueueConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_outbox_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_outbox_max_attempts")]
    pub max_attempts: i32,
    /// Head start the processor gets before the relay may pick an entry up
    #[serde(default = "default_outbox_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_outbox_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_outbox_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl OutboxConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn processor_config(&self) -> OutboxProcessorConfig {
        OutboxProcessorConfig {
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease: self.lease(),
            max_attempts: self.max_attempts,
            retry: RetryConfig {
                max_retries: self.max_attempts.max(0) as u32,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(self.max_backoff_secs),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n * 24 * 60 * 60)
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_rate_limit() -> u64 {
    1000
}
fn default_rate_limit_timeout_ms() -> u64 {
    100
}
fn default_hot_retention_days() -> u64 {
    7
}
fn default_chunk_size() -> usize {
    1000
}
fn default_worker_concurrency() -> usize {
    4
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_database() -> String {
    "analytics".to_string()
}
fn default_clickhouse_user() -> String {
    "default".to_string()
}
fn default_clickhouse_password() -> String {
    "clickhouse".to_string()
}
fn default_clickhouse_timeout_ms() -> u64 {
    30_000
}
fn default_queue_namespace() -> String {
    "events:queue".to_string()
}
fn default_queue_max_retries() -> u32 {
    3
}
fn default_queue_initial_backoff_ms() -> u64 {
    1000
}
fn default_queue_max_backoff_ms() -> u64 {
    60_000
}
fn default_queue_poll_wait_ms() -> u64 {
    1000
}
fn default_queue_lease_ms() -> u64 {
    300_000
}
fn default_queue_reclaim_interval_ms() -> u64 {
    30_000
}
fn default_outbox_batch_size() -> i64 {
    100
}
fn default_outbox_poll_interval_ms() -> u64 {
    5000
}
fn default_outbox_max_attempts() -> i32 {
    10
}
fn default_outbox_grace_secs() -> u64 {
    60
}
fn default_outbox_lease_secs() -> u64 {
    90
}
fn default_outbox_max_backoff_secs() -> u64 {
    300
}
