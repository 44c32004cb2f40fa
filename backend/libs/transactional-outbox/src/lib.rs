//! # Transactional Outbox for Analytical Writes
//!
//! Guarantees that a write owed to a non-transactional sink (the analytical
//! store) is never lost once the relational transaction that decided it has
//! committed.
//!
//! ## Why is it needed?
//!
//! The pipeline commits dedup markers in PostgreSQL and then writes the same
//! events to ClickHouse. If the ClickHouse write fails after the commit, a
//! redelivered batch sees the markers and skips the events: they are lost for
//! good. Writing an outbox entry in the *same* transaction as the markers turns
//! that failure into "pending work" that a background relay retries until the
//! sink accepts it.
//!
//! ## Lifecycle
//!
//! ```text
//!  BEGIN ─ markers ─ outbox(pending) ─ COMMIT
//!                         │
//!          immediate write ok? ──yes──▶ delivered
//!                         │no
//!                         ▼
//!          OutboxProcessor: retry with backoff ──▶ delivered
//!                         │ attempts exhausted
//!                         ▼
//!                       dead ──(replay_dead)──▶ pending
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEntry, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use std::time::Duration;
//!
//! async fn stage(pool: &PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     // ... guarded writes ...
//!
//!     let entry = OutboxEntry::pending(
//!         serde_json::json!([{"event_id": "..."}]),
//!         1,
//!         Duration::from_secs(30),
//!     );
//!     SqlxOutboxRepository::insert(&mut tx, &entry).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! Entries are claimed with `FOR UPDATE SKIP LOCKED` plus a lease on
//! `next_attempt_at`, so several relays can run side by side without handing
//! the same entry to two sinks at once.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// Delivery state of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "delivered" => Ok(OutboxStatus::Delivered),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// A write owed to the analytical store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Unique identifier, also used as the sink's deduplication token
    pub id: Uuid,

    /// Events to write, as a JSON array
    pub payload: serde_json::Value,

    /// Number of events in the payload
    pub event_count: i32,

    pub status: OutboxStatus,

    /// Number of failed delivery attempts
    pub attempts: i32,

    /// Last error message from failed delivery attempt
    pub last_error: Option<String>,

    /// Earliest time the relay may pick this entry up
    pub next_attempt_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Build a pending entry that the relay leaves alone for `grace`, giving
    /// the writer a chance to deliver it inline first.
    pub fn pending(payload: serde_json::Value, event_count: i32, grace: Duration) -> Self {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            payload,
            event_count,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now + grace,
            created_at: now,
            delivered_at: None,
        }
    }
}

/// Repository trait for the relay-side outbox operations.
///
/// Staging an entry is not part of the trait: it must happen on the caller's
/// transaction, see [`SqlxOutboxRepository::insert`].
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Claim up to `limit` pending entries whose `next_attempt_at` has passed,
    /// pushing their `next_attempt_at` forward by `lease`.
    async fn claim_due(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEntry>>;

    /// Mark an entry as written to the sink.
    async fn mark_delivered(&self, id: Uuid) -> OutboxResult<()>;

    /// Record a failed attempt and schedule the next one.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()>;

    /// Park an entry that exhausted its attempts.
    async fn mark_dead(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Return up to `limit` dead entries to pending with a fresh attempt budget.
    async fn replay_dead(&self, limit: i64) -> OutboxResult<u64>;

    /// Return every pending or dead entry created since `since` to pending
    /// with a fresh attempt budget, due now. Delivered entries are left alone.
    async fn replay_undelivered_since(&self, since: DateTime<Utc>) -> OutboxResult<u64>;

    /// Delete delivered entries created before `cutoff`.
    async fn purge_delivered_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64>;

    /// Pending count and age of the oldest pending entry in seconds (0 if none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of OutboxRepository using PostgreSQL.
#[derive(Clone)]
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an entry within the caller's transaction.
    ///
    /// This MUST share the transaction of the writes the entry covers.
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        entry: &OutboxEntry,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO analytics_outbox (
                id,
                payload,
                event_count,
                status,
                attempts,
                last_error,
                next_attempt_at,
                created_at,
                delivered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.payload)
        .bind(entry.event_count)
        .bind(entry.status.as_str())
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .bind(entry.next_attempt_at)
        .bind(entry.created_at)
        .bind(entry.delivered_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert entry into outbox")?;

        debug!(
            outbox_id = %entry.id,
            event_count = entry.event_count,
            "Entry staged in outbox"
        );

        Ok(())
    }

    fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<OutboxEntry, OutboxError> {
        let status: String = row.try_get("status")?;
        Ok(OutboxEntry {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            event_count: row.try_get("event_count")?,
            status: status.parse()?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            created_at: row.try_get("created_at")?,
            delivered_at: row.try_get("delivered_at")?,
        })
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn claim_due(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEntry>> {
        let lease_secs = lease.as_secs_f64();
        let rows = sqlx::query(
            r#"
            UPDATE analytics_outbox
            SET next_attempt_at = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id
                FROM analytics_outbox
                WHERE status = 'pending' AND next_attempt_at <= NOW()
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING
                id,
                payload,
                event_count,
                status,
                attempts,
                last_error,
                next_attempt_at,
                created_at,
                delivered_at
            "#,
        )
        .bind(limit)
        .bind(lease_secs)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim due outbox entries")?;

        let mut entries = rows
            .into_iter()
            .map(Self::row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.created_at);

        debug!(count = entries.len(), "Claimed due outbox entries");
        Ok(entries)
    }

    async fn mark_delivered(&self, id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE analytics_outbox
            SET status = 'delivered', delivered_at = NOW(), last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark entry as delivered")?;

        if result.rows_affected() == 0 {
            warn!(outbox_id = %id, "Entry not found when marking as delivered");
            return Err(OutboxError::EntryNotFound(id));
        }

        debug!(outbox_id = %id, "Outbox entry delivered");
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE analytics_outbox
            SET attempts = attempts + 1,
                last_error = $2,
                next_attempt_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .context("Failed to mark entry as failed")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EntryNotFound(id));
        }

        warn!(outbox_id = %id, error = %error, "Outbox delivery failed");
        Ok(())
    }

    async fn mark_dead(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE analytics_outbox
            SET status = 'dead',
                attempts = attempts + 1,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark entry as dead")?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::EntryNotFound(id));
        }

        error!(outbox_id = %id, error = %error, "Outbox entry moved to dead letter");
        Ok(())
    }

    async fn replay_dead(&self, limit: i64) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE analytics_outbox
            SET status = 'pending',
                attempts = 0,
                next_attempt_at = NOW()
            WHERE id IN (
                SELECT id FROM analytics_outbox
                WHERE status = 'dead'
                ORDER BY created_at ASC
                LIMIT $1
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await
        .context("Failed to replay dead entries")?;

        Ok(res.rows_affected())
    }

    async fn replay_undelivered_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE analytics_outbox
            SET status = 'pending',
                attempts = 0,
                last_error = NULL,
                next_attempt_at = NOW()
            WHERE created_at >= $1 AND status <> 'delivered'
            "#,
        )
        .bind(since)
        .execute(&self.pool)
        .await
        .context("Failed to replay undelivered entries")?;

        Ok(res.rows_affected())
    }

    async fn purge_delivered_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM analytics_outbox
            WHERE status = 'delivered' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to purge delivered entries")?;

        Ok(res.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM analytics_outbox
            WHERE status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending")?;
        let age: i64 = rec.try_get("age_seconds")?;
        Ok((pending, age))
    }
}

/// Destination the relay writes entries to.
///
/// Implementations should be idempotent per entry id: an entry may be
/// delivered again if marking it delivered failed after a successful write.
#[async_trait]
pub trait OutboxSink: Send + Sync {
    async fn deliver(&self, entry: &OutboxEntry) -> OutboxResult<()>;
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Entries claimed per polling cycle
    pub batch_size: i64,
    /// Sleep between polling cycles
    pub poll_interval: Duration,
    /// How long a claimed entry is hidden from other relays
    pub lease: Duration,
    /// Attempts before an entry is parked as dead
    pub max_attempts: i32,
    /// Backoff between attempts
    pub retry: RetryConfig,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            lease: Duration::from_secs(60),
            max_attempts: 10,
            retry: RetryConfig {
                max_retries: 10,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(300),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

/// Counts from one polling cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
    pub dead: usize,
}

/// Background relay that drains pending outbox entries into the sink.
///
/// # Processing Guarantees
///
/// - **At-least-once delivery**: an entry may reach the sink more than once if
///   marking it delivered fails; the sink deduplicates by entry id
/// - **Oldest first**: entries are claimed in creation order
/// - **Bounded retries**: entries exceeding `max_attempts` are parked as dead,
///   never dropped
pub struct OutboxProcessor<R: OutboxRepository + ?Sized, S: OutboxSink + ?Sized> {
    repository: Arc<R>,
    sink: Arc<S>,
    config: OutboxProcessorConfig,
    metrics: Option<metrics::OutboxMetrics>,
}

impl<R: OutboxRepository + ?Sized, S: OutboxSink + ?Sized> OutboxProcessor<R, S> {
    pub fn new(repository: Arc<R>, sink: Arc<S>, config: OutboxProcessorConfig) -> Self {
        Self {
            repository,
            sink,
            config,
            metrics: None,
        }
    }

    /// Create a processor that also updates Prometheus metrics each polling cycle.
    pub fn with_metrics(mut self, metrics: metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until `shutdown` flips to true.
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "Outbox relay starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_batch().await {
                Ok(report) if report != RelayReport::default() => {
                    info!(
                        delivered = report.delivered,
                        failed = report.failed,
                        dead = report.dead,
                        "Outbox relay cycle"
                    );
                }
                Ok(_) => debug!("No outbox entries due"),
                Err(e) => error!(error = ?e, "Outbox relay error"),
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Outbox relay stopped");
        Ok(())
    }

    /// Claim and deliver one batch of due entries.
    pub async fn process_batch(&self) -> OutboxResult<RelayReport> {
        let entries = self
            .repository
            .claim_due(self.config.batch_size, self.config.lease)
            .await?;
        let mut report = RelayReport::default();

        for entry in entries {
            match self.sink.deliver(&entry).await {
                Ok(()) => {
                    if let Err(e) = self.repository.mark_delivered(entry.id).await {
                        // Written but not acknowledged: the lease expires and the
                        // sink's dedup token absorbs the second write.
                        error!(
                            outbox_id = %entry.id,
                            error = ?e,
                            "Failed to mark entry as delivered after successful write"
                        );
                    } else {
                        report.delivered += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.delivered.inc();
                        }
                    }
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    let message = e.to_string();

                    let outcome = if attempts >= self.config.max_attempts {
                        report.dead += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.dead.inc();
                        }
                        self.repository.mark_dead(entry.id, &message).await
                    } else {
                        report.failed += 1;
                        let next = Utc::now() + self.backoff_for(attempts as u32);
                        self.repository
                            .mark_failed(entry.id, &message, next)
                            .await
                    };

                    if let Err(mark_err) = outcome {
                        error!(
                            outbox_id = %entry.id,
                            error = ?mark_err,
                            "Failed to record outbox delivery failure"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    fn backoff_for(&self, attempt: u32) -> chrono::Duration {
        let delay = self.config.retry.backoff_for_attempt(attempt);
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}
