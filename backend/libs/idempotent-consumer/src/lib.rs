//! # Idempotency Markers
//!
//! Persistent "already processed" markers for at-least-once pipelines, stored in
//! PostgreSQL so they survive worker restarts, crashes and redelivery.
//!
//! Two marker families share one mechanism:
//!
//! - **Event markers** (`event_dedup`): one row per processed `event_id`.
//! - **Batch markers** (`batch_dedup`): one row per submitted bulk-import chunk
//!   (`{fingerprint}:chunk:{index}`).
//!
//! ## Transaction-scoped marking
//!
//! Markers are written inside the caller's transaction so they commit atomically
//! with whatever they guard (hot mirror rows, outbox entries). A marker that is
//! rolled back never existed.
//!
//! ```text
//! BEGIN
//!   is_marked_in_tx(event)   -- fast path for redelivered batches
//!   mark_in_tx(event)        -- INSERT ... ON CONFLICT DO NOTHING
//!   <guarded writes>
//! COMMIT
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use idempotent_consumer::{mark_in_tx, MarkerKind};
//! # use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let mut tx = pool.begin().await?;
//!
//! if mark_in_tx(&mut tx, MarkerKind::Event, "0b5c...").await? {
//!     // first time: write the guarded rows in the same transaction
//! }
//!
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Safety
//!
//! The check alone is not enough: two transactions carrying the same key can
//! both see "absent". The insert settles it. The second inserter blocks on the
//! unique index until the first commits, then affects zero rows, so exactly one
//! caller gets `true` from [`mark_in_tx`].
//!
//! ## Retention
//!
//! Markers are never deleted by the pipeline itself. [`MarkerStore::compact_older_than`]
//! exists for operators who choose to retire markers older than the maximum
//! redelivery window; retiring them earlier re-opens the door to double counting.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// Maximum accepted key length (matches the VARCHAR width in the schema)
pub const MAX_KEY_LEN: usize = 255;

/// Which marker family a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Per-event marker keyed by event_id
    Event,
    /// Per-chunk marker keyed by batch key
    Batch,
}

impl MarkerKind {
    fn table(self) -> &'static str {
        match self {
            MarkerKind::Event => "event_dedup",
            MarkerKind::Batch => "batch_dedup",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            MarkerKind::Event => "event_id",
            MarkerKind::Batch => "batch_key",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MarkerKind::Event => "event",
            MarkerKind::Batch => "batch",
        }
    }

    fn exists_sql(self) -> String {
        format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = $1) AS exists",
            self.table(),
            self.key_column()
        )
    }

    fn insert_sql(self) -> String {
        format!(
            "INSERT INTO {} ({}, created_at) VALUES ($1, NOW()) ON CONFLICT ({}) DO NOTHING",
            self.table(),
            self.key_column(),
            self.key_column()
        )
    }

    fn compact_sql(self) -> String {
        format!("DELETE FROM {} WHERE created_at < $1", self.table())
    }
}

/// Check whether a marker exists, inside an open transaction
pub async fn is_marked_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    kind: MarkerKind,
    key: &str,
) -> IdempotencyResult<bool> {
    validate_key(key)?;

    let row = sqlx::query(&kind.exists_sql())
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;

    let exists: bool = row.try_get("exists")?;
    if exists {
        debug!(kind = kind.as_str(), key = %key, "Marker already present");
    }
    Ok(exists)
}

/// Insert a marker inside an open transaction
///
/// # Returns
///
/// - `Ok(true)` if this call created the marker
/// - `Ok(false)` if the marker already existed (or a concurrent transaction
///   committed it first)
pub async fn mark_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    kind: MarkerKind,
    key: &str,
) -> IdempotencyResult<bool> {
    validate_key(key)?;

    let result = sqlx::query(&kind.insert_sql())
        .bind(key)
        .execute(&mut **tx)
        .await?;

    let inserted = result.rows_affected() > 0;
    if !inserted {
        debug!(kind = kind.as_str(), key = %key, "Marker insert was a duplicate");
    }
    Ok(inserted)
}

/// Pool-level marker operations
#[derive(Clone)]
pub struct MarkerStore {
    pool: PgPool,
}

impl MarkerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check if a marker exists outside of any transaction
    pub async fn is_marked(&self, kind: MarkerKind, key: &str) -> IdempotencyResult<bool> {
        validate_key(key)?;

        let row = sqlx::query(&kind.exists_sql())
            .bind(key)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("exists")?)
    }

    /// Delete markers older than `retention`
    ///
    /// Returns the number of markers retired.
    pub async fn compact_older_than(
        &self,
        kind: MarkerKind,
        retention: Duration,
    ) -> IdempotencyResult<u64> {
        let cutoff = cutoff_for(retention, Utc::now())?;

        let result = sqlx::query(&kind.compact_sql())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(
                kind = kind.as_str(),
                deleted_count = deleted,
                cutoff_time = %cutoff,
                "Retired old idempotency markers"
            );
        } else {
            debug!(kind = kind.as_str(), "No markers old enough to retire");
        }

        Ok(deleted)
    }
}

/// `now - retention`, rejecting durations chrono cannot represent
pub fn cutoff_for(retention: Duration, now: DateTime<Utc>) -> IdempotencyResult<DateTime<Utc>> {
    let retention = chrono::Duration::from_std(retention)
        .map_err(|e| IdempotencyError::InvalidRetention(e.to_string()))?;
    now.checked_sub_signed(retention)
        .ok_or_else(|| IdempotencyError::InvalidRetention("retention too large".to_string()))
}

fn validate_key(key: &str) -> IdempotencyResult<()> {
    if key.is_empty() {
        return Err(IdempotencyError::InvalidKey(
            "Marker key cannot be empty".to_string(),
        ));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(IdempotencyError::InvalidKey(format!(
            "Marker key too long: {} characters (max {})",
            key.len(),
            MAX_KEY_LEN
        )));
    }

    Ok(())
}
