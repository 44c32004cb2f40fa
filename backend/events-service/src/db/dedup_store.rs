//! Relational side of the pipeline: markers, hot mirror and outbox staging,
//! all behind one transaction per unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idempotent_consumer::{is_marked_in_tx, mark_in_tx, MarkerKind, MarkerStore};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;
use transactional_outbox::{OutboxEntry, SqlxOutboxRepository};

use crate::error::Result;
use crate::models::Event;

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn DedupTransaction>>;

    /// Delete hot mirror rows whose `occurred_at` is before `cutoff`.
    async fn delete_hot_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Retire markers older than `retention`.
    async fn compact_markers(&self, kind: MarkerKind, retention: Duration) -> Result<u64>;
}

/// One open transaction. Dropping it without [`commit`](Self::commit) rolls
/// everything back.
#[async_trait]
pub trait DedupTransaction: Send {
    /// Whether an event marker is already visible to this transaction
    async fn event_seen(&mut self, event_id: &str) -> Result<bool>;

    /// Insert the event marker and its hot mirror row together.
    ///
    /// Returns `false` when another transaction holds the marker already; in
    /// that case nothing was written.
    async fn record_event(&mut self, event: &Event) -> Result<bool>;

    /// Insert a batch marker. Returns `false` if the chunk was submitted before.
    async fn claim_batch(&mut self, batch_key: &str) -> Result<bool>;

    /// Stage an outbox entry so it commits with this transaction.
    async fn stage_outbox(&mut self, entry: &OutboxEntry) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[derive(Clone)]
pub struct PgDedupStore {
    pool: PgPool,
    markers: MarkerStore,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            markers: MarkerStore::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn begin(&self) -> Result<Box<dyn DedupTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgDedupTransaction { tx }))
    }

    async fn delete_hot_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM hot_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn compact_markers(&self, kind: MarkerKind, retention: Duration) -> Result<u64> {
        Ok(self.markers.compact_older_than(kind, retention).await?)
    }
}

struct PgDedupTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DedupTransaction for PgDedupTransaction {
    async fn event_seen(&mut self, event_id: &str) -> Result<bool> {
        Ok(is_marked_in_tx(&mut self.tx, MarkerKind::Event, event_id).await?)
    }

    async fn record_event(&mut self, event: &Event) -> Result<bool> {
        let event_id = event.event_id.to_string();
        if !mark_in_tx(&mut self.tx, MarkerKind::Event, &event_id).await? {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO hot_events (event_id, occurred_at, user_id, event_type, properties, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event_id)
        .bind(event.occurred_at)
        .bind(&event.user_id)
        .bind(&event.event_type)
        .bind(event.properties.as_str())
        .execute(&mut *self.tx)
        .await?;

        debug!(event_id = %event_id, "Event recorded");
        Ok(true)
    }

    async fn claim_batch(&mut self, batch_key: &str) -> Result<bool> {
        Ok(mark_in_tx(&mut self.tx, MarkerKind::Batch, batch_key).await?)
    }

    async fn stage_outbox(&mut self, entry: &OutboxEntry) -> Result<()> {
        Ok(SqlxOutboxRepository::insert(&mut self.tx, entry).await?)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
