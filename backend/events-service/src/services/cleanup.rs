//! Cleanup Job: prune the relational hot mirror.
//!
//! One idempotent run, triggered from outside (cron calling `events-cleanup`,
//! or a `cleanup_hot_events` queue job). The analytical store is never touched.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use transactional_outbox::OutboxRepository;

use crate::clock::Clock;
use crate::db::DedupStore;
use crate::error::{AppError, Result};
use idempotent_consumer::MarkerKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub hot_events_deleted: u64,
    pub outbox_purged: u64,
    pub event_markers_retired: u64,
    pub batch_markers_retired: u64,
}

pub struct CleanupJob {
    store: Arc<dyn DedupStore>,
    outbox: Arc<dyn OutboxRepository>,
    clock: Arc<dyn Clock>,
    hot_retention: Duration,
    /// `None` keeps markers forever
    marker_retention: Option<Duration>,
}

impl CleanupJob {
    pub fn new(
        store: Arc<dyn DedupStore>,
        outbox: Arc<dyn OutboxRepository>,
        clock: Arc<dyn Clock>,
        hot_retention: Duration,
        marker_retention: Option<Duration>,
    ) -> Self {
        Self {
            store,
            outbox,
            clock,
            hot_retention,
            marker_retention,
        }
    }

    pub async fn run(&self) -> Result<CleanupReport> {
        let retention = chrono::Duration::from_std(self.hot_retention)
            .map_err(|e| AppError::Validation(format!("invalid hot retention: {}", e)))?;
        let cutoff = self.clock.now() - retention;

        let mut report = CleanupReport {
            hot_events_deleted: self.store.delete_hot_events_before(cutoff).await?,
            outbox_purged: self.outbox.purge_delivered_before(cutoff).await?,
            ..Default::default()
        };

        if let Some(marker_retention) = self.marker_retention {
            report.event_markers_retired = self
                .store
                .compact_markers(MarkerKind::Event, marker_retention)
                .await?;
            report.batch_markers_retired = self
                .store
                .compact_markers(MarkerKind::Batch, marker_retention)
                .await?;
        }

        info!(
            cutoff = %cutoff,
            hot_events_deleted = report.hot_events_deleted,
            outbox_purged = report.outbox_purged,
            event_markers_retired = report.event_markers_retired,
            batch_markers_retired = report.batch_markers_retired,
            "Cleanup finished"
        );
        Ok(report)
    }
}
