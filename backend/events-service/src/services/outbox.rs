/// Outbox sink - replays committed analytical writes into ClickHouse
///
/// The Event Processor stages one outbox entry per batch in the same
/// PostgreSQL transaction as the dedup markers. When the inline ClickHouse
/// write fails, the relay (`transactional_outbox::OutboxProcessor`) hands the
/// entry to this sink until it lands.
///
/// ```text
/// ┌───────────┐  BEGIN..COMMIT  ┌──────────────────┐   relay   ┌────────────┐
/// │ Processor │────────────────▶│ analytics_outbox │──────────▶│ ClickHouse │
/// └───────────┘ markers + entry └──────────────────┘ this sink └────────────┘
/// ```
///
/// The entry id doubles as the insert deduplication token, so a replay of an
/// entry whose earlier write did land is absorbed by the store.
use async_trait::async_trait;
use std::sync::Arc;
use transactional_outbox::{OutboxEntry, OutboxError, OutboxResult, OutboxSink};

use crate::db::AnalyticsWriter;
use crate::models::AnalyticsEventRow;

pub struct AnalyticsOutboxSink {
    writer: Arc<dyn AnalyticsWriter>,
}

impl AnalyticsOutboxSink {
    pub fn new(writer: Arc<dyn AnalyticsWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl OutboxSink for AnalyticsOutboxSink {
    async fn deliver(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let rows: Vec<AnalyticsEventRow> = serde_json::from_value(entry.payload.clone())?;

        self.writer
            .write_events(&rows, entry.id)
            .await
            .map_err(|e| OutboxError::DeliveryFailed(e.to_string()))
    }
}
