//! Event Processor: turns one delivered batch into dedup markers, hot rows
//! and analytical rows, exactly once per `event_id`.
//!
//! ```text
//! BEGIN
//!   for each event (in order):
//!     seen?            -> duplicate, skip
//!     record marker+hot row (ON CONFLICT DO NOTHING)
//!       lost the race  -> duplicate, skip
//!   stage outbox entry with the new rows
//! COMMIT
//! write rows to ClickHouse (token = outbox id)
//!   ok   -> mark entry delivered
//!   fail -> leave pending for the relay
//! ```
//!
//! Once the transaction commits, the analytical write is owed and recorded.
//! A redelivered batch only finds markers, so it cannot double count.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use transactional_outbox::{OutboxEntry, OutboxRepository};

use crate::db::{AnalyticsWriter, DedupStore};
use crate::error::Result;
use crate::metrics::{
    ANALYTICS_WRITES_DEFERRED_TOTAL, EVENTS_PROCESSED_TOTAL, EVENTS_PROCESSING_SECONDS,
};
use crate::models::{AnalyticsEventRow, Event};

/// Per-batch outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub received: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub malformed: usize,
    /// The analytical write failed inline and was left to the relay
    pub deferred: bool,
}

pub struct EventProcessor {
    store: Arc<dyn DedupStore>,
    outbox: Arc<dyn OutboxRepository>,
    writer: Arc<dyn AnalyticsWriter>,
    outbox_grace: Duration,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn DedupStore>,
        outbox: Arc<dyn OutboxRepository>,
        writer: Arc<dyn AnalyticsWriter>,
        outbox_grace: Duration,
    ) -> Self {
        Self {
            store,
            outbox,
            writer,
            outbox_grace,
        }
    }

    /// Process one batch of raw records.
    ///
    /// An `Err` means nothing was committed and the whole batch may be
    /// redelivered. Records that fail validation are skipped, not fatal.
    pub async fn process(&self, records: &[serde_json::Value]) -> Result<ProcessReport> {
        let started = Instant::now();
        let mut report = ProcessReport {
            received: records.len(),
            ..Default::default()
        };

        let mut tx = self.store.begin().await?;
        let mut rows: Vec<AnalyticsEventRow> = Vec::new();

        for (index, raw) in records.iter().enumerate() {
            let event = match Event::from_raw(raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(position = index, error = %e, "Skipping malformed event in batch");
                    report.malformed += 1;
                    continue;
                }
            };

            let event_id = event.event_id.to_string();
            if tx.event_seen(&event_id).await? {
                debug!(event_id = %event_id, "Duplicate event skipped");
                report.duplicates += 1;
                continue;
            }

            if !tx.record_event(&event).await? {
                // A concurrent batch committed the same event first
                debug!(event_id = %event_id, "Duplicate event lost insert race");
                report.duplicates += 1;
                continue;
            }

            rows.push(event.to_row());
        }

        let entry = if rows.is_empty() {
            None
        } else {
            let entry = OutboxEntry::pending(
                serde_json::to_value(&rows)?,
                rows.len() as i32,
                self.outbox_grace,
            );
            tx.stage_outbox(&entry).await?;
            Some(entry)
        };

        tx.commit().await?;
        report.inserted = rows.len();

        if let Some(entry) = entry {
            match self.writer.write_events(&rows, entry.id).await {
                Ok(()) => {
                    if let Err(e) = self.outbox.mark_delivered(entry.id).await {
                        // Relay will rewrite it; the dedup token absorbs the repeat
                        warn!(
                            outbox_id = %entry.id,
                            error = %e,
                            "Written to ClickHouse but outbox entry not marked delivered"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        outbox_id = %entry.id,
                        count = rows.len(),
                        error = %e,
                        "ClickHouse write failed, deferring to outbox relay"
                    );
                    report.deferred = true;
                    ANALYTICS_WRITES_DEFERRED_TOTAL.inc();
                }
            }
        }

        EVENTS_PROCESSED_TOTAL
            .with_label_values(&["inserted"])
            .inc_by(report.inserted as u64);
        EVENTS_PROCESSED_TOTAL
            .with_label_values(&["duplicate"])
            .inc_by(report.duplicates as u64);
        EVENTS_PROCESSED_TOTAL
            .with_label_values(&["malformed"])
            .inc_by(report.malformed as u64);
        EVENTS_PROCESSING_SECONDS.observe(started.elapsed().as_secs_f64());

        if report.inserted > 0 {
            info!(
                received = report.received,
                inserted = report.inserted,
                duplicates = report.duplicates,
                malformed = report.malformed,
                deferred = report.deferred,
                "Events processed"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::outbox::AnalyticsOutboxSink;
    use crate::testing::{raw_event, MemoryStore, RecordingWriter};
    use serde_json::json;
    use transactional_outbox::{OutboxProcessor, OutboxProcessorConfig, OutboxStatus};

    const E1: &str = "6f1c2a9e-0d4b-4c1e-8a55-3b7e9f0d2c11";
    const E2: &str = "a2d4f6b8-1c3e-4a5b-9d7f-0e2c4a6b8d13";
    const E3: &str = "c7e9a1b3-5d7f-4b9d-8f1a-3c5e7a9b1d15";

    fn processor(store: &Arc<MemoryStore>, writer: &Arc<RecordingWriter>) -> EventProcessor {
        EventProcessor::new(
            store.clone(),
            store.clone(),
            writer.clone(),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_new_events_reach_both_stores() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(&store, &writer);

        let report = processor
            .process(&[raw_event(E1, "user_0", "2025-01-15T10:00:00Z"), raw_event(E2, "user_1", "2025-01-15T11:00:00Z")])
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates, 0);
        assert!(!report.deferred);
        assert_eq!(store.event_marker_count().await, 2);
        assert_eq!(store.hot_event_count().await, 2);
        assert_eq!(writer.rows_written().await, 2);

        let entries = store.outbox_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, OutboxStatus::Delivered);
    }

    #[tokio::test]
    async fn test_same_event_three_times_yields_one_row() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(&store, &writer);

        let e1 = raw_event(E1, "user_0", "2025-01-15T10:00:00Z");
        for _ in 0..3 {
            processor.process(&[e1.clone()]).await.unwrap();
        }

        assert_eq!(writer.rows_written().await, 1);
        assert_eq!(store.event_marker_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_one_batch() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(&store, &writer);

        let e1 = raw_event(E1, "user_0", "2025-01-15T10:00:00Z");
        let report = processor.process(&[e1.clone(), e1]).await.unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(writer.rows_written().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_isolated() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(&store, &writer);

        let report = processor
            .process(&[
                raw_event(E1, "user_0", "2025-01-15T10:00:00Z"),
                json!({"event_id": "nope", "occurred_at": "2025-01-15T10:00:00Z"}),
                raw_event(E2, "user_1", "2025-01-15T10:00:00Z"),
            ])
            .await
            .unwrap();

        assert_eq!(report.received, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.malformed, 1);
    }

    #[tokio::test]
    async fn test_nul_bytes_do_not_sink_the_batch() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(&store, &writer);

        let mut poisoned = raw_event(E2, "user_1", "2025-01-15T10:00:00Z");
        poisoned["properties"] = json!({"k": "v\u{0}"});

        let report = processor
            .process(&[raw_event(E1, "user_0", "2025-01-15T10:00:00Z"), poisoned])
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(store.hot_event_count().await, 1);
        let entries = store.outbox_entries().await;
        assert!(!entries[0].payload.to_string().contains("\\u0000"));
    }

    #[tokio::test]
    async fn test_all_duplicates_write_nothing() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(&store, &writer);

        let batch = [raw_event(E1, "user_0", "2025-01-15T10:00:00Z")];
        processor.process(&batch).await.unwrap();
        let report = processor.process(&batch).await.unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(writer.write_calls().await, 1);
        assert_eq!(store.outbox_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_markers() {
        let store = Arc::new(MemoryStore::default());
        store.fail_next_commit();
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(&store, &writer);

        let batch = [raw_event(E1, "user_0", "2025-01-15T10:00:00Z")];
        assert!(processor.process(&batch).await.is_err());
        assert_eq!(store.event_marker_count().await, 0);
        assert_eq!(store.hot_event_count().await, 0);
        assert_eq!(writer.write_calls().await, 0);

        // Redelivery succeeds as if the first attempt never happened
        let report = processor.process(&batch).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(writer.rows_written().await, 1);
    }

    #[tokio::test]
    async fn test_analytical_failure_is_recovered_by_relay_without_double_count() {
        let store = Arc::new(MemoryStore::default());
        let writer = Arc::new(RecordingWriter::failing(1));
        let processor = processor(&store, &writer);

        let batch = [
            raw_event(E1, "user_0", "2025-01-15T10:00:00Z"),
            raw_event(E2, "user_1", "2025-01-15T10:00:00Z"),
        ];
        let report = processor.process(&batch).await.unwrap();
        assert!(report.deferred);
        assert_eq!(writer.rows_written().await, 0);
        assert_eq!(store.outbox_entries().await[0].status, OutboxStatus::Pending);

        // The job system redelivers the batch: markers make it a no-op
        let report = processor.process(&batch).await.unwrap();
        assert_eq!(report.duplicates, 2);
        assert_eq!(writer.rows_written().await, 0);

        // The relay writes the owed rows exactly once
        let relay = OutboxProcessor::new(
            store.clone(),
            Arc::new(AnalyticsOutboxSink::new(writer.clone())),
            OutboxProcessorConfig {
                lease: Duration::ZERO,
                ..Default::default()
            },
        );
        let relayed = relay.process_batch().await.unwrap();
        assert_eq!(relayed.delivered, 1);
        assert_eq!(writer.rows_written().await, 2);
        assert_eq!(store.outbox_entries().await[0].status, OutboxStatus::Delivered);

        // Later batches keep flowing normally
        processor
            .process(&[raw_event(E3, "user_2", "2025-01-16T09:00:00Z")])
            .await
            .unwrap();
        assert_eq!(writer.rows_written().await, 3);
    }
}
