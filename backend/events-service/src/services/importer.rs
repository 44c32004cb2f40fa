//! Batch Importer: bulk CSV files into idempotent, queued chunks.
//!
//! Each chunk is keyed `"{fingerprint}:chunk:{index}"`. The batch marker is
//! inserted and the chunk enqueued inside one transaction; if the enqueue
//! fails the transaction is dropped, so a chunk is never marked without
//! having been submitted. Rerunning an import skips every chunk that
//! already made it onto the queue.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use task_queue::{Job, TaskQueue};
use tracing::{debug, info, warn};

use crate::db::DedupStore;
use crate::error::{AppError, Result};
use crate::models::Event;
use crate::services::jobs::{ProcessEventsPayload, PROCESS_EVENTS};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

const REQUIRED_COLUMNS: [&str; 4] = ["event_id", "occurred_at", "user_id", "event_type"];

/// How a dataset file is identified across runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintStrategy {
    /// SHA-256 of the file bytes
    #[default]
    Content,
    /// SHA-256 of `path:size:mtime`. A rename or touch yields a new
    /// fingerprint; event-level dedup still absorbs the resubmission.
    Metadata,
}

impl FromStr for FingerprintStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "content" => Ok(FingerprintStrategy::Content),
            "metadata" => Ok(FingerprintStrategy::Metadata),
            other => Err(format!(
                "unknown fingerprint strategy '{}' (expected content or metadata)",
                other
            )),
        }
    }
}

impl fmt::Display for FingerprintStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FingerprintStrategy::Content => write!(f, "content"),
            FingerprintStrategy::Metadata => write!(f, "metadata"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub fingerprint: String,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub chunks_enqueued: usize,
    pub chunks_already_submitted: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprint a file that has already been read into `content`.
pub async fn fingerprint(
    path: &Path,
    content: &[u8],
    strategy: FingerprintStrategy,
) -> Result<String> {
    match strategy {
        FingerprintStrategy::Content => Ok(sha256_hex(content)),
        FingerprintStrategy::Metadata => {
            let meta = tokio::fs::metadata(path).await?;
            let mtime = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            let descriptor = format!("{}:{}:{}", path.display(), meta.len(), mtime);
            Ok(sha256_hex(descriptor.as_bytes()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    event_id: String,
    occurred_at: String,
    user_id: String,
    event_type: String,
    #[serde(default)]
    properties_json: String,
}

impl CsvRow {
    fn into_event(self) -> std::result::Result<Event, String> {
        let properties = if self.properties_json.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&self.properties_json)
                .map_err(|e| format!("properties_json: invalid JSON: {}", e))?
        };

        Event::from_raw(&serde_json::json!({
            "event_id": self.event_id,
            "occurred_at": self.occurred_at,
            "user_id": self.user_id,
            "event_type": self.event_type,
            "properties": properties,
        }))
        .map_err(|e| e.to_string())
    }
}

/// Parse CSV rows into events. Returns the events and the number of rows
/// skipped as malformed. A missing required column fails the whole file.
pub fn parse_csv<R: std::io::Read>(reader: R) -> Result<(Vec<Event>, usize)> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| AppError::Validation(format!("unreadable CSV header: {}", e)))?
        .clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(AppError::Validation(format!(
                "CSV header is missing column '{}'",
                column
            )));
        }
    }

    let mut events = Vec::new();
    let mut skipped = 0;

    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable CSV row");
                skipped += 1;
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        let parsed = record
            .deserialize::<CsvRow>(Some(&headers))
            .map_err(|e| e.to_string())
            .and_then(CsvRow::into_event);

        match parsed {
            Ok(event) => events.push(event),
            Err(reason) => {
                warn!(line, error = %reason, "Skipping malformed CSV row");
                skipped += 1;
            }
        }
    }

    Ok((events, skipped))
}

pub struct BatchImporter {
    store: Arc<dyn DedupStore>,
    queue: Arc<dyn TaskQueue>,
    chunk_size: usize,
}

impl BatchImporter {
    pub fn new(store: Arc<dyn DedupStore>, queue: Arc<dyn TaskQueue>, chunk_size: usize) -> Self {
        Self {
            store,
            queue,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn import_file(
        &self,
        path: &Path,
        strategy: FingerprintStrategy,
    ) -> Result<ImportReport> {
        let content = tokio::fs::read(path).await?;
        let fingerprint = fingerprint(path, &content, strategy).await?;
        let (events, skipped) = parse_csv(content.as_slice())?;

        info!(
            path = %path.display(),
            fingerprint = %fingerprint,
            strategy = %strategy,
            rows = events.len() + skipped,
            skipped,
            "Parsed import file"
        );

        if events.is_empty() {
            return Err(AppError::Validation(format!(
                "{} contains no valid rows ({} skipped)",
                path.display(),
                skipped
            )));
        }

        let mut report = self.import_events(&fingerprint, &events).await?;
        report.rows_read += skipped;
        report.rows_skipped = skipped;
        Ok(report)
    }

    /// Submit already-validated events under `fingerprint`.
    pub async fn import_events(&self, fingerprint: &str, events: &[Event]) -> Result<ImportReport> {
        let mut report = ImportReport {
            fingerprint: fingerprint.to_string(),
            rows_read: events.len(),
            ..Default::default()
        };

        for (index, chunk) in events.chunks(self.chunk_size).enumerate() {
            let batch_key = format!("{}:chunk:{}", fingerprint, index);

            let mut tx = self.store.begin().await?;
            if !tx.claim_batch(&batch_key).await? {
                debug!(batch_key = %batch_key, "Chunk already submitted, skipping");
                report.chunks_already_submitted += 1;
                continue;
            }

            let payload = ProcessEventsPayload {
                events: chunk.iter().map(Event::to_raw).collect(),
                batch_key: Some(batch_key.clone()),
            };
            let job = Job::new(PROCESS_EVENTS, serde_json::to_value(&payload)?);

            // On failure `tx` drops here and the marker rolls back
            self.queue.enqueue(&job).await?;
            tx.commit().await?;

            debug!(batch_key = %batch_key, job_id = %job.id, size = chunk.len(), "Chunk enqueued");
            report.chunks_enqueued += 1;
        }

        info!(
            fingerprint = %fingerprint,
            enqueued = report.chunks_enqueued,
            already_submitted = report.chunks_already_submitted,
            "Import submitted"
        );
        Ok(report)
    }
}
