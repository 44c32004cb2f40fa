//! Queue job kinds consumed by the worker pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use task_queue::{JobError, JobHandler};
use tracing::info;

use crate::error::AppError;
use crate::services::cleanup::CleanupJob;
use crate::services::processor::EventProcessor;

/// A batch of raw events for the Event Processor
pub const PROCESS_EVENTS: &str = "process_events";

/// One Cleanup Job run, for deployments that schedule it through the queue
pub const CLEANUP_HOT_EVENTS: &str = "cleanup_hot_events";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEventsPayload {
    pub events: Vec<serde_json::Value>,
    /// Set for chunks submitted by the Batch Importer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_key: Option<String>,
}

fn job_error(err: AppError) -> JobError {
    if err.is_transient() {
        JobError::Transient(err.to_string())
    } else {
        JobError::Permanent(err.to_string())
    }
}

pub struct ProcessEventsHandler {
    processor: Arc<EventProcessor>,
}

impl ProcessEventsHandler {
    pub fn new(processor: Arc<EventProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for ProcessEventsHandler {
    fn kind(&self) -> &'static str {
        PROCESS_EVENTS
    }

    async fn handle(&self, payload: &serde_json::Value) -> Result<(), JobError> {
        let payload: ProcessEventsPayload = serde_json::from_value(payload.clone())
            .map_err(|e| JobError::Permanent(format!("invalid {} payload: {}", PROCESS_EVENTS, e)))?;

        let report = self.processor.process(&payload.events).await.map_err(job_error)?;

        if let Some(batch_key) = payload.batch_key {
            info!(
                batch_key = %batch_key,
                inserted = report.inserted,
                duplicates = report.duplicates,
                "Import chunk processed"
            );
        }
        Ok(())
    }
}

pub struct CleanupHandler {
    job: Arc<CleanupJob>,
}

impl CleanupHandler {
    pub fn new(job: Arc<CleanupJob>) -> Self {
        Self { job }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    fn kind(&self) -> &'static str {
        CLEANUP_HOT_EVENTS
    }

    async fn handle(&self, _payload: &serde_json::Value) -> Result<(), JobError> {
        self.job.run().await.map(|_| ()).map_err(job_error)
    }
}
