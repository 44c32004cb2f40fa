/// Ingestion endpoint: validate, enqueue, acknowledge
use actix_web::{web, HttpResponse};
use task_queue::Job;
use tracing::{debug, error};

use crate::error::{AppError, Result};
use crate::metrics::{EVENTS_FAILED_TOTAL, EVENTS_RECEIVED_TOTAL};
use crate::models::{Event, IngestRequest, IngestResponse};
use crate::services::{ProcessEventsPayload, PROCESS_EVENTS};
use crate::AppState;

/// `POST /events`
///
/// The whole request is rejected if any event is malformed, naming the
/// first bad field as `events[i].field`. Valid requests are queued as one
/// batch and acknowledged with 202 before processing.
pub async fn ingest_events(
    state: web::Data<AppState>,
    body: web::Json<IngestRequest>,
) -> Result<HttpResponse> {
    let IngestRequest { events } = body.into_inner();

    let mut validated = Vec::with_capacity(events.len());
    for (index, raw) in events.iter().enumerate() {
        let event = Event::from_raw(raw).map_err(|e| AppError::Validation(e.at(index)))?;
        validated.push(event.to_raw());
    }

    let count = validated.len();
    if count == 0 {
        return Ok(accepted(0));
    }

    let payload = ProcessEventsPayload {
        events: validated,
        batch_key: None,
    };
    let job = Job::new(PROCESS_EVENTS, serde_json::to_value(&payload)?);

    if let Err(e) = state.queue.enqueue(&job).await {
        error!(count, error = %e, "Failed to enqueue events");
        EVENTS_FAILED_TOTAL.inc();
        return Err(AppError::Ingest(e.to_string()));
    }

    EVENTS_RECEIVED_TOTAL.inc_by(count as u64);
    debug!(job_id = %job.id, count, "Events accepted");
    Ok(accepted(count))
}

fn accepted(count: usize) -> HttpResponse {
    HttpResponse::Accepted().json(IngestResponse {
        status: "accepted".to_string(),
        count,
    })
}
