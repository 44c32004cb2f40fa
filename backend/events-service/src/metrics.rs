//! Prometheus metrics for the pipeline, exported at `GET /metrics`.

use actix_web::HttpResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        "events_received_total",
        "Events accepted by the ingestion endpoint"
    )
    .unwrap();

    pub static ref EVENTS_FAILED_TOTAL: IntCounter = register_int_counter!(
        "events_failed_total",
        "Ingestion requests that could not be queued"
    )
    .unwrap();

    /// Per-event processing result: inserted, duplicate or malformed
    pub static ref EVENTS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "events_processed_total",
        "Events handled by the processor by result",
        &["result"]
    )
    .unwrap();

    pub static ref ANALYTICS_WRITES_DEFERRED_TOTAL: IntCounter = register_int_counter!(
        "analytics_writes_deferred_total",
        "Analytical writes left to the outbox relay after an inline failure"
    )
    .unwrap();

    pub static ref RATE_LIMITED_TOTAL: IntCounter = register_int_counter!(
        "rate_limited_requests_total",
        "Ingestion requests rejected by the rate limiter"
    )
    .unwrap();

    pub static ref EVENTS_PROCESSING_SECONDS: Histogram = register_histogram!(
        "events_processing_seconds",
        "Time to process one queued event batch",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref QUERY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "analytics_query_duration_seconds",
        "Analytical query latency by query",
        &["query"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();
}

/// Prometheus text exposition of the default registry
pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
