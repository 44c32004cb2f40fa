/// HTTP handlers for the events service
///
/// - Events: batch ingestion onto the work queue
/// - Stats: DAU, top events and retention queries
/// - Health and Prometheus metrics
pub mod events;
pub mod health;
pub mod stats;

use actix_web::web;

use crate::error::AppError;
use crate::metrics::metrics_handler;
use crate::middleware::RateLimitMiddleware;
use crate::AppState;

pub use events::ingest_events;
pub use health::health;
pub use stats::{dau, retention, top_events};

/// Largest accepted `POST /events` body
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Register every route. Rate limiting covers `/events` only.
pub fn configure(cfg: &mut web::ServiceConfig, state: &web::Data<AppState>) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(MAX_BODY_BYTES)
            .error_handler(|err, _req| AppError::Validation(format!("body: {}", err)).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| AppError::Validation(format!("query: {}", err)).into()),
    )
    .service(
        web::resource("/events")
            .wrap(RateLimitMiddleware::new(state.rate_limiter.clone()))
            .route(web::post().to(ingest_events)),
    )
    .service(
        web::scope("/stats")
            .route("/dau", web::get().to(dau))
            .route("/top-events", web::get().to(top_events))
            .route("/retention", web::get().to(retention)),
    )
    .route("/health", web::get().to(health))
    .route("/metrics", web::get().to(metrics_handler));
}
