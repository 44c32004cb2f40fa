//! Events Service
//!
//! Ingests activity events at least once, records each `event_id` exactly
//! once in ClickHouse, and answers DAU, top-events and retention queries.
//!
//! ```text
//! POST /events ──▶ work queue ──▶ EventProcessor ──▶ PostgreSQL (markers, hot mirror, outbox)
//! import-events ─┘                                 └─▶ ClickHouse events (relay on failure)
//! GET /stats/* ──▶ QueryEngine ──▶ ClickHouse
//! ```

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod services;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use services::{QueryEngine, RateLimiter};
use task_queue::TaskQueue;

pub use config::Config;
pub use error::{AppError, Result};

/// Shared handles for the HTTP layer
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn TaskQueue>,
    pub queries: QueryEngine,
    pub rate_limiter: Arc<RateLimiter>,
}
