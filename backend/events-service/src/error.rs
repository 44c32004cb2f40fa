use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("ClickHouse error: {0}")]
    ClickHouse(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Ingestion could not hand events off to the queue
    #[error("Ingestion failed: {0}")]
    Ingest(String),

    /// An analytical query failed in the store
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error body. Only the generic message leaves the service; the cause is logged.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl AppError {
    /// Storage or broker trouble that may clear up on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::ClickHouse(_)
                | AppError::Queue(_)
                | AppError::Redis(_)
                | AppError::Io(_)
        )
    }

    fn detail(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::RateLimited => "Rate limit exceeded".to_string(),
            AppError::Ingest(_) => "Failed to process events".to_string(),
            AppError::Query(_) => "Query failed".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        HttpResponse::build(code).json(ErrorResponse {
            detail: self.detail(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<clickhouse::error::Error> for AppError {
    fn from(err: clickhouse::error::Error) -> Self {
        AppError::ClickHouse(err.to_string())
    }
}

impl From<idempotent_consumer::IdempotencyError> for AppError {
    fn from(err: idempotent_consumer::IdempotencyError) -> Self {
        match err {
            idempotent_consumer::IdempotencyError::InvalidKey(msg) => AppError::Validation(msg),
            other => AppError::Database(other.to_string()),
        }
    }
}

impl From<transactional_outbox::OutboxError> for AppError {
    fn from(err: transactional_outbox::OutboxError) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<task_queue::QueueError> for AppError {
    fn from(err: task_queue::QueueError) -> Self {
        AppError::Queue(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    async fn body_of(err: AppError) -> (StatusCode, serde_json::Value) {
        let resp = err.error_response();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[actix_web::test]
    async fn test_validation_names_the_field() {
        let (status, body) =
            body_of(AppError::Validation("events[2].occurred_at: invalid timestamp".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "events[2].occurred_at: invalid timestamp");
    }

    #[actix_web::test]
    async fn test_internal_detail_never_leaks() {
        let (status, body) =
            body_of(AppError::Ingest("redis: connection refused at 10.0.0.3".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "Failed to process events");

        let (_, body) = body_of(AppError::Query("Code: 60. Table analytics.events doesn't exist".into())).await;
        assert_eq!(body["detail"], "Query failed");

        let (_, body) = body_of(AppError::Database("password authentication failed".into())).await;
        assert_eq!(body["detail"], "Internal server error");
    }

    #[actix_web::test]
    async fn test_rate_limited_is_429() {
        let (status, body) = body_of(AppError::RateLimited).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["detail"], "Rate limit exceeded");
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::ClickHouse("timeout".into()).is_transient());
        assert!(AppError::Database("pool timed out".into()).is_transient());
        assert!(!AppError::Validation("bad".into()).is_transient());
        assert!(!AppError::Internal("bug".into()).is_transient());
    }
}
