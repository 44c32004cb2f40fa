//! Error types for the transactional outbox library.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Entry not found in outbox
    #[error("Outbox entry not found: {0}")]
    EntryNotFound(Uuid),

    /// The sink rejected or could not accept the write
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Stored status column holds an unknown value
    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}
