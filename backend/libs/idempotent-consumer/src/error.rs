//! Error types for the idempotency marker library

use thiserror::Error;

/// Result type for marker operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while reading or writing markers
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Marker key validation failed (empty, too long)
    #[error("Invalid marker key: {0}")]
    InvalidKey(String),

    /// Retention window cannot be turned into a cutoff timestamp
    #[error("Invalid retention: {0}")]
    InvalidRetention(String),
}

impl IdempotencyError {
    /// Check if error is a duplicate key violation
    ///
    /// Marker inserts use `ON CONFLICT DO NOTHING`, so this only shows up when
    /// a caller writes the marker tables directly.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            IdempotencyError::Database(sqlx_err) => sqlx_err
                .as_database_error()
                .and_then(|db_err| db_err.code())
                .as_deref()
                == Some("23505"),
            _ => false,
        }
    }

    /// Check if error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        match self {
            IdempotencyError::Database(sqlx_err) => matches!(
                sqlx_err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}
