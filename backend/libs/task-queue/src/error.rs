use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ack/requeue for a delivery the queue no longer holds in flight
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}
