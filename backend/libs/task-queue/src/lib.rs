//! # Durable Work Queue
//!
//! At-least-once job queue used to hand ingestion and import batches from the
//! HTTP front end to background workers.
//!
//! A reserved job moves to an in-flight list under a lease and stays there
//! until the worker acks it, schedules a retry, or dead-letters it. A worker
//! that dies mid-job leaves the job in flight; once its lease runs out
//! [`TaskQueue::reclaim_expired`] puts it back on the ready list. Jobs other
//! workers are still holding are left alone. A handler that outlives its lease
//! may see its job delivered twice, so handlers must be idempotent.
//!
//! ```text
//! enqueue ──▶ ready ──reserve──▶ inflight ──ack──▶ (gone)
//!               ▲                   │
//!               │ due               ├─requeue──▶ delayed
//!               └──── delayed ◀─────┘
//!                                   └─dead_letter──▶ dead ──replay──▶ ready
//! ```
//!
//! Two implementations share the [`TaskQueue`] trait: [`RedisTaskQueue`] for
//! production and [`MemoryTaskQueue`] for tests and single-process use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

mod error;
pub mod memory;
mod metrics;
pub mod redis_queue;
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryTaskQueue;
pub use redis_queue::{RedisTaskQueue, DEFAULT_LEASE};
pub use worker::{spawn_reclaimer, JobError, JobHandler, JobOutcome, Worker, WorkerConfig};

/// A unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Routes the job to a handler
    pub kind: String,
    pub payload: serde_json::Value,
    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Copy of the job carrying one more recorded failure
    pub fn with_failure(&self, error: &str) -> Self {
        let mut next = self.clone();
        next.attempts += 1;
        next.last_error = Some(error.to_string());
        next
    }
}

/// A reserved job plus the handle needed to settle it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub receipt: String,
}

/// Queue depth snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub dead: u64,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a job to the ready list.
    async fn enqueue(&self, job: &Job) -> QueueResult<()>;

    /// Reserve the next ready job, waiting up to `wait` for one to appear.
    async fn reserve(&self, wait: Duration) -> QueueResult<Option<Delivery>>;

    /// Remove a finished job from flight.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Record a failure and make the job ready again after `delay`.
    async fn requeue(&self, delivery: &Delivery, delay: Duration, error: &str)
        -> QueueResult<()>;

    /// Record a final failure and park the job for inspection.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()>;

    /// Oldest-first view of up to `limit` dead jobs.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<Job>>;

    /// Move up to `limit` dead jobs back to ready with a fresh attempt budget.
    async fn replay_dead_letters(&self, limit: usize) -> QueueResult<u64>;

    /// Return in-flight jobs whose lease has expired to ready. Settling an
    /// expired delivery afterwards fails with [`QueueError::UnknownDelivery`].
    async fn reclaim_expired(&self) -> QueueResult<u64>;

    async fn stats(&self) -> QueueResult<QueueStats>;
}
