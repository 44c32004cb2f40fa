//! Worker loop: reserve, dispatch by kind, settle.

use crate::{metrics, Delivery, QueueResult, TaskQueue};
use async_trait::async_trait;
use resilience::RetryConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a handler failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Worth retrying: storage unavailable, timeouts
    #[error("transient: {0}")]
    Transient(String),
    /// Will fail the same way every time: bad payload, unknown kind
    #[error("permanent: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job kind this handler consumes
    fn kind(&self) -> &'static str;

    async fn handle(&self, payload: &serde_json::Value) -> Result<(), JobError>;
}

/// What happened to one reserved job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried { attempt: u32, delay: Duration },
    DeadLettered { reason: String },
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retried { .. } => "retried",
            JobOutcome::DeadLettered { .. } => "dead",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Retry budget and backoff between redeliveries
    pub retry: RetryConfig,
    /// How long one reserve call waits for work
    pub poll_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                backoff_multiplier: 2.0,
                jitter: true,
            },
            poll_wait: Duration::from_secs(1),
        }
    }
}

/// Pulls jobs off a queue and routes them to handlers.
///
/// Cheap to clone; every clone shares the queue and handlers, so one
/// `Worker` can be spawned N times for N-way concurrency.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    handlers: Arc<HashMap<&'static str, Arc<dyn JobHandler>>>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: Arc<dyn TaskQueue>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handlers: Arc::new(HashMap::new()),
            config,
        }
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).insert(handler.kind(), handler);
        self
    }

    /// Process at most one job. `None` means nothing arrived within `poll_wait`.
    pub async fn run_once(&self) -> QueueResult<Option<JobOutcome>> {
        let Some(delivery) = self.queue.reserve(self.config.poll_wait).await? else {
            return Ok(None);
        };

        let outcome = self.settle(&delivery).await?;
        metrics::record(&delivery.job.kind, outcome.label());
        Ok(Some(outcome))
    }

    async fn settle(&self, delivery: &Delivery) -> QueueResult<JobOutcome> {
        let job = &delivery.job;

        let result = match self.handlers.get(job.kind.as_str()) {
            Some(handler) => handler.handle(&job.payload).await,
            None => Err(JobError::Permanent(format!("no handler for job kind '{}'", job.kind))),
        };

        match result {
            Ok(()) => {
                self.queue.ack(delivery).await?;
                debug!(job_id = %job.id, kind = %job.kind, "Job completed");
                Ok(JobOutcome::Completed)
            }
            Err(JobError::Transient(reason)) => {
                let failures = job.attempts + 1;
                if self.config.retry.allows_retry(failures) {
                    let delay = self.config.retry.backoff_for_attempt(failures);
                    warn!(
                        job_id = %job.id,
                        kind = %job.kind,
                        attempt = failures,
                        max_retries = self.config.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Job failed, scheduling retry"
                    );
                    self.queue.requeue(delivery, delay, &reason).await?;
                    Ok(JobOutcome::Retried {
                        attempt: failures,
                        delay,
                    })
                } else {
                    error!(
                        job_id = %job.id,
                        kind = %job.kind,
                        attempts = failures,
                        error = %reason,
                        "Job exhausted retries, moving to dead letters"
                    );
                    self.queue.dead_letter(delivery, &reason).await?;
                    Ok(JobOutcome::DeadLettered { reason })
                }
            }
            Err(JobError::Permanent(reason)) => {
                error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    error = %reason,
                    "Job failed permanently, moving to dead letters"
                );
                self.queue.dead_letter(delivery, &reason).await?;
                Ok(JobOutcome::DeadLettered { reason })
            }
        }
    }

    /// Loop until `shutdown` flips to true. The job in hand is always settled
    /// before the loop exits.
    pub async fn run(self, id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker = id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // run_once is bounded by poll_wait, so shutdown is noticed promptly
            if let Err(e) = self.run_once().await {
                error!(worker = id, error = %e, "Queue error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_wait) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(worker = id, "Worker stopped");
    }

    /// Spawn `concurrency` copies of this worker.
    pub fn spawn(self, concurrency: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|id| tokio::spawn(self.clone().run(id, shutdown.clone())))
            .collect()
    }
}

/// Return jobs with expired leases to ready every `every` until `shutdown`
/// flips. Safe to run in every instance at once.
pub fn spawn_reclaimer(
    queue: Arc<dyn TaskQueue>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = queue.reclaim_expired().await {
                error!(error = %e, "Failed to reclaim expired jobs");
            }
        }
        debug!("Reclaimer stopped");
    })
}
