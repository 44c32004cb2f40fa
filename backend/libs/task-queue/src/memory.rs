//! In-process [`TaskQueue`] with the same settle semantics as the Redis one.

use crate::redis_queue::DEFAULT_LEASE;
use crate::{Delivery, Job, QueueError, QueueResult, QueueStats, TaskQueue};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Default)]
struct State {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    /// Receipt to (lease end, job)
    in_flight: HashMap<String, (Instant, Job)>,
    dead: VecDeque<Job>,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        self.ready.extend(due.into_iter().map(|(_, job)| job));
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

pub struct MemoryTaskQueue {
    state: Mutex<State>,
    notify: Notify,
    lease: Duration,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            notify: Notify::new(),
            lease: DEFAULT_LEASE,
        }
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Jobs currently waiting, oldest first
    pub async fn ready_jobs(&self) -> Vec<Job> {
        self.state.lock().await.ready.iter().cloned().collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.state.lock().await.ready.push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_due(now);

                if let Some(job) = state.ready.pop_front() {
                    let receipt = Uuid::new_v4().to_string();
                    state
                        .in_flight
                        .insert(receipt.clone(), (now + self.lease, job.clone()));
                    return Ok(Some(Delivery { job, receipt }));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state.next_due().map_or(deadline, |due| due.min(deadline))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.job.id.to_string()))
    }

    async fn requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&delivery.receipt);
        state
            .delayed
            .push((Instant::now() + delay, delivery.job.with_failure(error)));
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&delivery.receipt);
        state.dead.push_back(delivery.job.with_failure(error));
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .await
            .dead
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_dead_letters(&self, limit: usize) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let count = limit.min(state.dead.len());
        let replayed: Vec<Job> = state.dead.drain(..count).collect();
        for mut job in replayed {
            job.attempts = 0;
            state.ready.push_back(job);
        }
        drop(state);
        self.notify.notify_one();
        Ok(count as u64)
    }

    async fn reclaim_expired(&self) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, (lease_end, _))| *lease_end <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in &expired {
            if let Some((_, job)) = state.in_flight.remove(receipt) {
                state.ready.push_front(job);
            }
        }
        drop(state);
        if !expired.is_empty() {
            self.notify.notify_one();
        }
        Ok(expired.len() as u64)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            ready: state.ready.len() as u64,
            delayed: state.delayed.len() as u64,
            in_flight: state.in_flight.len() as u64,
            dead: state.dead.len() as u64,
        })
    }
}
