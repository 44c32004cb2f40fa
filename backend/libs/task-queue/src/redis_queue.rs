//! Redis-backed [`TaskQueue`].
//!
//! Keys, all under one namespace:
//!
//! | key               | type | content                              |
//! |-------------------|------|--------------------------------------|
//! | `{ns}:ready`      | list | jobs waiting, pushed left, popped right |
//! | `{ns}:inflight`   | list | jobs reserved by a worker            |
//! | `{ns}:leases`     | zset | in-flight jobs, scored by lease end (ms) |
//! | `{ns}:delayed`    | zset | retries, scored by due time (ms)     |
//! | `{ns}:dead`       | list | jobs that exhausted their retries    |
//!
//! Reservation never blocks the shared connection: a script promotes due
//! retries and moves one job from ready to in-flight atomically, and the
//! caller polls until `wait` runs out. The same script stamps the lease, so
//! a job is never in flight without one.

use crate::{Delivery, Job, QueueError, QueueResult, QueueStats, TaskQueue};
use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis_utils::SharedConnectionManager;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Due retries promoted per reservation attempt
const PROMOTE_BATCH: i64 = 100;

/// Expired leases examined per reclaim script call
const RECLAIM_BATCH: i64 = 100;

/// Default time a worker may hold a job before it counts as abandoned
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

const RESERVE_SCRIPT: &str = r#"
    local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
    for _, raw in ipairs(due) do
        redis.call('ZREM', KEYS[3], raw)
        redis.call('LPUSH', KEYS[1], raw)
    end
    local raw = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
    if raw then
        redis.call('ZADD', KEYS[4], ARGV[3], raw)
    end
    return raw
"#;

const MOVE_IF_PRESENT_SCRIPT: &str = r#"
    if KEYS[3] then
        redis.call('ZREM', KEYS[3], ARGV[1])
    end
    if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
        redis.call('LPUSH', KEYS[2], ARGV[2])
        return 1
    end
    return 0
"#;

// KEYS: leases, inflight, ready. ARGV: now, batch, lease end for unleased entries.
// Returns {leases examined, jobs moved back to ready}.
const RECLAIM_SCRIPT: &str = r#"
    for _, raw in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
        if not redis.call('ZSCORE', KEYS[1], raw) then
            redis.call('ZADD', KEYS[1], ARGV[3], raw)
        end
    end
    local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
    local moved = 0
    for _, raw in ipairs(expired) do
        redis.call('ZREM', KEYS[1], raw)
        if redis.call('LREM', KEYS[2], 1, raw) == 1 then
            redis.call('RPUSH', KEYS[3], raw)
            moved = moved + 1
        end
    end
    return {#expired, moved}
"#;

pub struct RedisTaskQueue {
    redis: SharedConnectionManager,
    ready_key: String,
    inflight_key: String,
    delayed_key: String,
    dead_key: String,
    leases_key: String,
    poll_interval: Duration,
    lease: Duration,
    reserve_script: Script,
    move_script: Script,
    reclaim_script: Script,
}

impl RedisTaskQueue {
    pub fn new(redis: SharedConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            ready_key: format!("{}:ready", namespace),
            inflight_key: format!("{}:inflight", namespace),
            delayed_key: format!("{}:delayed", namespace),
            dead_key: format!("{}:dead", namespace),
            leases_key: format!("{}:leases", namespace),
            poll_interval: Duration::from_millis(200),
            lease: DEFAULT_LEASE,
            reserve_script: Script::new(RESERVE_SCRIPT),
            move_script: Script::new(MOVE_IF_PRESENT_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
        }
    }

    /// How long a reserved job stays with its worker before
    /// [`TaskQueue::reclaim_expired`] may hand it to another
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// How often `reserve` re-checks an empty queue
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_reserve(&self) -> QueueResult<Option<String>> {
        let mut conn = self.redis.lock().await.clone();
        let now_ms = Utc::now().timestamp_millis();

        let raw: Option<String> = self
            .reserve_script
            .key(&self.ready_key)
            .key(&self.inflight_key)
            .key(&self.delayed_key)
            .key(&self.leases_key)
            .arg(now_ms)
            .arg(PROMOTE_BATCH)
            .arg(now_ms + self.lease.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(raw)
    }

    /// Atomically move `from_raw` out of `from` and push `to_raw` onto `to`,
    /// dropping its lease when `from` is the in-flight list.
    async fn move_entry(&self, from: &str, to: &str, from_raw: &str, to_raw: &str) -> QueueResult<bool> {
        let mut invocation = self.move_script.prepare_invoke();
        invocation.key(from).key(to).arg(from_raw).arg(to_raw);
        if from == self.inflight_key {
            invocation.key(&self.leases_key);
        }

        let mut conn = self.redis.lock().await.clone();
        let moved: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(moved == 1)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.redis.lock().await.clone();
        redis::cmd("LPUSH")
            .arg(&self.ready_key)
            .arg(raw)
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(job_id = %job.id, kind = %job.kind, "Job enqueued");
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(raw) = self.try_reserve().await? {
                match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => {
                        return Ok(Some(Delivery { job, receipt: raw }));
                    }
                    Err(e) => {
                        // Unreadable entries can never succeed; park them as-is
                        error!(error = %e, "Malformed job in queue, moving to dead letters");
                        self.move_entry(&self.inflight_key, &self.dead_key, &raw, &raw)
                            .await?;
                        continue;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.redis.lock().await.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.inflight_key)
            .arg(1)
            .arg(&delivery.receipt)
            .cmd("ZREM")
            .arg(&self.leases_key)
            .arg(&delivery.receipt)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            // Lease ran out and another worker holds the job now
            warn!(job_id = %delivery.job.id, "Acked job was not in flight");
            return Err(QueueError::UnknownDelivery(delivery.job.id.to_string()));
        }
        Ok(())
    }

    async fn requeue(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> QueueResult<()> {
        let next = delivery.job.with_failure(error);
        let raw = serde_json::to_string(&next)?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.redis.lock().await.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.inflight_key)
            .arg(1)
            .arg(&delivery.receipt)
            .cmd("ZREM")
            .arg(&self.leases_key)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due_ms)
            .arg(&raw)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            // Lease expired and the job was reclaimed; the retry still stands
            warn!(job_id = %delivery.job.id, "Requeued job was not in flight");
        }
        debug!(
            job_id = %delivery.job.id,
            attempts = next.attempts,
            delay_ms = delay.as_millis() as u64,
            "Job scheduled for retry"
        );
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let dead = delivery.job.with_failure(error);
        let raw = serde_json::to_string(&dead)?;

        if !self
            .move_entry(&self.inflight_key, &self.dead_key, &delivery.receipt, &raw)
            .await?
        {
            warn!(job_id = %delivery.job.id, "Dead-lettered job was not in flight");
            let mut conn = self.redis.lock().await.clone();
            redis::cmd("LPUSH")
                .arg(&self.dead_key)
                .arg(&raw)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.lock().await.clone();
        // Oldest entries sit at the tail
        let raws: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.dead_key)
            .arg(-(limit as i64))
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        Ok(raws
            .iter()
            .rev()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    async fn replay_dead_letters(&self, limit: usize) -> QueueResult<u64> {
        if limit == 0 {
            return Ok(0);
        }
        let raws: Vec<String> = {
            let mut conn = self.redis.lock().await.clone();
            redis::cmd("LRANGE")
                .arg(&self.dead_key)
                .arg(-(limit as i64))
                .arg(-1)
                .query_async(&mut conn)
                .await?
        };

        let mut replayed = 0;
        for raw in raws.iter().rev() {
            let Ok(mut job) = serde_json::from_str::<Job>(raw) else {
                warn!("Skipping unreadable dead letter during replay");
                continue;
            };
            job.attempts = 0;
            let fresh = serde_json::to_string(&job)?;
            if self
                .move_entry(&self.dead_key, &self.ready_key, raw, &fresh)
                .await?
            {
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    async fn reclaim_expired(&self) -> QueueResult<u64> {
        let mut reclaimed = 0;
        loop {
            let now_ms = Utc::now().timestamp_millis();
            let mut conn = self.redis.lock().await.clone();
            let (examined, moved): (i64, u64) = self
                .reclaim_script
                .key(&self.leases_key)
                .key(&self.inflight_key)
                .key(&self.ready_key)
                .arg(now_ms)
                .arg(RECLAIM_BATCH)
                .arg(now_ms + self.lease.as_millis() as i64)
                .invoke_async(&mut conn)
                .await?;

            reclaimed += moved;
            if examined < RECLAIM_BATCH {
                break;
            }
        }

        if reclaimed > 0 {
            warn!(count = reclaimed, "Reclaimed in-flight jobs with expired leases");
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.redis.lock().await.clone();
        let (ready, delayed, in_flight, dead): (u64, u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.ready_key)
            .cmd("ZCARD")
            .arg(&self.delayed_key)
            .cmd("LLEN")
            .arg(&self.inflight_key)
            .cmd("LLEN")
            .arg(&self.dead_key)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            ready,
            delayed,
            in_flight,
            dead,
        })
    }
}
