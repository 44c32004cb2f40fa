//! Integration tests for the Redis-backed queue
//!
//! Prerequisites:
//! - Redis running locally or via Docker
//! - Environment variable: REDIS_URL
//!
//! Run tests:
//! ```bash
//! export REDIS_URL="redis://127.0.0.1:6379"
//! cargo test --package task-queue --test redis_queue_test -- --ignored --nocapture
//! ```

use redis_utils::RedisPool;
use resilience::RetryConfig;
use serde_json::json;
use std::time::Duration;
use task_queue::{Job, RedisTaskQueue, TaskQueue};
use uuid::Uuid;

async fn test_queue() -> RedisTaskQueue {
    test_queue_with_lease(task_queue::DEFAULT_LEASE).await
}

async fn test_queue_with_lease(lease: Duration) -> RedisTaskQueue {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    let pool = RedisPool::connect(&url, &RetryConfig::default())
        .await
        .expect("Failed to connect to Redis");
    // Fresh namespace per test so runs never see each other's jobs
    RedisTaskQueue::new(pool.manager(), &format!("test:queue:{}", Uuid::new_v4()))
        .with_poll_interval(Duration::from_millis(20))
        .with_lease(lease)
}

#[ignore = "Requires Redis"]
#[tokio::test]
async fn test_enqueue_reserve_ack() {
    let queue = test_queue().await;
    let job = Job::new("ingest", json!({"events": [1, 2]}));
    queue.enqueue(&job).await.unwrap();

    let delivery = queue
        .reserve(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.job, job);
    assert_eq!(queue.stats().await.unwrap().in_flight, 1);

    queue.ack(&delivery).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.ready, 0);
}

#[ignore = "Requires Redis"]
#[tokio::test]
async fn test_requeue_promotes_after_delay() {
    let queue = test_queue().await;
    queue.enqueue(&Job::new("ingest", json!({}))).await.unwrap();

    let delivery = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
    queue
        .requeue(&delivery, Duration::from_millis(200), "timeout")
        .await
        .unwrap();
    assert_eq!(queue.stats().await.unwrap().delayed, 1);
    assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());

    let retried = queue
        .reserve(Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.job.id, delivery.job.id);
    assert_eq!(retried.job.attempts, 1);
    queue.ack(&retried).await.unwrap();
}

#[ignore = "Requires Redis"]
#[tokio::test]
async fn test_dead_letter_and_replay() {
    let queue = test_queue().await;
    queue.enqueue(&Job::new("import", json!({"chunk": 0}))).await.unwrap();

    let delivery = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
    queue.dead_letter(&delivery, "bad chunk").await.unwrap();

    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("bad chunk"));

    assert_eq!(queue.replay_dead_letters(10).await.unwrap(), 1);
    let replayed = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(replayed.job.attempts, 0);
    queue.ack(&replayed).await.unwrap();
}

#[ignore = "Requires Redis"]
#[tokio::test]
async fn test_reclaim_only_takes_expired_leases() {
    let queue = test_queue_with_lease(Duration::from_millis(500)).await;
    queue.enqueue(&Job::new("ingest", json!({"n": 1}))).await.unwrap();
    let abandoned = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

    // Nothing has expired yet
    assert_eq!(queue.reclaim_expired().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    queue.enqueue(&Job::new("ingest", json!({"n": 2}))).await.unwrap();
    let live = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.in_flight, 1);

    queue.ack(&live).await.unwrap();
    assert!(queue.ack(&abandoned).await.is_err());

    let redelivered = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(redelivered.job.id, abandoned.job.id);
    queue.ack(&redelivered).await.unwrap();
    assert_eq!(queue.reclaim_expired().await.unwrap(), 0);
    assert_eq!(queue.stats().await.unwrap(), Default::default());
}
