//! Fixed-window rate limiter for the ingestion endpoint.
//!
//! One counter per `(client, minute)`: `rate_limit:{client}:{unix_minute}`.
//! A client can push up to twice the limit through across a window boundary.
//! Counter store errors and timeouts let the request through.

use async_trait::async_trait;
use redis_utils::{fixed_window_incr, SharedConnectionManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::clock::Clock;

pub const WINDOW: Duration = Duration::from_secs(60);

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, starting a window of `window` on first hit, and
    /// return the new count.
    async fn incr_window(&self, key: &str, window: Duration) -> anyhow::Result<u64>;
}

pub struct RedisCounterStore {
    manager: SharedConnectionManager,
}

impl RedisCounterStore {
    pub fn new(manager: SharedConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> anyhow::Result<u64> {
        fixed_window_incr(&self.manager, key, window.as_secs()).await
    }
}

/// Process-local counters. Keys never expire; the minute bucket in the key
/// already separates windows.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_window(&self, key: &str, _window: Duration) -> anyhow::Result<u64> {
        let mut counters = self.counters.lock().await;
        let count = counters.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: u64 },
    Limited { count: u64 },
    /// Counter store unavailable; request let through
    FailedOpen,
}

impl RateDecision {
    pub fn is_limited(&self) -> bool {
        matches!(self, RateDecision::Limited { .. })
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    limit: u64,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        limit: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limit,
            timeout,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn key_for(client: &str, unix_seconds: i64) -> String {
        let minute = unix_seconds.div_euclid(WINDOW.as_secs() as i64);
        format!("rate_limit:{}:{}", client, minute)
    }

    pub async fn check(&self, client: &str) -> RateDecision {
        let key = Self::key_for(client, self.clock.now().timestamp());

        match timeout(self.timeout, self.store.incr_window(&key, WINDOW)).await {
            Ok(Ok(count)) if count > self.limit => RateDecision::Limited { count },
            Ok(Ok(count)) => RateDecision::Allowed { count },
            Ok(Err(e)) => {
                warn!(client = %client, error = %e, "Rate limit store error, allowing request");
                RateDecision::FailedOpen
            }
            Err(_) => {
                warn!(
                    client = %client,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Rate limit store timed out, allowing request"
                );
                RateDecision::FailedOpen
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::{TimeZone, Utc};

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr_window(&self, _key: &str, _window: Duration) -> anyhow::Result<u64> {
            anyhow::bail!("connection refused")
        }
    }

    struct SlowStore;

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn incr_window(&self, _key: &str, _window: Duration) -> anyhow::Result<u64> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }
    }

    fn limiter(store: Arc<dyn CounterStore>, clock: &MockClock, limit: u64) -> RateLimiter {
        RateLimiter::new(store, Arc::new(clock.clone()), limit, Duration::from_millis(100))
    }

    fn mid_minute() -> MockClock {
        MockClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 30).unwrap())
    }

    #[test]
    fn test_key_uses_minute_bucket() {
        assert_eq!(RateLimiter::key_for("10.0.0.1", 1_736_942_430), "rate_limit:10.0.0.1:28949040");
        assert_eq!(
            RateLimiter::key_for("c", 119),
            RateLimiter::key_for("c", 60)
        );
        assert_ne!(RateLimiter::key_for("c", 119), RateLimiter::key_for("c", 120));
    }

    #[tokio::test]
    async fn test_limit_plus_one_is_rejected() {
        let clock = mid_minute();
        let limiter = limiter(Arc::new(MemoryCounterStore::new()), &clock, 5);

        for i in 1..=5 {
            assert_eq!(limiter.check("a").await, RateDecision::Allowed { count: i });
        }
        assert_eq!(limiter.check("a").await, RateDecision::Limited { count: 6 });
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let clock = mid_minute();
        let limiter = limiter(Arc::new(MemoryCounterStore::new()), &clock, 2);

        limiter.check("a").await;
        limiter.check("a").await;
        assert!(limiter.check("a").await.is_limited());
        assert!(!limiter.check("b").await.is_limited());
    }

    #[tokio::test]
    async fn test_new_window_resets_counter() {
        let clock = mid_minute();
        let limiter = limiter(Arc::new(MemoryCounterStore::new()), &clock, 2);

        for _ in 0..3 {
            limiter.check("a").await;
        }
        assert!(limiter.check("a").await.is_limited());

        clock.advance(chrono::Duration::seconds(60));
        assert!(!limiter.check("a").await.is_limited());
    }

    #[tokio::test]
    async fn test_boundary_burst_allows_twice_the_limit() {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 59).unwrap());
        let limiter = limiter(Arc::new(MemoryCounterStore::new()), &clock, 10);

        let mut passed = 0;
        for _ in 0..10 {
            if !limiter.check("a").await.is_limited() {
                passed += 1;
            }
        }
        clock.advance(chrono::Duration::seconds(1));
        for _ in 0..10 {
            if !limiter.check("a").await.is_limited() {
                passed += 1;
            }
        }

        assert_eq!(passed, 20);
        assert!(limiter.check("a").await.is_limited());
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let clock = mid_minute();
        let limiter = limiter(Arc::new(BrokenStore), &clock, 1);
        assert_eq!(limiter.check("a").await, RateDecision::FailedOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_fails_open() {
        let clock = mid_minute();
        let limiter = limiter(Arc::new(SlowStore), &clock, 1);
        assert_eq!(limiter.check("a").await, RateDecision::FailedOpen);
    }
}
