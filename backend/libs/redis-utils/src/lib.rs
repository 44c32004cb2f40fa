use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, IntoConnectionInfo};
use resilience::{with_retry, RetryConfig};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Redis connection pool.
///
/// `ConnectionManager` reconnects on its own after the first successful
/// connection; `connect` only has to get through startup, where Redis may
/// still be coming up alongside the service.
pub struct RedisPool {
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str, retry: &RetryConfig) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let client = Client::open(info).context("failed to construct Redis client")?;

        let mut manager = with_retry(retry, || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await
        .map_err(|e| e.into_inner())
        .context("failed to initialize Redis connection manager")?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .context("Redis PING failed after connect")?;
        info!(response = %pong, "Connected to Redis");

        Ok(Self {
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }
}

/// Round-trips a PING for health checks.
pub async fn ping(manager: &SharedConnectionManager) -> Result<()> {
    let mut conn = manager.lock().await.clone();
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("Redis PING failed")?;
    Ok(())
}

/// Increment a fixed-window counter and return the new count.
///
/// The expiry is set only when this call created the key, so the window
/// closes `window_secs` after its first hit rather than sliding forward.
pub async fn fixed_window_incr(
    manager: &SharedConnectionManager,
    key: &str,
    window_secs: u64,
) -> Result<u64> {
    // Clone the handle so the mutex is not held across network round trips
    let mut conn = manager.lock().await.clone();

    let count: u64 = conn
        .incr(key, 1u64)
        .await
        .with_context(|| format!("Redis INCR failed for {}", key))?;

    if count == 1 {
        let expired: redis::RedisResult<()> = conn.expire(key, window_secs as i64).await;
        if let Err(e) = expired {
            // Key would never expire; drop it so the next hit recreates it
            warn!(key = %key, error = %e, "Redis EXPIRE failed, deleting counter");
            let _: redis::RedisResult<()> = conn.del(key).await;
            return Err(e).context("Redis EXPIRE failed");
        }
    }

    Ok(count)
}

/// Strip credentials from a Redis URL before logging it.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
