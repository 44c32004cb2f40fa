/// Retry policy with exponential backoff and jitter
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single backoff
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay to wait before retry number `attempt` (1-based).
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`,
    /// then jittered if enabled.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_backoff.as_millis() as f64);
        apply_jitter(Duration::from_millis(capped_ms as u64), self.jitter)
    }

    /// Whether a job that has already failed `failures` times may run again.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Max retries ({retries}) exceeded: {last_error}")]
    MaxRetriesExceeded { retries: u32, last_error: E },
    #[error("Operation failed: {0}")]
    NotRetryable(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { last_error, .. } => last_error,
            RetryError::NotRetryable(e) => e,
        }
    }
}

/// Execute a future with retry logic, retrying every error
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, f, |_| true).await
}

/// Execute a future with retry logic; errors rejected by `should_retry` fail immediately
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut f: F,
    should_retry: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(RetryError::NotRetryable(e));
                }

                attempt += 1;

                if attempt > config.max_retries {
                    warn!(error = %e, "Max retries ({}) reached", config.max_retries);
                    return Err(RetryError::MaxRetriesExceeded {
                        retries: config.max_retries,
                        last_error: e,
                    });
                }

                let delay = config.backoff_for_attempt(attempt);

                warn!(
                    error = %e,
                    "Retry attempt {}/{}, waiting {:?}",
                    attempt, config.max_retries, delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-0.3..0.3); // ±30%
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}
