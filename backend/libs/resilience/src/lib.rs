/// Resilience patterns for the events pipeline
///
/// Provides exponential backoff with jitter for transient failures. The same
/// `RetryConfig` drives in-process retries (`with_retry`) and the delay between
/// redeliveries of queued jobs and outbox entries (`backoff_for_attempt`).
///
/// # Example: Retrying a flaky call
///
/// ```rust,no_run
/// use resilience::{with_retry, RetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = RetryConfig::default();
///
///     let result = with_retry(&config, || async {
///         // Your storage call here
///         Ok::<_, String>(())
///     })
///     .await;
/// }
/// ```
pub mod retry;

pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
