use std::future::Future;
use std::time::Duration;

use super::ApiError;
use crate::config::ClientConfig;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff with a hard attempt ceiling. A provider-supplied
/// retry-after takes precedence over the computed delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    #[cfg(test)]
    pub fn with_delays(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (zero-based). None means stop: the error is not retryable or the
    /// retry budget is spent.
    pub fn next_delay(&self, attempt: u32, error: &ApiError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_retries {
            return None;
        }
        if let ApiError::RateLimit {
            retry_after: Some(wait),
        } = error
        {
            return Some((*wait).min(self.max_delay));
        }
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        Some(backoff.min(self.max_delay))
    }
}

/// Run an operation, retrying per the policy. The closure receives the
/// zero-based attempt index.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let Some(delay) = policy.next_delay(attempt, &e) else {
                    return Err(e);
                };
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Provider call failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::client::timeout::TimeoutPhase;

    fn server_error() -> ApiError {
        ApiError::ServerError {
            status: 503,
            message: "upstream unavailable".into(),
        }
    }

    #[test]
    fn test_backoff_schedule_doubles_from_base() {
        let policy = RetryPolicy::with_delays(
            3,
            Duration::from_millis(100),
            Duration::from_millis(350),
        );
        let e = server_error();
        assert_eq!(policy.next_delay(0, &e), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(1, &e), Some(Duration::from_millis(200)));
        // Capped by the maximum delay.
        assert_eq!(policy.next_delay(2, &e), Some(Duration::from_millis(350)));
        // Retry budget spent.
        assert_eq!(policy.next_delay(3, &e), None);
    }

    #[test]
    fn test_non_retryable_errors_get_no_delay() {
        let policy =
            RetryPolicy::with_delays(3, Duration::from_millis(100), Duration::from_secs(30));
        for error in [
            ApiError::InvalidCredential,
            ApiError::ClientError {
                status: 400,
                message: "bad".into(),
            },
            ApiError::Unknown("?".into()),
        ] {
            assert_eq!(policy.next_delay(0, &error), None, "{error}");
        }
    }

    #[test]
    fn test_retryable_taxonomy() {
        let policy =
            RetryPolicy::with_delays(3, Duration::from_millis(10), Duration::from_secs(30));
        for error in [
            ApiError::Network("reset".into()),
            ApiError::Timeout {
                phase: TimeoutPhase::FirstByte,
            },
            ApiError::RateLimit { retry_after: None },
            server_error(),
        ] {
            assert!(policy.next_delay(0, &error).is_some(), "{error}");
        }
    }

    #[test]
    fn test_provider_retry_after_takes_precedence() {
        let policy =
            RetryPolicy::with_delays(3, Duration::from_millis(500), Duration::from_secs(30));
        let e = ApiError::RateLimit {
            retry_after: Some(Duration::from_millis(20)),
        };
        assert_eq!(policy.next_delay(0, &e), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_delay(2, &e), Some(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_is_immediate() {
        let policy =
            RetryPolicy::with_delays(3, Duration::from_millis(200), Duration::from_secs(30));
        let start = Instant::now();
        let result: Result<u32, ApiError> = with_retry(&policy, |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_server_error_succeeds_on_second_attempt_with_one_backoff() {
        let policy =
            RetryPolicy::with_delays(2, Duration::from_millis(50), Duration::from_secs(30));
        let attempts = Arc::new(AtomicU32::new(0));

        let start = Instant::now();
        let counter = Arc::clone(&attempts);
        let result = with_retry(&policy, move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(server_error())
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        let elapsed = start.elapsed();

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // Exactly one base delay, not two.
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_error() {
        let policy =
            RetryPolicy::with_delays(2, Duration::from_millis(10), Duration::from_secs(30));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let result: Result<(), ApiError> = with_retry(&policy, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(server_error()) }
        })
        .await;

        assert!(matches!(
            result,
            Err(ApiError::ServerError { status: 503, .. })
        ));
        // Two retries on top of the first attempt.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_without_waiting() {
        let policy =
            RetryPolicy::with_delays(3, Duration::from_millis(200), Duration::from_secs(30));
        let attempts = Arc::new(AtomicU32::new(0));

        let start = Instant::now();
        let counter = Arc::clone(&attempts);
        let result: Result<(), ApiError> = with_retry(&policy, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::InvalidCredential) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::InvalidCredential)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
