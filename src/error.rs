//! Crate-surface error type.
//!
//! Budget denials are NOT errors; they come back as a typed outcome from the
//! governor (see [`crate::governor::CallOutcome`]). Errors are reserved for
//! malformed input and provider failures, and each carries enough shape for
//! a caller to decide whether to retry.

use std::time::Duration;

use crate::client::ApiError;

/// Error returned by the governor's entry points.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    /// The inbound request failed validation before any work was done.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The provider call failed after the retry budget was spent (or the
    /// error was not retryable).
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl GovernorError {
    /// Whether retrying the same request later could succeed.
    pub fn retry_hint(&self) -> bool {
        match self {
            Self::InvalidRequest(_) => false,
            Self::Api(e) => e.is_retryable(),
        }
    }

    /// Suggested wait before retrying, when the provider told us one.
    pub fn suggested_wait(&self) -> Option<Duration> {
        match self {
            Self::Api(ApiError::RateLimit { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_not_retryable() {
        let err = GovernorError::InvalidRequest("missing model".into());
        assert!(!err.retry_hint());
        assert!(err.suggested_wait().is_none());
        assert_eq!(err.to_string(), "invalid request: missing model");
    }

    #[test]
    fn test_rate_limit_carries_wait() {
        let err = GovernorError::Api(ApiError::RateLimit {
            retry_after: Some(Duration::from_secs(7)),
        });
        assert!(err.retry_hint());
        assert_eq!(err.suggested_wait(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_client_error_not_retryable() {
        let err = GovernorError::Api(ApiError::ClientError {
            status: 400,
            message: "bad request".into(),
        });
        assert!(!err.retry_hint());
        assert!(err.suggested_wait().is_none());
    }
}
