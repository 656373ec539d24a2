use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;

use super::ApiError;
use crate::capability::CapabilityRecord;

// ---------------------------------------------------------------------------
// Phases and profiles
// ---------------------------------------------------------------------------

/// Which wait a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for the provider's first response byte.
    FirstByte,
    /// Waiting for the next chunk of an open response.
    StreamIdle,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstByte => write!(f, "the first response byte"),
            Self::StreamIdle => write!(f, "the next stream chunk"),
        }
    }
}

/// Call position within a governed request. Continuation segments resume an
/// interrupted answer and get a longer initial budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Initial,
    Continuation,
}

const STANDARD_FIRST_BYTE: Duration = Duration::from_secs(30);
const STANDARD_STREAM_IDLE: Duration = Duration::from_secs(15);
// Reasoning-class models burn wall time before the first visible token.
const REASONING_FIRST_BYTE: Duration = Duration::from_secs(120);
const REASONING_STREAM_IDLE: Duration = Duration::from_secs(60);

const CONTINUATION_FIRST_BYTE_FACTOR: u32 = 2;
const LONG_OUTPUT_GUARD_FACTOR: u32 = 2;

/// Timeout magnitudes for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutProfile {
    /// Bounds the wait for response headers.
    pub first_byte: Duration,
    /// Bounds each gap between body chunks, reset on every chunk.
    pub stream_idle: Duration,
}

impl TimeoutProfile {
    /// Magnitudes for a call: per model class, adjusted for the call phase,
    /// and scaled up when the long-output guard is on.
    pub fn for_call(capability: &CapabilityRecord, phase: CallPhase, long_output_guard: bool) -> Self {
        let (mut first_byte, mut stream_idle) = if capability.supports_reasoning {
            (REASONING_FIRST_BYTE, REASONING_STREAM_IDLE)
        } else {
            (STANDARD_FIRST_BYTE, STANDARD_STREAM_IDLE)
        };
        if phase == CallPhase::Continuation {
            first_byte *= CONTINUATION_FIRST_BYTE_FACTOR;
        }
        if long_output_guard {
            first_byte *= LONG_OUTPUT_GUARD_FACTOR;
            stream_idle *= LONG_OUTPUT_GUARD_FACTOR;
        }
        Self {
            first_byte,
            stream_idle,
        }
    }
}

// ---------------------------------------------------------------------------
// Inter-chunk guard
// ---------------------------------------------------------------------------

/// Bound the gap between items of a stream. The clock resets on every item;
/// a stalled-but-open stream yields one `Timeout` error and then ends.
pub fn guard_stream<T: Send + 'static>(
    stream: BoxStream<'static, Result<T, ApiError>>,
    idle: Duration,
) -> BoxStream<'static, Result<T, ApiError>> {
    tokio_stream::StreamExt::timeout(stream, idle)
        .map(|item| match item {
            Ok(inner) => inner,
            Err(_elapsed) => Err(ApiError::Timeout {
                phase: TimeoutPhase::StreamIdle,
            }),
        })
        .scan(false, |errored, item| {
            let stop = *errored;
            *errored = item.is_err();
            futures::future::ready(if stop { None } else { Some(item) })
        })
        .boxed()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;

    use super::*;
    use crate::capability::{Pricing, Provenance, RateLimit};

    fn capability(supports_reasoning: bool) -> CapabilityRecord {
        CapabilityRecord {
            model_id: "demo-chat".into(),
            context_window_tokens: 8_192,
            max_output_tokens_per_request: 2_048,
            supports_reasoning,
            rate_limit: RateLimit {
                requests_per_second: 10.0,
                tokens_per_minute: 100_000,
            },
            pricing: Pricing {
                input_per_1k: 0.001,
                output_per_1k: 0.002,
                reasoning_per_1k: 0.0,
            },
            last_updated_at: Utc::now(),
            provenance: Provenance::Fallback,
        }
    }

    #[test]
    fn test_standard_profile() {
        let profile = TimeoutProfile::for_call(&capability(false), CallPhase::Initial, false);
        assert_eq!(profile.first_byte, Duration::from_secs(30));
        assert_eq!(profile.stream_idle, Duration::from_secs(15));
    }

    #[test]
    fn test_reasoning_models_get_longer_budgets() {
        let standard = TimeoutProfile::for_call(&capability(false), CallPhase::Initial, false);
        let reasoning = TimeoutProfile::for_call(&capability(true), CallPhase::Initial, false);
        assert!(reasoning.first_byte > standard.first_byte);
        assert!(reasoning.stream_idle > standard.stream_idle);
    }

    #[test]
    fn test_continuation_lengthens_only_first_byte() {
        let initial = TimeoutProfile::for_call(&capability(false), CallPhase::Initial, false);
        let cont = TimeoutProfile::for_call(&capability(false), CallPhase::Continuation, false);
        assert_eq!(cont.first_byte, initial.first_byte * 2);
        assert_eq!(cont.stream_idle, initial.stream_idle);
    }

    #[test]
    fn test_long_output_guard_scales_everything() {
        let off = TimeoutProfile::for_call(&capability(true), CallPhase::Initial, false);
        let on = TimeoutProfile::for_call(&capability(true), CallPhase::Initial, true);
        assert_eq!(on.first_byte, off.first_byte * 2);
        assert_eq!(on.stream_idle, off.stream_idle * 2);
    }

    #[tokio::test]
    async fn test_guarded_stream_passes_items_through() {
        let source = futures::stream::iter(vec![Ok(1u32), Ok(2), Ok(3)]).boxed();
        let items: Vec<_> = guard_stream(source, Duration::from_secs(1)).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.is_ok()));
    }

    #[tokio::test]
    async fn test_stalled_stream_aborts_with_timeout() {
        // One chunk arrives, then the stream stays open but silent.
        let source = futures::stream::iter(vec![Ok(1u32)])
            .chain(futures::stream::pending())
            .boxed();

        let start = Instant::now();
        let items: Vec<_> = guard_stream(source, Duration::from_millis(50))
            .collect()
            .await;
        let elapsed = start.elapsed();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(1));
        assert!(matches!(
            items[1],
            Err(ApiError::Timeout {
                phase: TimeoutPhase::StreamIdle
            })
        ));
        // Aborted promptly after the idle window, and the stream terminated.
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_idle_clock_resets_per_chunk() {
        // Three chunks, each 30ms apart, against a 50ms idle limit: the gap
        // never exceeds the limit even though the total does.
        let source = futures::stream::unfold(0u32, |n| async move {
            if n < 3 {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Some((Ok(n), n + 1))
            } else {
                None
            }
        })
        .boxed();

        let items: Vec<_> = guard_stream(source, Duration::from_millis(50))
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.is_ok()));
    }
}
