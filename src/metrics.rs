use std::time::Duration;

use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Per-call measurements
// ---------------------------------------------------------------------------

/// Outcome label attached to every completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Stable error-kind label, e.g. `"timeout"` or `"rate_limit"`.
    Error(&'static str),
}

/// One record per provider call, emitted after the call settles.
#[derive(Debug, Clone)]
pub struct CallMetrics {
    pub model: String,
    /// Retries included; a first-try success reports 1.
    pub attempts: u32,
    /// Time spent waiting for a concurrency slot.
    pub queue_wait: Duration,
    /// Wall time from dispatch to settled result, retries included.
    pub duration: Duration,
    pub cache_hit: bool,
    /// Total tokens the provider reported. Zero for cache hits, failures,
    /// and streams, whose usage arrives in-band after this record.
    pub total_tokens: u32,
    pub disposition: Disposition,
}

// ---------------------------------------------------------------------------
// Sink trait and built-in sinks
// ---------------------------------------------------------------------------

/// Receives call measurements. Implementations must be cheap and must not
/// block: the client reports from its hot path.
pub trait MetricsSink: Send + Sync {
    fn record_call(&self, metrics: &CallMetrics);
}

/// Default sink: structured tracing events, one per call.
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_call(&self, metrics: &CallMetrics) {
        match metrics.disposition {
            Disposition::Success => {
                tracing::debug!(
                    model = %metrics.model,
                    attempts = metrics.attempts,
                    queue_wait_ms = metrics.queue_wait.as_millis() as u64,
                    duration_ms = metrics.duration.as_millis() as u64,
                    cache_hit = metrics.cache_hit,
                    total_tokens = metrics.total_tokens,
                    "Provider call succeeded"
                );
            }
            Disposition::Error(kind) => {
                tracing::warn!(
                    model = %metrics.model,
                    attempts = metrics.attempts,
                    duration_ms = metrics.duration.as_millis() as u64,
                    error_kind = kind,
                    "Provider call failed"
                );
            }
        }
    }
}

/// Forwards measurements over an unbounded channel, for callers that
/// aggregate metrics themselves. A dropped receiver turns this into a no-op.
#[derive(Debug, Clone)]
pub struct ChannelMetrics {
    tx: mpsc::UnboundedSender<CallMetrics>,
}

impl ChannelMetrics {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallMetrics>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MetricsSink for ChannelMetrics {
    fn record_call(&self, metrics: &CallMetrics) {
        let _ = self.tx.send(metrics.clone());
    }
}

/// Discards everything. Useful in tests that assert on behavior, not telemetry.
#[derive(Debug, Default, Clone)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_call(&self, _metrics: &CallMetrics) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(disposition: Disposition) -> CallMetrics {
        CallMetrics {
            model: "demo-chat".into(),
            attempts: 2,
            queue_wait: Duration::from_millis(5),
            duration: Duration::from_millis(120),
            cache_hit: false,
            total_tokens: 15,
            disposition,
        }
    }

    #[test]
    fn test_channel_metrics_delivers() {
        let (sink, mut rx) = ChannelMetrics::new();
        sink.record_call(&sample(Disposition::Success));
        sink.record_call(&sample(Disposition::Error("timeout")));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.attempts, 2);
        assert_eq!(first.total_tokens, 15);
        assert_eq!(first.disposition, Disposition::Success);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.disposition, Disposition::Error("timeout"));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_metrics_survives_dropped_receiver() {
        let (sink, rx) = ChannelMetrics::new();
        drop(rx);
        sink.record_call(&sample(Disposition::Success));
    }

    #[test]
    fn test_noop_and_tracing_sinks() {
        NoopMetrics.record_call(&sample(Disposition::Success));
        TracingMetrics.record_call(&sample(Disposition::Error("network")));
    }
}
