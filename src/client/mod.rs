//! Resilient provider client: caching, admission queueing, retry and
//! phase-aware timeouts wrapped around a [`Transport`].
//!
//! The client is deliberately ignorant of budgets and planning; it takes a
//! fully-resolved call and makes it land. Everything above it (the governor)
//! decides whether the call should happen at all.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use thiserror::Error;

pub mod cache;
pub mod queue;
pub mod retry;
pub mod timeout;
pub mod transport;

pub use cache::{CacheStats, ResponseCache};
pub use queue::Priority;
pub use timeout::{CallPhase, TimeoutPhase, TimeoutProfile};
pub use transport::{EventStream, HttpTransport, Transport, TransportRequest};

use crate::capability::CapabilityRecord;
use crate::config::ClientConfig;
use crate::metrics::{CallMetrics, Disposition, MetricsSink};
use crate::types::{ChatResponse, Message, Usage};

use cache::cache_key;
use queue::SlotQueue;
use retry::{with_retry, RetryPolicy};

/// Temperature assumed when the caller leaves it unset, matching provider
/// defaults. Cache keys use it so "unset" and "explicit default" collide.
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classified provider failure. Retry decisions key off the variant, never
/// off message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Connection-level failure before any response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// A phase deadline elapsed.
    #[error("timed out waiting for {phase}")]
    Timeout { phase: TimeoutPhase },

    /// Provider throttled us; honor `retry_after` when present.
    #[error("rate limited by provider")]
    RateLimit { retry_after: Option<Duration> },

    /// Authentication was rejected. Retrying cannot help.
    #[error("invalid or missing credentials")]
    InvalidCredential,

    /// Remaining 4xx statuses: the request itself is defective.
    #[error("client error {status}: {message}")]
    ClientError { status: u16, message: String },

    /// 5xx statuses: the provider is unwell, retrying may help.
    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Anything that defied classification.
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Transient failures worth retrying. Client errors and bad credentials
    /// are deterministic and excluded.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_)
                | ApiError::Timeout { .. }
                | ApiError::RateLimit { .. }
                | ApiError::ServerError { .. }
        )
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "network",
            ApiError::Timeout { .. } => "timeout",
            ApiError::RateLimit { .. } => "rate_limit",
            ApiError::InvalidCredential => "invalid_credential",
            ApiError::ClientError { .. } => "client_error",
            ApiError::ServerError { .. } => "server_error",
            ApiError::Unknown(_) => "unknown",
        }
    }

    /// Classify an HTTP status, carrying the provider's Retry-After along
    /// for 429s.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ApiError::RateLimit { retry_after },
            401 | 403 => ApiError::InvalidCredential,
            408 => ApiError::Timeout {
                phase: TimeoutPhase::FirstByte,
            },
            400..=499 => ApiError::ClientError { status, message },
            500..=599 => ApiError::ServerError { status, message },
            _ => ApiError::Unknown(format!("status {status}: {message}")),
        }
    }

    /// Classify a transport-level failure from the HTTP stack.
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout {
                phase: TimeoutPhase::FirstByte,
            }
        } else if e.is_connect() {
            ApiError::Network(e.to_string())
        } else {
            ApiError::Unknown(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Call options
// ---------------------------------------------------------------------------

/// Per-call knobs the governor resolves before dispatch.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub priority: Priority,
    pub phase: CallPhase,
}

/// Settled buffered call. Spend accounting needs to know whether the
/// provider was actually reached, so the result says how it was produced.
#[derive(Debug)]
pub struct ExecutedCall {
    pub response: ChatResponse,
    /// Served from the response cache without touching the provider.
    pub cache_hit: bool,
}

impl ExecutedCall {
    /// Usage to settle against the ledger. A cached answer cost nothing
    /// upstream and settles to zero instead of re-booking the original
    /// call's tokens.
    pub fn billable_usage(&self) -> Usage {
        if self.cache_hit {
            Usage::default()
        } else {
            self.response.usage
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Provider client with the reliability layers stacked in a fixed order:
/// cache lookup, slot admission, retry loop, transport. Cloning shares the
/// cache, queue and metrics sink.
#[derive(Clone)]
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    cache: Option<ResponseCache>,
    queue: SlotQueue,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
    long_output_guard: bool,
}

impl ResilientClient {
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            transport,
            cache: config
                .cache_enabled
                .then(|| ResponseCache::new(config.cache_capacity, config.cache_ttl())),
            queue: SlotQueue::new(config.max_concurrent),
            retry: RetryPolicy::new(config),
            metrics,
            long_output_guard: config.long_output_guard,
        }
    }

    fn transport_request(
        &self,
        capability: &CapabilityRecord,
        messages: Vec<Message>,
        options: &CallOptions,
    ) -> TransportRequest {
        TransportRequest {
            model: capability.model_id.clone(),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            timeouts: TimeoutProfile::for_call(capability, options.phase, self.long_output_guard),
        }
    }

    fn report(
        &self,
        capability: &CapabilityRecord,
        attempts: u32,
        queue_wait: Duration,
        started: Instant,
        cache_hit: bool,
        total_tokens: u32,
        disposition: Disposition,
    ) {
        self.metrics.record_call(&CallMetrics {
            model: capability.model_id.clone(),
            attempts,
            queue_wait,
            duration: started.elapsed(),
            cache_hit,
            total_tokens,
            disposition,
        });
    }

    /// Buffered completion. Identical calls within the cache TTL are served
    /// from memory without touching the provider.
    pub async fn execute(
        &self,
        capability: &CapabilityRecord,
        messages: Vec<Message>,
        options: &CallOptions,
    ) -> Result<ExecutedCall, ApiError> {
        let started = Instant::now();
        let temperature = options.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let key = self
            .cache
            .as_ref()
            .map(|_| cache_key(&messages, &capability.model_id, temperature));

        if let (Some(cache), Some(key)) = (self.cache.as_ref(), key.as_deref()) {
            if let Some(response) = cache.get(key) {
                tracing::debug!(model = %capability.model_id, "Cache hit, skipping provider call");
                self.report(
                    capability,
                    0,
                    Duration::ZERO,
                    started,
                    true,
                    0,
                    Disposition::Success,
                );
                return Ok(ExecutedCall {
                    response,
                    cache_hit: true,
                });
            }
        }

        let request = self.transport_request(capability, messages, options);

        let queue_started = Instant::now();
        let permit = self.queue.acquire(options.priority).await;
        let queue_wait = queue_started.elapsed();

        let mut attempts = 0u32;
        let result = with_retry(&self.retry, |attempt| {
            attempts = attempt + 1;
            self.transport.complete(&request)
        })
        .await;
        drop(permit);

        match result {
            Ok(response) => {
                if let (Some(cache), Some(key)) = (self.cache.as_ref(), key) {
                    cache.insert(key, response.clone());
                }
                self.report(
                    capability,
                    attempts,
                    queue_wait,
                    started,
                    false,
                    response.usage.total_tokens,
                    Disposition::Success,
                );
                Ok(ExecutedCall {
                    response,
                    cache_hit: false,
                })
            }
            Err(e) => {
                self.report(
                    capability,
                    attempts,
                    queue_wait,
                    started,
                    false,
                    0,
                    Disposition::Error(e.kind()),
                );
                Err(e)
            }
        }
    }

    /// Streaming completion. Streams are never cached; the retry loop covers
    /// connection establishment only, since replaying half-delivered output
    /// would duplicate it. The concurrency slot stays held until the caller
    /// drops the stream.
    pub async fn stream(
        &self,
        capability: &CapabilityRecord,
        messages: Vec<Message>,
        options: &CallOptions,
    ) -> Result<EventStream, ApiError> {
        let started = Instant::now();
        let request = self.transport_request(capability, messages, options);

        let queue_started = Instant::now();
        let permit = self.queue.acquire(options.priority).await;
        let queue_wait = queue_started.elapsed();

        let mut attempts = 0u32;
        let result = with_retry(&self.retry, |attempt| {
            attempts = attempt + 1;
            self.transport.complete_stream(&request)
        })
        .await;

        match result {
            Ok(stream) => {
                self.report(
                    capability,
                    attempts,
                    queue_wait,
                    started,
                    false,
                    0,
                    Disposition::Success,
                );
                // The permit rides inside the stream and is released when
                // the consumer drops it.
                Ok(stream
                    .map(move |item| {
                        let _held = &permit;
                        item
                    })
                    .boxed())
            }
            Err(e) => {
                self.report(
                    capability,
                    attempts,
                    queue_wait,
                    started,
                    false,
                    0,
                    Disposition::Error(e.kind()),
                );
                Err(e)
            }
        }
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(ResponseCache::stats)
    }

    /// Evict expired cache entries. Driven by the governor's maintenance
    /// loop.
    pub fn sweep_cache(&self) {
        if let Some(ref cache) = self.cache {
            cache.sweep();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
