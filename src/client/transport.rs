//! HTTP transport for OpenAI-style chat completion endpoints.
//!
//! Handles request serialization, status-to-error mapping, and SSE byte
//! parsing with partial line buffering across TCP chunks. Phase timeouts are
//! applied here: the first-byte deadline around the initial send, the idle
//! deadline around every subsequent chunk.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::client::timeout::{guard_stream, TimeoutPhase, TimeoutProfile};
use crate::client::ApiError;
use crate::config::ProviderConfig;
use crate::types::{ChatResponse, Message, StreamEvent, Usage};

/// Streaming response half: deltas as they arrive, errors in-band.
pub type EventStream = BoxStream<'static, Result<StreamEvent, ApiError>>;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// One fully-resolved provider call, with generation parameters already
/// merged and timeouts chosen for the call's phase.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub timeouts: TimeoutProfile,
}

/// Provider call surface. The resilient client layers caching, queueing and
/// retry on top of this; tests substitute their own implementation.
pub trait Transport: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, ApiError>> + Send + 'a>>;

    fn complete_stream<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, ApiError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    completion_tokens_details: Option<WireTokenDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct WireTokenDetails {
    #[serde(default)]
    reasoning_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    message: String,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        let total = if self.total_tokens == 0 {
            self.prompt_tokens + self.completion_tokens
        } else {
            self.total_tokens
        };
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: total,
            reasoning_tokens: self
                .completion_tokens_details
                .and_then(|d| d.reasoning_tokens),
        }
    }
}

impl WireCompletion {
    fn into_response(self) -> Result<ChatResponse, ApiError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Unknown("completion had no choices".to_string()))?;
        Ok(ChatResponse {
            id: self.id,
            model: self.model,
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            usage: self.usage.map(WireUsage::into_usage).unwrap_or_default(),
        })
    }
}

impl WireStreamChunk {
    /// Convert a parsed chunk into a delivered event. Keepalive chunks that
    /// carry nothing are dropped.
    fn into_event(self) -> Option<StreamEvent> {
        let (content_delta, finish_reason) = match self.choices.into_iter().next() {
            Some(choice) => (choice.delta.content, choice.finish_reason),
            None => (None, None),
        };
        let usage = self.usage.map(WireUsage::into_usage);
        if content_delta.is_none() && finish_reason.is_none() && usage.is_none() {
            return None;
        }
        Some(StreamEvent {
            content_delta,
            finish_reason,
            usage,
        })
    }
}

/// Pull a human-readable message out of an error response body. Providers
/// wrap it as `{"error": {"message": ...}}`; anything else is passed through.
fn parse_error_message(body: String) -> String {
    match serde_json::from_str::<WireErrorBody>(&body) {
        Ok(parsed) if !parsed.error.message.is_empty() => parsed.error.message,
        _ => body,
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Transport over an OpenAI-compatible `/v1/chat/completions` endpoint.
///
/// Deliberately built without a whole-request timeout: long generations are
/// legitimate, stalls are caught per phase instead.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(provider: &ProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: provider.base_url.clone(),
            api_key: provider.api_key.clone(),
        })
    }

    /// Send the request and surface non-success statuses as typed errors.
    /// The first-byte deadline covers everything up to response headers.
    async fn send_checked(
        &self,
        request: &TransportRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stream,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = tokio::time::timeout(request.timeouts.first_byte, req.send())
            .await
            .map_err(|_| ApiError::Timeout {
                phase: TimeoutPhase::FirstByte,
            })?
            .map_err(ApiError::from_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(
                code,
                parse_error_message(body),
                retry_after,
            ));
        }

        Ok(resp)
    }
}

impl Transport for HttpTransport {
    fn complete<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, ApiError>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self.send_checked(request, false).await?;

            let bytes = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| ApiError::Network(format!("body read failed: {e}"))))
                .boxed();
            let mut guarded = guard_stream(bytes, request.timeouts.stream_idle);

            let mut body = Vec::new();
            while let Some(chunk) = guarded.next().await {
                body.extend_from_slice(&chunk?);
            }

            let completion: WireCompletion = serde_json::from_slice(&body)
                .map_err(|e| ApiError::Unknown(format!("unparseable completion body: {e}")))?;
            completion.into_response()
        })
    }

    fn complete_stream<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, ApiError>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self.send_checked(request, true).await?;

            let bytes = resp
                .bytes_stream()
                .map(|chunk| {
                    chunk.map_err(|e| ApiError::Network(format!("stream read failed: {e}")))
                })
                .boxed();
            let guarded = guard_stream(bytes, request.timeouts.stream_idle);

            Ok(SseEventStream::new(guarded).boxed())
        })
    }
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

/// SSE byte stream decoded into [`StreamEvent`]s.
///
/// Buffers raw bytes across chunk boundaries and decodes only complete
/// lines, so a multibyte character split by the network arrives intact.
/// Strips the `data:` prefix, stops at the `[DONE]` sentinel, and skips
/// comments, `event:` lines and unparseable payloads.
struct SseEventStream {
    source: Option<BoxStream<'static, Result<bytes::Bytes, ApiError>>>,
    buffer: bytes::BytesMut,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl SseEventStream {
    fn new(source: BoxStream<'static, Result<bytes::Bytes, ApiError>>) -> Self {
        Self {
            source: Some(source),
            buffer: bytes::BytesMut::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn drain_buffer(&mut self) {
        // A UTF-8 sequence never contains a newline byte, so splitting on
        // complete lines cannot cut a character in half.
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim_end_matches(['\n', '\r']));
            if self.done {
                return;
            }
        }
    }

    /// Trailing data without a final newline still counts when the source
    /// ends.
    fn flush_remainder(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        let line = rest.trim();
        if !line.is_empty() && !self.done {
            self.handle_line(line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();

        if data == "[DONE]" {
            self.done = true;
            return;
        }

        match serde_json::from_str::<WireStreamChunk>(data) {
            Ok(chunk) => {
                if let Some(event) = chunk.into_event() {
                    self.pending.push_back(event);
                }
            }
            Err(e) => {
                tracing::debug!(data, error = %e, "Skipping unparseable stream line");
            }
        }
    }
}

impl Stream for SseEventStream {
    type Item = Result<StreamEvent, ApiError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };
            match source.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    this.drain_buffer();
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    this.source = None;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.source = None;
                    this.flush_remainder();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
