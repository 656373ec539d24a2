//! Request and response types shared across the governor.
//!
//! The inbound [`ChatRequest`] is what application code hands to the
//! governor; the outbound provider wire format lives in private
//! deserialization structs inside `client::transport`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire name as sent to the provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single chat message. Content is always plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound request
// ---------------------------------------------------------------------------

/// A governed completion request.
///
/// Either `prompt` (shorthand for a single user message) or `messages` must
/// be present; `messages` wins when both are. `max_tokens` is signed so that
/// a negative value coming off the wire can be rejected during validation
/// instead of silently wrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    pub user_id: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default = "default_guard_enabled")]
    pub budget_guard_enabled: bool,
}

const fn default_guard_enabled() -> bool {
    true
}

impl ChatRequest {
    /// A minimal request with the guard enabled and everything else defaulted.
    pub fn new(model: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            prompt: None,
            messages: Vec::new(),
            model: model.into(),
            stream: false,
            temperature: None,
            max_tokens: None,
            user_id: user_id.into(),
            request_id: None,
            budget_guard_enabled: true,
        }
    }

    /// Resolve the effective message history: `messages` when non-empty,
    /// otherwise `prompt` wrapped as a single user message.
    pub fn resolve_messages(&self) -> Vec<Message> {
        if !self.messages.is_empty() {
            return self.messages.clone();
        }
        match self.prompt.as_deref() {
            Some(p) if !p.trim().is_empty() => vec![Message::user(p)],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
}

impl Usage {
    pub fn reasoning(&self) -> u32 {
        self.reasoning_tokens.unwrap_or(0)
    }

    /// Merge a later usage report into this one, keeping the larger counts.
    /// Streaming providers repeat cumulative totals on the final chunk.
    pub fn absorb(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        self.total_tokens = self.total_tokens.max(other.total_tokens);
        if let Some(r) = other.reasoning_tokens {
            self.reasoning_tokens = Some(self.reasoning_tokens.unwrap_or(0).max(r));
        }
    }
}

/// Summing across separate calls (continuation segments), as opposed to
/// [`Usage::absorb`] which merges cumulative reports of one call.
impl std::ops::AddAssign<&Usage> for Usage {
    fn add_assign(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        if self.reasoning_tokens.is_some() || other.reasoning_tokens.is_some() {
            self.reasoning_tokens = Some(self.reasoning().saturating_add(other.reasoning()));
        }
    }
}

/// A buffered completion from the provider, flattened to the fields the
/// governor cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

/// One unit of a streamed completion: a content delta, a terminal finish
/// reason, or both (some gateways fold them into one chunk).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_delta: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamEvent {
    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Finish reasons that indicate the provider stopped because the output
/// budget ran out.
pub fn is_length_limited(finish_reason: Option<&str>) -> bool {
    matches!(finish_reason, Some("length" | "max_tokens" | "max_output_tokens"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
