//! Request/response model shared by producers, the broker, and consumers.
//!
//! These are plain values with a stable JSON contract. Input is lenient
//! (optional id, timestamps, and kind; legacy field aliases) so that thin
//! producers can post a minimal body; output always carries every field.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque correlation key between a [`Request`] and its [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random (UUID v4) identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for operator-facing display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What the producer expects back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// The operator must supply a value.
    #[default]
    Feedback,
    /// The operator only acknowledges.
    Notify,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Feedback => f.write_str("feedback"),
            RequestKind::Notify => f.write_str("notify"),
        }
    }
}

/// A unit of work asking the operator for feedback or telling them something.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "RequestId::generate")]
    pub id: RequestId,
    #[serde(default, alias = "type")]
    pub kind: RequestKind,
    #[serde(default)]
    pub prompt: String,
    /// Free-form producer label (usually the tool name).
    #[serde(default, alias = "tool_name")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    /// Seconds until the broker abandons the request. `0` disables expiry.
    #[serde(default, rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            id: RequestId::generate(),
            kind,
            prompt: prompt.into(),
            source: String::new(),
            context: None,
            timeout_secs: 0,
            created_at: Utc::now(),
        }
    }

    pub fn feedback(prompt: impl Into<String>) -> Self {
        Self::new(RequestKind::Feedback, prompt)
    }

    pub fn notify(message: impl Into<String>) -> Self {
        Self::new(RequestKind::Notify, message)
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the broker-side expiry. Sub-second precision is dropped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Broker-side expiry, or `None` when the request never expires on its own.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// The correlated outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub responded_at: DateTime<Utc>,
}

fn default_success() -> bool {
    true
}

impl Response {
    pub fn ok(request_id: RequestId, value: Option<Value>) -> Self {
        Self {
            request_id,
            success: true,
            value,
            error: None,
            responded_at: Utc::now(),
        }
    }

    pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            value: None,
            error: Some(error.into()),
            responded_at: Utc::now(),
        }
    }

    /// Failure produced when the request's own deadline elapsed unanswered.
    pub fn timed_out(request_id: RequestId, timeout: Duration) -> Self {
        let error = format!(
            "Request {} timed out after {} seconds",
            request_id,
            timeout.as_secs()
        );
        Self::failure(request_id, error)
    }

    /// Failure produced when the waiting side gave up before the request did.
    pub fn cancelled(request_id: RequestId, reason: impl fmt::Display) -> Self {
        let error = format!("Request {} cancelled: {}", request_id, reason);
        Self::failure(request_id, error)
    }

    /// Render the value as operator text: strings verbatim, other JSON encoded.
    pub fn value_text(&self) -> Option<String> {
        match self.value.as_ref()? {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Liveness report served by `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    /// Requests in flight (claimed or not).
    pub pending_requests: usize,
    /// Requests waiting to be claimed.
    #[serde(default)]
    pub queued_requests: usize,
}
