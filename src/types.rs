use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::constants::MAX_FRAME_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl MessageId {
    pub fn new() -> Self {
        Self(format!("msg_{}", Uuid::new_v4().simple()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum ChatflowError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    #[error("Server reported an error: {0}")]
    Remote(String),

    #[error("A response is already streaming in this session")]
    Busy,

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl ChatflowError {
    /// Failures of the connection itself, as opposed to a server-side `error` frame.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Io(_) | Self::Upstream(_, _))
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChatflowError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChatflowError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- WIRE PAYLOADS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaPayload {
    #[serde(alias = "conversationId")]
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub relevance: f64,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagSource {
    pub content: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultPayload {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub status: ToolResultStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "structuredData")]
    pub structured_data: Option<Value>,
}

#[derive(Deserialize)]
struct MemoryRecallBody {
    #[serde(default)]
    memories: Vec<MemoryItem>,
}

#[derive(Deserialize)]
struct RagSourceBody {
    #[serde(default)]
    sources: Vec<RagSource>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// One decoded frame of the assistant event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Meta(MetaPayload),
    MemoryRecall(Vec<MemoryItem>),
    RagSource(Vec<RagSource>),
    ToolCall(ToolCallPayload),
    ToolResult(ToolResultPayload),
    ReasoningDelta(String),
    ContentDelta(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Meta(_) => "meta",
            Self::MemoryRecall(_) => "memory_recall",
            Self::RagSource(_) => "rag_source",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::ReasoningDelta(_) => "reasoning",
            Self::ContentDelta(_) => "content",
            Self::Done => "done",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug)]
pub enum FrameEvent {
    Event(StreamEvent),
    Unknown(String),
    Malformed(String),
}

pub fn parse_frame(kind: &str, data: &str) -> FrameEvent {
    if data.len() > MAX_FRAME_BYTES {
        return FrameEvent::Malformed(format!("frame too large: {} bytes", data.len()));
    }
    // Delta text is kept verbatim, so a literal `[DONE]` inside it is content.
    match kind {
        "reasoning" => return FrameEvent::Event(StreamEvent::ReasoningDelta(delta_text(data))),
        "content" => return FrameEvent::Event(StreamEvent::ContentDelta(delta_text(data))),
        _ => {}
    }
    if data.trim() == "[DONE]" {
        return FrameEvent::Event(StreamEvent::Done);
    }

    let parsed = match kind {
        "meta" => serde_json::from_str::<MetaPayload>(data).map(StreamEvent::Meta),
        "memory_recall" => serde_json::from_str::<MemoryRecallBody>(data)
            .map(|b| StreamEvent::MemoryRecall(b.memories)),
        "rag_source" => {
            serde_json::from_str::<RagSourceBody>(data).map(|b| StreamEvent::RagSource(b.sources))
        }
        "tool_call" => serde_json::from_str::<ToolCallPayload>(data).map(StreamEvent::ToolCall),
        "tool_result" => {
            serde_json::from_str::<ToolResultPayload>(data).map(StreamEvent::ToolResult)
        }
        "done" => return FrameEvent::Event(StreamEvent::Done),
        "error" => {
            let message = match serde_json::from_str::<ErrorBody>(data) {
                Ok(body) => body.message,
                Err(_) => data.to_string(),
            };
            return FrameEvent::Event(StreamEvent::Error(message));
        }
        other => return FrameEvent::Unknown(other.to_string()),
    };

    match parsed {
        Ok(event) => FrameEvent::Event(event),
        Err(e) => FrameEvent::Malformed(format!("{} payload: {}", kind, e)),
    }
}

/// Delta frames carry `{"text": ...}` (or `content`/`delta`) or the raw text itself.
/// Anything else, JSON-looking or not, is passed through untouched.
fn delta_text(data: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(data) {
        let text = ["text", "content", "delta"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()));
        if let Some(text) = text {
            return text.to_string();
        }
    }
    data.to_string()
}

/// --- ASSEMBLED MODEL ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Calling,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStepKind {
    Reasoning,
    ToolCall,
    SqlResult,
    ChartConfig,
    RagSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessStep {
    pub id: String,
    pub kind: ProcessStepKind,
    pub title: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AxisSpec {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesSpec {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Canonical chart description handed to the renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    pub chart_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis: Option<AxisSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<AxisSpec>,
    #[serde(default)]
    pub series: Vec<SeriesSpec>,
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Complete,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub id: MessageId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub rag_sources: Vec<RagSource>,
    #[serde(default)]
    pub memories: Vec<MemoryItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_config: Option<ChartConfig>,
    #[serde(default)]
    pub process_steps: Vec<ProcessStep>,
    pub status: MessageStatus,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserMessage {
    pub id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl UserMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl ChatMessage {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::User(m) => &m.content,
            Self::Assistant(m) => &m.content,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            Self::User(_) => None,
        }
    }
}

/// Body posted to the streaming chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub model: String,
    pub content: String,
    pub thinking_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_ids: Option<Vec<String>>,
}
