//! Typed container events and the line-framed wire format.
//!
//! The agent binary writes one JSON event per LF-terminated line on stdout:
//!
//! ```text
//! { "type": "agent:token", "timestamp": 1712345678901,
//!   "taskId": "…", "sessionId": "…", "data": { "text": "…" } }
//! ```
//!
//! The closed set of recognized event types maps onto [`ContainerEvent`];
//! anything else on stdout (ordinary tool output, partial writes) is
//! tolerated and skipped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use corral_db::models::AllowedPrompt;

/// Namespace prefix for events republished onto durable streams.
pub const STREAM_PREFIX: &str = "container-agent";

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// The envelope shared by every event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

/// Outcome of decoding one line of sandbox stdout.
#[derive(Debug)]
pub enum DecodedLine {
    /// Blank line.
    Empty,
    /// Not JSON at all -- ordinary tool output, skipped at debug level.
    NotJson,
    /// JSON, but the envelope is missing required fields.
    Malformed(String),
    /// A well-formed event envelope.
    Event(WireEvent),
}

/// Decode a single line of stdout.
pub fn decode_line(line: &str) -> DecodedLine {
    let trimmed = line.trim_end_matches('\r').trim();
    if trimmed.is_empty() {
        return DecodedLine::Empty;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return DecodedLine::NotJson,
    };

    match serde_json::from_value::<WireEvent>(value) {
        Ok(event) => DecodedLine::Event(event),
        Err(e) => DecodedLine::Malformed(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedData {
    pub model: String,
    pub max_turns: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnData {
    pub turn: u32,
    pub max_turns: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStartData {
    pub tool_name: String,
    pub tool_id: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultData {
    pub tool_name: String,
    pub tool_id: String,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReadyData {
    pub plan: String,
    pub turn_count: u32,
    pub sdk_session_id: String,
    #[serde(default)]
    pub allowed_prompts: Vec<AllowedPrompt>,
}

/// Terminal status reported by `agent:complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteStatus {
    Completed,
    TurnLimit,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteData {
    pub status: CompleteStatus,
    pub turn_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub error: String,
    pub turn_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledData {
    pub turn_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangedData {
    pub path: String,
    pub action: FileAction,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
}

// ---------------------------------------------------------------------------
// The closed event union
// ---------------------------------------------------------------------------

/// Every event type the bridge recognizes, with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    Started(StartedData),
    Token(TokenData),
    Turn(TurnData),
    ToolStart(ToolStartData),
    ToolResult(ToolResultData),
    Message(MessageData),
    PlanReady(PlanReadyData),
    Complete(CompleteData),
    Error(ErrorData),
    Cancelled(CancelledData),
    FileChanged(FileChangedData),
}

/// Error decoding a recognized event's payload.
#[derive(Debug, thiserror::Error)]
#[error("invalid payload for {kind}: {reason}")]
pub struct PayloadError {
    pub kind: String,
    pub reason: String,
}

impl ContainerEvent {
    /// The wire `type` string for this event.
    pub fn wire_type(&self) -> &'static str {
        match self {
            Self::Started(_) => "agent:started",
            Self::Token(_) => "agent:token",
            Self::Turn(_) => "agent:turn",
            Self::ToolStart(_) => "agent:tool:start",
            Self::ToolResult(_) => "agent:tool:result",
            Self::Message(_) => "agent:message",
            Self::PlanReady(_) => "agent:plan_ready",
            Self::Complete(_) => "agent:complete",
            Self::Error(_) => "agent:error",
            Self::Cancelled(_) => "agent:cancelled",
            Self::FileChanged(_) => "agent:file_changed",
        }
    }

    /// The `container-agent:` stream event type this maps to, or `None` for
    /// `agent:plan_ready`, which is never republished.
    pub fn stream_type(&self) -> Option<&'static str> {
        match self {
            Self::Started(_) => Some("container-agent:started"),
            Self::Token(_) => Some("container-agent:token"),
            Self::Turn(_) => Some("container-agent:turn"),
            Self::ToolStart(_) => Some("container-agent:tool:start"),
            Self::ToolResult(_) => Some("container-agent:tool:result"),
            Self::Message(_) => Some("container-agent:message"),
            Self::PlanReady(_) => None,
            Self::Complete(_) => Some("container-agent:complete"),
            Self::Error(_) => Some("container-agent:error"),
            Self::Cancelled(_) => Some("container-agent:cancelled"),
            Self::FileChanged(_) => Some("container-agent:file_changed"),
        }
    }

    /// Decode a wire envelope into a typed event.
    ///
    /// Returns `Ok(None)` for types outside the recognized set.
    pub fn from_wire(event: &WireEvent) -> Result<Option<Self>, PayloadError> {
        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            data: &Value,
        ) -> Result<T, PayloadError> {
            serde_json::from_value(data.clone()).map_err(|e| PayloadError {
                kind: kind.to_string(),
                reason: e.to_string(),
            })
        }

        let decoded = match event.kind.as_str() {
            "agent:started" => Self::Started(payload(&event.kind, &event.data)?),
            "agent:token" => Self::Token(payload(&event.kind, &event.data)?),
            "agent:turn" => Self::Turn(payload(&event.kind, &event.data)?),
            "agent:tool:start" => Self::ToolStart(payload(&event.kind, &event.data)?),
            "agent:tool:result" => Self::ToolResult(payload(&event.kind, &event.data)?),
            "agent:message" => Self::Message(payload(&event.kind, &event.data)?),
            "agent:plan_ready" => Self::PlanReady(payload(&event.kind, &event.data)?),
            "agent:complete" => Self::Complete(payload(&event.kind, &event.data)?),
            "agent:error" => Self::Error(payload(&event.kind, &event.data)?),
            "agent:cancelled" => Self::Cancelled(payload(&event.kind, &event.data)?),
            "agent:file_changed" => Self::FileChanged(payload(&event.kind, &event.data)?),
            _ => return Ok(None),
        };

        Ok(Some(decoded))
    }

    /// The payload as a JSON object (the `data` field of the envelope).
    pub fn data(&self) -> Value {
        match self {
            Self::Started(d) => serde_json::to_value(d),
            Self::Token(d) => serde_json::to_value(d),
            Self::Turn(d) => serde_json::to_value(d),
            Self::ToolStart(d) => serde_json::to_value(d),
            Self::ToolResult(d) => serde_json::to_value(d),
            Self::Message(d) => serde_json::to_value(d),
            Self::PlanReady(d) => serde_json::to_value(d),
            Self::Complete(d) => serde_json::to_value(d),
            Self::Error(d) => serde_json::to_value(d),
            Self::Cancelled(d) => serde_json::to_value(d),
            Self::FileChanged(d) => serde_json::to_value(d),
        }
        .unwrap_or_else(|_| empty_object())
    }

    /// Wrap this event in a wire envelope.
    pub fn to_wire(&self, timestamp: i64, task_id: &str, session_id: &str) -> WireEvent {
        WireEvent {
            kind: self.wire_type().to_string(),
            timestamp,
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            data: self.data(),
        }
    }
}
