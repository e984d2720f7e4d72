//! Stable error taxonomy for the agent execution subsystem.
//!
//! Every fallible core operation returns `Result`; expected failures carry a
//! stable [`ErrorCode`] so callers (and transports layered on top) can match
//! on the code rather than the message.

use std::fmt;

use thiserror::Error;

/// Stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Admission
    AgentAlreadyRunning,
    ConcurrencyLimit,
    PlanNotPending,
    InvalidTransition,
    // Dependencies
    ApiKeyNotConfigured,
    WorktreeCreateFailed,
    SandboxUnavailable,
    StreamNotFound,
    // Runtime
    ExecStreamFailed,
    SubscriberOverrun,
    PlanToolInputParseError,
    PlanCredentialsNotFound,
    PlanCredentialsExpired,
    PlanApiError,
    // Policy
    RetryExhausted,
    TurnLimitReached,
}

impl ErrorCode {
    /// The wire form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentAlreadyRunning => "AGENT_ALREADY_RUNNING",
            Self::ConcurrencyLimit => "CONCURRENCY_LIMIT",
            Self::PlanNotPending => "PLAN_NOT_PENDING",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::ApiKeyNotConfigured => "API_KEY_NOT_CONFIGURED",
            Self::WorktreeCreateFailed => "WORKTREE_CREATE_FAILED",
            Self::SandboxUnavailable => "SANDBOX_UNAVAILABLE",
            Self::StreamNotFound => "STREAM_NOT_FOUND",
            Self::ExecStreamFailed => "EXEC_STREAM_FAILED",
            Self::SubscriberOverrun => "SUBSCRIBER_OVERRUN",
            Self::PlanToolInputParseError => "PLAN_TOOL_INPUT_PARSE_ERROR",
            Self::PlanCredentialsNotFound => "PLAN_CREDENTIALS_NOT_FOUND",
            Self::PlanCredentialsExpired => "PLAN_CREDENTIALS_EXPIRED",
            Self::PlanApiError => "PLAN_API_ERROR",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::TurnLimitReached => "TURN_LIMIT_REACHED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with a stable code, a human message, and optional structured
/// details.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl CoreError {
    /// Create an error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            source: None,
        }
    }

    /// Attach structured detail.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_have_stable_wire_forms() {
        assert_eq!(ErrorCode::AgentAlreadyRunning.as_str(), "AGENT_ALREADY_RUNNING");
        assert_eq!(ErrorCode::ConcurrencyLimit.as_str(), "CONCURRENCY_LIMIT");
        assert_eq!(ErrorCode::SubscriberOverrun.as_str(), "SUBSCRIBER_OVERRUN");
        assert_eq!(ErrorCode::TurnLimitReached.as_str(), "TURN_LIMIT_REACHED");
    }

    #[test]
    fn error_display_includes_code_and_message() {
        let err = CoreError::new(ErrorCode::SandboxUnavailable, "sandbox is stopped");
        let rendered = err.to_string();
        assert!(rendered.contains("SANDBOX_UNAVAILABLE"));
        assert!(rendered.contains("sandbox is stopped"));
    }

    #[test]
    fn error_detail_is_preserved() {
        let err = CoreError::new(ErrorCode::ConcurrencyLimit, "limit reached")
            .with_detail(serde_json::json!({"max": 2}));
        assert_eq!(err.detail.unwrap()["max"], 2);
    }
}
