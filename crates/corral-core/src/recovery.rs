//! Error classification, retry with exponential backoff, and the agent
//! recovery policy.
//!
//! The classifier and policy are pure functions so they can be unit tested
//! without any orchestration machinery; the orchestrator consults them and
//! owns the actual restarts.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Rate-limit family: the provider asked us to slow down.
pub fn is_rate_limit(message: &str) -> bool {
    let m = message.to_lowercase();
    contains_any(&m, &["rate limit", "rate_limit", "429", "529", "overloaded"])
}

/// Context-window family: the conversation outgrew the model.
pub fn is_context_length(message: &str) -> bool {
    let m = message.to_lowercase();
    contains_any(&m, &["context length", "context_length", "context window"])
}

/// Network family: transient transport failures.
pub fn is_network(message: &str) -> bool {
    let m = message.to_lowercase();
    contains_any(
        &m,
        &[
            "timeout",
            "timed out",
            "connection reset",
            "connection refused",
            "econnreset",
            "econnrefused",
            "503",
        ],
    )
}

/// Classify an error message as retryable or fatal.
pub fn classify(message: &str) -> ErrorClass {
    if is_rate_limit(message) || is_network(message) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

// ---------------------------------------------------------------------------
// Retry with backoff
// ---------------------------------------------------------------------------

/// Backoff settings for [`with_retry`] and the orchestrator's restart path.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `n` (0-based): `initial * factor^n`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// `delay_for` with up to 10% random jitter added, so simultaneous
    /// retries do not re-collide.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let jitter = rand::rng().random_range(0.0..0.1);
        base + base.mul_f64(jitter)
    }
}

/// Run `op`, retrying on retryable errors with exponential backoff.
///
/// Returns the first success, the first fatal error, or the last error once
/// `max_retries` retries are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                let message = format!("{e:#}");
                if classify(&message) == ErrorClass::Fatal {
                    return Err(e);
                }
                if attempt >= policy.max_retries {
                    warn!(attempt, error = %message, "retries exhausted");
                    return Err(e);
                }
                let delay = policy.jittered_delay_for(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "retryable error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agent recovery policy
// ---------------------------------------------------------------------------

/// What the orchestrator should do with a failed agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Stop the run and wait for the operator (or a later restart).
    Pause,
    /// Restart the exec, resuming the SDK session where possible.
    Retry,
    /// Surface a terminal error.
    Fail,
}

/// Decision returned by [`handle_agent_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub action: RecoveryAction,
    pub should_retry: bool,
    pub message: String,
}

/// Decide how to recover from an `agent:error` event.
pub fn handle_agent_error(error: &str, current_turn: u32, max_turns: u32) -> RecoveryDecision {
    if current_turn >= max_turns {
        return RecoveryDecision {
            action: RecoveryAction::Pause,
            should_retry: false,
            message: format!("turn limit reached ({current_turn}/{max_turns})"),
        };
    }

    if is_rate_limit(error) {
        return RecoveryDecision {
            action: RecoveryAction::Pause,
            should_retry: true,
            message: "rate limited, pausing before retry".to_string(),
        };
    }

    if is_context_length(error) {
        // The caller is expected to summarize before retrying.
        return RecoveryDecision {
            action: RecoveryAction::Retry,
            should_retry: true,
            message: "context window exhausted, retrying".to_string(),
        };
    }

    if is_network(error) {
        return RecoveryDecision {
            action: RecoveryAction::Retry,
            should_retry: true,
            message: "transient network failure, retrying".to_string(),
        };
    }

    RecoveryDecision {
        action: RecoveryAction::Fail,
        should_retry: false,
        message: error.to_string(),
    }
}
