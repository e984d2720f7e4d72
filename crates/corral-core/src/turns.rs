//! Per-run turn accounting.
//!
//! Tracks how many turns an agent run has consumed, fires a one-shot warning
//! when the configured threshold is crossed, and reports when the limit is
//! reached. The stream-bound variant publishes `agent:warning` and
//! `agent:turn_limit` events onto the run's session stream.

use tracing::warn;

use crate::streams::StreamService;

/// Result of recording one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnStatus {
    pub current_turn: u32,
    pub can_continue: bool,
    /// True exactly on the increment that crossed the warning threshold.
    pub warning: bool,
}

/// Plain turn counter with a warning threshold.
#[derive(Debug)]
pub struct TurnLimiter {
    current_turn: u32,
    max_turns: u32,
    warning_threshold: f64,
}

impl TurnLimiter {
    /// Create a limiter. `warning_threshold` is a fraction in `(0, 1]` of
    /// `max_turns` at which the warning fires.
    pub fn new(max_turns: u32, warning_threshold: f64) -> Self {
        Self {
            current_turn: 0,
            max_turns,
            warning_threshold: warning_threshold.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// The turn at which the warning fires.
    fn warning_turn(&self) -> u32 {
        (self.max_turns as f64 * self.warning_threshold).ceil() as u32
    }

    /// Record a turn.
    pub fn increment_turn(&mut self) -> TurnStatus {
        self.current_turn += 1;
        let warning = self.current_turn == self.warning_turn();
        let can_continue = self.current_turn < self.max_turns;
        TurnStatus {
            current_turn: self.current_turn,
            can_continue,
            warning,
        }
    }

    pub fn current_turn(&self) -> u32 {
        self.current_turn
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }
}

/// A [`TurnLimiter`] bound to a session stream.
///
/// On the warning turn it publishes `agent:warning`; on reaching the limit
/// it publishes `agent:turn_limit`. Publish failures are logged, never
/// propagated: turn accounting must not fail the run.
pub struct SessionTurnLimiter {
    limiter: TurnLimiter,
    streams: StreamService,
    session_id: String,
}

impl SessionTurnLimiter {
    pub fn new(
        streams: StreamService,
        session_id: impl Into<String>,
        max_turns: u32,
        warning_threshold: f64,
    ) -> Self {
        Self {
            limiter: TurnLimiter::new(max_turns, warning_threshold),
            streams,
            session_id: session_id.into(),
        }
    }

    /// Record a turn and publish threshold events as needed.
    pub fn increment_turn(&mut self) -> TurnStatus {
        let status = self.limiter.increment_turn();

        if status.warning {
            let data = serde_json::json!({
                "turn": status.current_turn,
                "maxTurns": self.limiter.max_turns(),
            });
            if let Err(e) = self.streams.publish(&self.session_id, "agent:warning", data) {
                warn!(session_id = %self.session_id, error = %e, "failed to publish turn warning");
            }
        }

        if !status.can_continue {
            let data = serde_json::json!({"turn": status.current_turn});
            if let Err(e) = self
                .streams
                .publish(&self.session_id, "agent:turn_limit", data)
            {
                warn!(session_id = %self.session_id, error = %e, "failed to publish turn limit");
            }
        }

        status
    }

    pub fn current_turn(&self) -> u32 {
        self.limiter.current_turn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_fires_once_at_threshold() {
        let mut limiter = TurnLimiter::new(5, 0.8);

        // Turns 1-3: nothing special.
        for _ in 0..3 {
            let status = limiter.increment_turn();
            assert!(status.can_continue);
            assert!(!status.warning);
        }

        // Turn 4 = ceil(5 * 0.8): warning.
        let status = limiter.increment_turn();
        assert_eq!(status.current_turn, 4);
        assert!(status.warning);
        assert!(status.can_continue);

        // Turn 5: limit reached.
        let status = limiter.increment_turn();
        assert_eq!(status.current_turn, 5);
        assert!(!status.warning);
        assert!(!status.can_continue);
    }

    #[test]
    fn threshold_of_one_warns_on_last_turn() {
        let mut limiter = TurnLimiter::new(3, 1.0);
        assert!(!limiter.increment_turn().warning);
        assert!(!limiter.increment_turn().warning);
        let status = limiter.increment_turn();
        assert!(status.warning);
        assert!(!status.can_continue);
    }

    #[test]
    fn session_limiter_publishes_threshold_events() {
        let streams = StreamService::new();
        streams.create_stream("sess-1", Default::default()).unwrap();

        let mut limiter = SessionTurnLimiter::new(streams.clone(), "sess-1", 5, 0.8);
        for _ in 0..5 {
            limiter.increment_turn();
        }

        let events = streams.get_events("sess-1").unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["agent:warning", "agent:turn_limit"]);
        assert_eq!(events[0].data["turn"], 4);
        assert_eq!(events[0].data["maxTurns"], 5);
        assert_eq!(events[1].data["turn"], 5);
    }

    #[test]
    fn session_limiter_survives_missing_stream() {
        let streams = StreamService::new();
        let mut limiter = SessionTurnLimiter::new(streams, "no-such-stream", 2, 0.5);
        // Publishes fail internally but increment_turn never errors.
        let status = limiter.increment_turn();
        assert!(status.warning);
        let status = limiter.increment_turn();
        assert!(!status.can_continue);
    }
}
