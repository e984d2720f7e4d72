//! Container bridge: sandbox stdout → durable stream + agent signals.
//!
//! One bridge runs per agent exec. It reads the exec's line-framed stdout,
//! decodes recognized events, republishes them onto the run's session
//! stream under the `container-agent:` namespace, and forwards terminal
//! events (`plan_ready`, `complete`, `error`, `cancelled`) as
//! [`AgentSignal`] values to the orchestrator's per-run state machine.
//!
//! Everything that is not a recognized event is tolerated: blank lines and
//! plain tool output are skipped at debug level, malformed envelopes and
//! id mismatches are skipped with a warning. The bridge never blocks on a
//! slow stream consumer (the stream service buffers per subscriber) and a
//! publish failure never stops the reader.

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{decode_line, ContainerEvent, DecodedLine, PlanReadyData, WireEvent};
use crate::sandbox::LineStream;
use crate::session::SessionService;
use crate::turns::SessionTurnLimiter;

/// Identity the bridge was wired for. Events must match or they are
/// dropped.
#[derive(Debug, Clone)]
pub struct BridgeBindings {
    pub task_id: String,
    pub session_id: String,
    pub project_id: String,
}

/// Terminal events surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentSignal {
    /// The plan phase produced a plan. Not a completion: the stream stays
    /// open and no error may be synthesized for the agent's clean exit.
    PlanReady(PlanReadyData),
    /// The run finished (`completed`, `turn_limit`, or `cancelled`).
    Complete {
        status: crate::events::CompleteStatus,
        turn_count: u32,
    },
    /// The run reported an error.
    Error { message: String, turn_count: u32 },
    /// Stdout closed. `expected` is true when a terminal event (or
    /// `plan_ready`) was seen first.
    Eof { expected: bool },
}

/// The bridge for one agent exec.
pub struct ContainerBridge {
    bindings: BridgeBindings,
    sessions: SessionService,
    signals: mpsc::Sender<AgentSignal>,
    turn_limiter: Option<SessionTurnLimiter>,
    cancel: CancellationToken,
}

impl ContainerBridge {
    pub fn new(
        bindings: BridgeBindings,
        sessions: SessionService,
        signals: mpsc::Sender<AgentSignal>,
        turn_limiter: Option<SessionTurnLimiter>,
    ) -> Self {
        Self {
            bindings,
            sessions,
            signals,
            turn_limiter,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that halts the bridge. Cancelling is idempotent; once
    /// cancelled no further lines are processed and no EOF signal fires.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume the exec's stdout until EOF or cancellation.
    pub async fn run(mut self, mut lines: LineStream) {
        let mut saw_terminal = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(task_id = %self.bindings.task_id, "bridge cancelled");
                    return;
                }
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        self.handle_line(&line, &mut saw_terminal).await;
                    }
                    Some(Err(e)) => {
                        warn!(
                            task_id = %self.bindings.task_id,
                            error = %e,
                            "error reading agent stdout"
                        );
                        break;
                    }
                    None => break,
                },
            }
        }

        let _ = self
            .signals
            .send(AgentSignal::Eof {
                expected: saw_terminal,
            })
            .await;
    }

    async fn handle_line(&mut self, line: &str, saw_terminal: &mut bool) {
        let wire = match decode_line(line) {
            DecodedLine::Empty => return,
            DecodedLine::NotJson => {
                debug!(task_id = %self.bindings.task_id, "skipping non-JSON stdout line");
                return;
            }
            DecodedLine::Malformed(reason) => {
                warn!(
                    task_id = %self.bindings.task_id,
                    reason = %reason,
                    "skipping malformed event envelope"
                );
                return;
            }
            DecodedLine::Event(wire) => wire,
        };

        if wire.task_id != self.bindings.task_id || wire.session_id != self.bindings.session_id {
            warn!(
                task_id = %self.bindings.task_id,
                event_task_id = %wire.task_id,
                event_session_id = %wire.session_id,
                "dropping event with mismatched bindings"
            );
            return;
        }

        let event = match ContainerEvent::from_wire(&wire) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(
                    task_id = %self.bindings.task_id,
                    kind = %wire.kind,
                    "ignoring unrecognized event type"
                );
                return;
            }
            Err(e) => {
                warn!(task_id = %self.bindings.task_id, error = %e, "skipping bad event payload");
                return;
            }
        };

        if let ContainerEvent::Turn(_) = &event {
            if let Some(limiter) = &mut self.turn_limiter {
                limiter.increment_turn();
            }
        }

        self.publish(&event, &wire);

        match event {
            ContainerEvent::PlanReady(data) => {
                *saw_terminal = true;
                let _ = self.signals.send(AgentSignal::PlanReady(data)).await;
            }
            ContainerEvent::Complete(data) => {
                *saw_terminal = true;
                let _ = self
                    .signals
                    .send(AgentSignal::Complete {
                        status: data.status,
                        turn_count: data.turn_count,
                    })
                    .await;
            }
            ContainerEvent::Error(data) => {
                *saw_terminal = true;
                let _ = self
                    .signals
                    .send(AgentSignal::Error {
                        message: data.error,
                        turn_count: data.turn_count,
                    })
                    .await;
            }
            ContainerEvent::Cancelled(data) => {
                *saw_terminal = true;
                let _ = self
                    .signals
                    .send(AgentSignal::Complete {
                        status: crate::events::CompleteStatus::Cancelled,
                        turn_count: data.turn_count,
                    })
                    .await;
            }
            _ => {}
        }
    }

    /// Republish an event onto the session stream with the run identity
    /// folded into the payload. `plan_ready` maps to no stream event.
    fn publish(&self, event: &ContainerEvent, wire: &WireEvent) {
        let Some(kind) = event.stream_type() else {
            return;
        };

        let mut data = wire.data.clone();
        if let Value::Object(map) = &mut data {
            map.insert("taskId".to_string(), Value::from(self.bindings.task_id.clone()));
            map.insert(
                "sessionId".to_string(),
                Value::from(self.bindings.session_id.clone()),
            );
            map.insert(
                "projectId".to_string(),
                Value::from(self.bindings.project_id.clone()),
            );
        }

        if let Err(e) = self.sessions.publish(&self.bindings.session_id, kind, data) {
            warn!(
                session_id = %self.bindings.session_id,
                kind,
                error = %e,
                "failed to publish stream event"
            );
        }
    }
}
