//! Core agent-execution subsystem for corral.
//!
//! Orchestrates long-running AI coding agents inside per-project container
//! sandboxes: per-task worktrees, durable per-session event streams, a
//! line-framed JSON bridge over sandbox stdout, the plan → approve →
//! execute task lifecycle, and retryable-error recovery.
//!
//! # Architecture
//!
//! ```text
//! TaskService ──start──▶ AgentOrchestrator ──exec──▶ SandboxProvider
//!      ▲                      │    │                      │
//!      │ column moves         │    └─ credentials,        │ stdout (JSONL)
//!      │ plan persistence     │       worktrees,          ▼
//!      │                      │       sessions       ContainerBridge
//!      └──────────────────────┘                           │
//!                                   publishes             ▼
//!                       StreamService ◀──────── container-agent:* events
//!                            │                            │
//!                            ▼                            ▼
//!                     subscribers (replay+live)    AgentSignal → state machine
//! ```

pub mod bridge;
pub mod credentials;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod sandbox;
pub mod session;
pub mod streams;
pub mod tasks;
pub mod turns;
pub mod worktree;

pub use bridge::{AgentSignal, BridgeBindings, ContainerBridge};
pub use credentials::CredentialResolver;
pub use error::{CoreError, CoreResult, ErrorCode};
pub use events::{ContainerEvent, WireEvent};
pub use orchestrator::{AgentOrchestrator, OrchestratorConfig, Phase, StartAgentInput};
pub use recovery::{handle_agent_error, with_retry, RetryPolicy};
pub use session::SessionService;
pub use streams::{StreamEvent, StreamService};
pub use tasks::TaskService;
pub use turns::TurnLimiter;
pub use worktree::WorktreeService;
