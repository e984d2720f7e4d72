//! Container-agent orchestrator.
//!
//! Owns the two process-wide maps (`running_agents`, `pending_plans`) and
//! drives the plan → approve → execute lifecycle: resolve credentials,
//! ensure a worktree and session, acquire the project sandbox, exec the
//! agent binary, wire its stdout into a [`ContainerBridge`], and react to
//! the bridge's terminal signals under a per-task lock.
//!
//! All public operations (`start_agent`, `stop_agent`, `approve_plan`,
//! `reject_plan`) serialize per task; operations on different tasks run
//! concurrently. The per-project concurrency gate is evaluated inside the
//! per-task lock against the running map itself.

pub mod gate;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_db::models::{
    AgentConfig, AgentRunStatus, AgentStatus, AllowedPrompt, PlanOptions, Project, SandboxStatus,
    Task,
};
use corral_db::queries::{agents as agents_db, audit, projects as projects_db, sandboxes as sandboxes_db};

use crate::bridge::{AgentSignal, BridgeBindings, ContainerBridge};
use crate::credentials::{CredentialResolver, ANTHROPIC};
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::events::CompleteStatus;
use crate::recovery::{handle_agent_error, RetryPolicy};
use crate::sandbox::{ExecHandle, ExecSpec, Sandbox, SandboxConfig, SandboxProvider};
use crate::session::{CreateSession, SessionService};
use crate::tasks::{TaskService, TaskTransition};
use crate::turns::SessionTurnLimiter;
use crate::worktree::{CreateWorktree, WorktreeService};

/// Environment variable names passed to the agent binary.
pub mod env {
    pub const TASK_ID: &str = "CORRAL_TASK_ID";
    pub const SESSION_ID: &str = "CORRAL_SESSION_ID";
    pub const PROJECT_ID: &str = "CORRAL_PROJECT_ID";
    pub const PROMPT: &str = "CORRAL_PROMPT";
    pub const PHASE: &str = "CORRAL_PHASE";
    pub const STOP_FILE: &str = "CORRAL_STOP_FILE";
    pub const MAX_TURNS: &str = "CORRAL_MAX_TURNS";
    pub const ALLOWED_TOOLS: &str = "CORRAL_ALLOWED_TOOLS";
    pub const MODEL: &str = "CORRAL_MODEL";
    pub const OAUTH_TOKEN: &str = "CLAUDE_CODE_OAUTH_TOKEN";
    pub const RESUME_SESSION: &str = "CLAUDE_RESUME_SESSION";
    pub const ALLOWED_PROMPTS: &str = "CLAUDE_ALLOWED_PROMPTS";
}

/// Run phase: plan proposes, execute carries out an approved plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Execute,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Execute => "execute",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDK-session resumption for execute-phase runs.
#[derive(Debug, Clone)]
pub struct ResumeOptions {
    pub sdk_session_id: String,
    pub allowed_prompts: Vec<AllowedPrompt>,
}

/// Inputs to [`AgentOrchestrator::start_agent`].
#[derive(Debug, Clone)]
pub struct StartAgentInput {
    pub project_id: String,
    pub task_id: String,
    /// Reuse an existing active session (the approve path); otherwise a
    /// fresh session is created.
    pub session_id: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub phase: Phase,
    pub resume: Option<ResumeOptions>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Agent binary exec'd inside the sandbox.
    pub agent_binary: String,
    /// Grace period between stop-file write and hard kill.
    pub stop_grace: Duration,
    /// Backoff policy for restarting after retryable agent errors.
    pub retry: RetryPolicy,
    /// Sandbox creation settings.
    pub sandbox: SandboxConfig,
    /// Fraction of max turns at which the turn warning fires.
    pub warning_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_binary: "corral-agent".to_string(),
            stop_grace: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            sandbox: SandboxConfig::default(),
            warning_threshold: 0.8,
        }
    }
}

/// A plan held in memory from `plan_ready` until approve/reject.
#[derive(Debug, Clone)]
pub struct PendingPlan {
    pub task_id: String,
    pub session_id: String,
    pub plan: String,
    pub turn_count: u32,
    pub sdk_session_id: String,
    pub allowed_prompts: Vec<AllowedPrompt>,
}

/// In-memory record of a live agent run. Owned exclusively by the
/// orchestrator; mutated only under the running map's lock.
struct RunningAgent {
    project_id: String,
    session_id: String,
    agent_id: String,
    worktree_id: String,
    sandbox: Arc<dyn Sandbox>,
    phase: Phase,
    stop_file_path: String,
    stop_requested: bool,
    /// Restart attempts consumed by the recovery policy.
    attempt: u32,
    max_turns: u32,
    last_turn_count: u32,
    sdk_session_id: Option<String>,
    /// Env template for relaunches; `CLAUDE_RESUME_SESSION` is overlaid.
    exec_env: HashMap<String, String>,
    workdir: String,
    exec: Option<Box<dyn ExecHandle>>,
    bridge_cancel: CancellationToken,
    signal_tx: mpsc::Sender<AgentSignal>,
}

struct Inner {
    pool: SqlitePool,
    provider: Arc<dyn SandboxProvider>,
    sessions: SessionService,
    worktrees: WorktreeService,
    tasks: TaskService,
    credentials: CredentialResolver,
    config: OrchestratorConfig,
    running: Mutex<HashMap<String, RunningAgent>>,
    pending_plans: Mutex<HashMap<String, PendingPlan>>,
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// The container-agent service.
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<Inner>,
}

impl AgentOrchestrator {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn SandboxProvider>,
        sessions: SessionService,
        worktrees: WorktreeService,
        tasks: TaskService,
        credentials: CredentialResolver,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                provider,
                sessions,
                worktrees,
                tasks,
                credentials,
                config,
                running: Mutex::new(HashMap::new()),
                pending_plans: Mutex::new(HashMap::new()),
                task_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The session service (stream access for consumers).
    pub fn sessions(&self) -> &SessionService {
        &self.inner.sessions
    }

    /// The worktree service (diff/merge surface).
    pub fn worktrees(&self) -> &WorktreeService {
        &self.inner.worktrees
    }

    /// Whether a live run exists for the task.
    pub fn is_agent_running(&self, task_id: &str) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_id)
    }

    /// Snapshot of the pending plan for a task, if any.
    pub fn pending_plan(&self, task_id: &str) -> Option<PendingPlan> {
        self.inner
            .pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    /// Move a backlog task to `in_progress` and launch its plan-phase run.
    ///
    /// On launch failure the column move is rolled back so the board keeps
    /// reflecting reality.
    pub async fn start_task(&self, task_id: &str) -> CoreResult<()> {
        let task = self.inner.tasks.get_required(task_id).await?;
        self.inner.tasks.transition(task_id, TaskTransition::Start).await?;

        let prompt = if task.description.is_empty() {
            task.title.clone()
        } else {
            format!("{}\n\n{}", task.title, task.description)
        };

        let input = StartAgentInput {
            project_id: task.project_id.clone(),
            task_id: task_id.to_string(),
            session_id: None,
            prompt,
            model: None,
            max_turns: None,
            phase: Phase::Plan,
            resume: None,
        };

        if let Err(e) = self.start_agent(input).await {
            let _ = self
                .inner
                .tasks
                .transition(task_id, TaskTransition::Cancel)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Mark a reviewed task `verified`.
    pub async fn verify_task(&self, task_id: &str) -> CoreResult<()> {
        self.inner.tasks.transition(task_id, TaskTransition::Verify).await
    }

    /// Cancel a task: stop its run if one is live, and return the column
    /// to backlog.
    pub async fn cancel_task(&self, task_id: &str) -> CoreResult<()> {
        self.stop_agent(task_id).await?;
        // A run that was stopped already reverted the column; cover the
        // no-live-run case.
        if let Ok(Some(task)) = self.inner.tasks.get(task_id).await {
            if task.column == corral_db::models::TaskColumn::InProgress {
                self.inner
                    .tasks
                    .transition(task_id, TaskTransition::Cancel)
                    .await?;
            }
        }
        Ok(())
    }

    /// Start an agent run for a task: admission guard, concurrency gate,
    /// credential, worktree, session, sandbox, then exec + bridge wiring.
    pub async fn start_agent(&self, input: StartAgentInput) -> CoreResult<()> {
        let task_lock = self.inner.task_lock(&input.task_id);
        let _guard = task_lock.lock().await;

        // 1. One live run per task.
        if self.is_agent_running(&input.task_id) {
            return Err(CoreError::new(
                ErrorCode::AgentAlreadyRunning,
                format!("task {} already has a live agent run", input.task_id),
            ));
        }

        let task = self.inner.tasks.get_required(&input.task_id).await?;
        let project = self.inner.require_project(&input.project_id).await?;
        let project_config = project.config().unwrap_or_default();

        // 2./3. Concurrency gate, evaluated against the running map.
        {
            let running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let max = project.max_concurrent_agents.max(0) as usize;
            if !gate::admits(
                running.values().map(|r| r.project_id.as_str()),
                &project.id,
                max,
            ) {
                return Err(CoreError::new(
                    ErrorCode::ConcurrencyLimit,
                    format!(
                        "project {} already has {max} concurrent agent(s)",
                        project.id
                    ),
                )
                .with_detail(json!({"maxConcurrentAgents": max})));
            }
        }

        // 4. Credential.
        let token = self
            .inner
            .credentials
            .resolve(ANTHROPIC)
            .await
            .map_err(|e| {
                CoreError::new(ErrorCode::ApiKeyNotConfigured, format!("{e:#}"))
            })?
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::ApiKeyNotConfigured,
                    "no anthropic credential configured",
                )
            })?;

        // 5. Worktree: reuse the task's if present, else create one.
        let mut created_worktree = None;
        let worktree = match &task.worktree_id {
            Some(id) => match self.inner.worktrees.get(id).await {
                Ok(Some(worktree)) => worktree,
                _ => {
                    let worktree = self.inner.create_worktree(&project, &task).await?;
                    created_worktree = Some(worktree.id.clone());
                    worktree
                }
            },
            None => {
                let worktree = self.inner.create_worktree(&project, &task).await?;
                created_worktree = Some(worktree.id.clone());
                worktree
            }
        };

        // 6. Session: reuse the approve-path session or create one.
        let mut created_session = None;
        let session = match &input.session_id {
            Some(id) => match self.inner.sessions.get_by_id(id).await {
                Ok(Some(session))
                    if session.status == corral_db::models::SessionStatus::Active =>
                {
                    // Streams are process-local; after a restart the row
                    // outlives the stream, so re-create it idempotently.
                    let _ = self
                        .inner
                        .sessions
                        .streams()
                        .create_stream(&session.id, Default::default());
                    session
                }
                _ => {
                    let session = self
                        .inner
                        .new_session(&project, &task, input.phase)
                        .await?;
                    created_session = Some(session.id.clone());
                    session
                }
            },
            None => {
                let session = self
                    .inner
                    .new_session(&project, &task, input.phase)
                    .await?;
                created_session = Some(session.id.clone());
                session
            }
        };

        // Agent row for this run.
        let agent_config = AgentConfig {
            model: input.model.clone(),
            max_turns: input.max_turns.or(Some(project_config.max_turns)),
            allowed_tools: project_config.allowed_tools.clone(),
        };
        let agent = agents_db::insert_agent(&self.inner.pool, &project.id, "container", &agent_config)
            .await
            .map_err(|e| CoreError::new(ErrorCode::ExecStreamFailed, format!("{e:#}")))?;
        let agent_status = match input.phase {
            Phase::Plan => AgentStatus::Planning,
            Phase::Execute => AgentStatus::Running,
        };
        let _ = agents_db::update_agent_status(
            &self.inner.pool,
            &agent.id,
            agent_status,
            Some(&input.task_id),
        )
        .await;

        let _ = self
            .inner
            .tasks
            .set_run_refs(
                &input.task_id,
                Some(&agent.id),
                Some(&session.id),
                Some(&worktree.id),
            )
            .await;

        // 7. Sandbox.
        let sandbox = match self.inner.ensure_sandbox(&project).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.inner
                    .rollback_launch(created_session.as_deref(), created_worktree.as_deref())
                    .await;
                return Err(e);
            }
        };

        // 8. Unique stop-file for this run.
        let stop_file_path = format!("/tmp/corral-stop-{}", uuid::Uuid::new_v4());

        let max_turns = input.max_turns.unwrap_or(project_config.max_turns);

        // 9. Compose environment and launch.
        let mut exec_env = HashMap::new();
        exec_env.insert(env::TASK_ID.to_string(), input.task_id.clone());
        exec_env.insert(env::SESSION_ID.to_string(), session.id.clone());
        exec_env.insert(env::PROJECT_ID.to_string(), project.id.clone());
        exec_env.insert(env::PROMPT.to_string(), input.prompt.clone());
        exec_env.insert(env::PHASE.to_string(), input.phase.as_str().to_string());
        exec_env.insert(env::STOP_FILE.to_string(), stop_file_path.clone());
        exec_env.insert(env::MAX_TURNS.to_string(), max_turns.to_string());
        exec_env.insert(
            env::ALLOWED_TOOLS.to_string(),
            project_config.allowed_tools.join(","),
        );
        exec_env.insert(env::OAUTH_TOKEN.to_string(), token);
        if let Some(model) = &input.model {
            exec_env.insert(env::MODEL.to_string(), model.clone());
        }
        let mut sdk_session_id = None;
        if let Some(resume) = &input.resume {
            exec_env.insert(env::RESUME_SESSION.to_string(), resume.sdk_session_id.clone());
            if !resume.allowed_prompts.is_empty() {
                if let Ok(prompts) = serde_json::to_string(&resume.allowed_prompts) {
                    exec_env.insert(env::ALLOWED_PROMPTS.to_string(), prompts);
                }
            }
            sdk_session_id = Some(resume.sdk_session_id.clone());
        }

        let (signal_tx, signal_rx) = mpsc::channel(64);
        let bindings = BridgeBindings {
            task_id: input.task_id.clone(),
            session_id: session.id.clone(),
            project_id: project.id.clone(),
        };

        let launch = self
            .inner
            .launch_exec(
                &sandbox,
                exec_env.clone(),
                worktree.path.clone(),
                bindings,
                max_turns,
                signal_tx.clone(),
            )
            .await;
        let (exec_handle, bridge_cancel) = match launch {
            Ok(launch) => launch,
            Err(e) => {
                self.inner
                    .rollback_launch(created_session.as_deref(), created_worktree.as_deref())
                    .await;
                return Err(e);
            }
        };

        // 10. Register the run atomically with the launch.
        {
            let mut running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            running.insert(
                input.task_id.clone(),
                RunningAgent {
                    project_id: project.id.clone(),
                    session_id: session.id.clone(),
                    agent_id: agent.id.clone(),
                    worktree_id: worktree.id.clone(),
                    sandbox: Arc::clone(&sandbox),
                    phase: input.phase,
                    stop_file_path,
                    stop_requested: false,
                    attempt: 0,
                    max_turns,
                    last_turn_count: 0,
                    sdk_session_id,
                    exec_env,
                    workdir: worktree.path.clone(),
                    exec: Some(exec_handle),
                    bridge_cancel,
                    signal_tx,
                },
            );
        }

        if input.phase == Phase::Plan {
            let _ = self
                .inner
                .tasks
                .set_run_status(&input.task_id, Some(AgentRunStatus::Planning))
                .await;
        }

        let _ = audit::insert_audit(
            &self.inner.pool,
            "task",
            &input.task_id,
            "agent_started",
            Some(&json!({"phase": input.phase.as_str(), "sessionId": session.id})),
        )
        .await;

        // Per-run state machine: consumes bridge signals until the run is
        // finalized.
        let inner = Arc::clone(&self.inner);
        let task_id = input.task_id.clone();
        tokio::spawn(async move {
            inner.run_state_machine(task_id, signal_rx).await;
        });

        info!(
            task_id = %input.task_id,
            session_id = %session.id,
            phase = %input.phase,
            "agent started"
        );
        Ok(())
    }

    /// Stop a task's run: cooperative stop-file first, hard kill after the
    /// grace deadline. Idempotent.
    pub async fn stop_agent(&self, task_id: &str) -> CoreResult<()> {
        let task_lock = self.inner.task_lock(task_id);
        let guard = task_lock.lock().await;

        let Some((sandbox, stop_file)) = ({
            let mut running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            running.get_mut(task_id).map(|entry| {
                entry.stop_requested = true;
                (Arc::clone(&entry.sandbox), entry.stop_file_path.clone())
            })
        }) else {
            return Ok(());
        };

        // Release the per-task lock so the run's state machine can
        // finalize a cooperative exit.
        drop(guard);

        if let Err(e) = sandbox.write_file(&stop_file, b"stop\n").await {
            warn!(task_id, error = %e, "failed to write stop-file, will hard-kill");
        }

        // Wait for the cooperative exit.
        let deadline = tokio::time::Instant::now() + self.inner.config.stop_grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_agent_running(task_id) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Grace elapsed: hard kill and synthesize the cancellation.
        let _guard = task_lock.lock().await;
        let entry = {
            let mut running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            running.remove(task_id)
        };
        let Some(mut entry) = entry else {
            return Ok(());
        };

        warn!(task_id, "agent ignored stop-file, killing exec");
        entry.bridge_cancel.cancel();
        if let Some(mut exec) = entry.exec.take() {
            if let Err(e) = exec.kill().await {
                warn!(task_id, error = %e, "failed to kill exec");
            }
        }

        let data = json!({
            "turnCount": entry.last_turn_count,
            "taskId": task_id,
            "sessionId": entry.session_id,
            "projectId": entry.project_id,
        });
        if let Err(e) =
            self.inner
                .sessions
                .publish(&entry.session_id, "container-agent:cancelled", data)
        {
            warn!(task_id, error = %e, "failed to publish synthesized cancelled event");
        }

        self.inner.finalize_cancelled(task_id, &entry).await;
        Ok(())
    }

    /// A pending plan from memory, or reconstructed from the task row.
    ///
    /// The in-memory record dies with the process; a task parked in
    /// `waiting_approval` with `last_agent_status = planning` still holds
    /// everything needed to resume, so approval survives restarts. Once a
    /// plan is approved or rejected the row no longer qualifies and the
    /// operation stays refused.
    async fn pending_or_recovered(&self, task_id: &str) -> Option<PendingPlan> {
        if let Some(pending) = self.pending_plan(task_id) {
            return Some(pending);
        }
        if self.is_agent_running(task_id) {
            return None;
        }
        let task = self.inner.tasks.get(task_id).await.ok().flatten()?;
        if task.column != corral_db::models::TaskColumn::WaitingApproval
            || task.last_agent_status != Some(AgentRunStatus::Planning)
        {
            return None;
        }
        let plan = task.plan.clone()?;
        let options = task.plan_options().ok().flatten()?;
        let session_id = task.session_id.clone()?;
        Some(PendingPlan {
            task_id: task_id.to_string(),
            session_id,
            plan,
            turn_count: 0,
            sdk_session_id: options.sdk_session_id,
            allowed_prompts: options.allowed_prompts,
        })
    }

    /// Approve a pending plan and launch the execute-phase run, resuming
    /// the SDK session captured at plan time.
    pub async fn approve_plan(&self, task_id: &str, approved_by: Option<&str>) -> CoreResult<()> {
        let task_lock = self.inner.task_lock(task_id);
        let guard = task_lock.lock().await;

        let pending = self
            .pending_or_recovered(task_id)
            .await
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::PlanNotPending,
                    format!("no pending plan for task {task_id}"),
                )
            })?;

        let task = self.inner.tasks.get_required(task_id).await?;
        if task.column != corral_db::models::TaskColumn::WaitingApproval {
            return Err(CoreError::new(
                ErrorCode::PlanNotPending,
                format!("task {task_id} is not waiting for approval"),
            ));
        }
        let options = task
            .plan_options()
            .ok()
            .flatten()
            .filter(|options| !options.sdk_session_id.is_empty());
        if task.plan.is_none() || options.is_none() {
            return Err(CoreError::new(
                ErrorCode::PlanNotPending,
                format!("task {task_id} has no usable plan to approve"),
            ));
        }

        self.inner.tasks.approve_plan(task_id, approved_by).await?;
        self.inner
            .pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);

        drop(guard);

        // The plan exec tears down on its EOF signal; give it a moment so
        // the execute launch does not trip the one-run-per-task guard.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.is_agent_running(task_id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.start_agent(StartAgentInput {
            project_id: task.project_id.clone(),
            task_id: task_id.to_string(),
            session_id: Some(pending.session_id.clone()),
            prompt: pending.plan.clone(),
            model: None,
            max_turns: None,
            phase: Phase::Execute,
            resume: Some(ResumeOptions {
                sdk_session_id: pending.sdk_session_id.clone(),
                allowed_prompts: pending.allowed_prompts.clone(),
            }),
        })
        .await
    }

    /// Reject a pending plan: plan fields cleared, column back to backlog.
    /// Bookkeeping only; no error event is published.
    pub async fn reject_plan(&self, task_id: &str) -> CoreResult<()> {
        let task_lock = self.inner.task_lock(task_id);
        let _guard = task_lock.lock().await;

        let pending = self
            .pending_or_recovered(task_id)
            .await
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::PlanNotPending,
                    format!("no pending plan for task {task_id}"),
                )
            })?;

        self.inner.tasks.reject_plan(task_id).await?;
        self.inner
            .pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);

        // The plan session is over; the stream stays readable for replay.
        if let Err(e) = self.inner.sessions.close(&pending.session_id).await {
            warn!(task_id, error = %e, "failed to close session on reject");
        }

        info!(task_id, "plan rejected");
        Ok(())
    }
}

impl Inner {
    fn task_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.task_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn require_project(&self, project_id: &str) -> CoreResult<Project> {
        projects_db::get_project(&self.pool, project_id)
            .await
            .map_err(|e| CoreError::new(ErrorCode::InvalidTransition, format!("{e:#}")))?
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::InvalidTransition,
                    format!("project {project_id} not found"),
                )
            })
    }

    async fn create_worktree(
        &self,
        project: &Project,
        task: &Task,
    ) -> CoreResult<corral_db::models::Worktree> {
        self.worktrees
            .create(CreateWorktree {
                project,
                task_id: &task.id,
                session_id: None,
                agent_id: None,
                branch: None,
                base_branch: None,
            })
            .await
    }

    async fn new_session(
        &self,
        project: &Project,
        task: &Task,
        phase: Phase,
    ) -> CoreResult<corral_db::models::Session> {
        self.sessions
            .create(CreateSession {
                project_id: &project.id,
                task_id: Some(&task.id),
                agent_id: None,
                title: &format!("{} ({phase})", task.title),
            })
            .await
            .map_err(|e| CoreError::new(ErrorCode::ExecStreamFailed, format!("{e:#}")))
    }

    /// Get or create the project sandbox, requiring `running` status.
    async fn ensure_sandbox(&self, project: &Project) -> CoreResult<Arc<dyn Sandbox>> {
        let existing = self.provider.get(&project.id).await.map_err(|e| {
            CoreError::new(ErrorCode::SandboxUnavailable, format!("{e:#}"))
        })?;

        let sandbox = match existing {
            Some(sandbox) => sandbox,
            None => {
                let row = sandboxes_db::insert_sandbox(&self.pool, &project.id).await.ok();
                match self.provider.create(&project.id, &self.config.sandbox).await {
                    Ok(sandbox) => {
                        if let Some(row) = &row {
                            let _ = sandboxes_db::update_sandbox_status(
                                &self.pool,
                                &row.id,
                                SandboxStatus::Running,
                            )
                            .await;
                        }
                        sandbox
                    }
                    Err(e) => {
                        if let Some(row) = &row {
                            let _ = sandboxes_db::update_sandbox_status(
                                &self.pool,
                                &row.id,
                                SandboxStatus::Failed,
                            )
                            .await;
                        }
                        return Err(CoreError::new(
                            ErrorCode::SandboxUnavailable,
                            format!("failed to create sandbox for project {}: {e:#}", project.id),
                        ));
                    }
                }
            }
        };

        let status = sandbox.status().await;
        if status != SandboxStatus::Running {
            return Err(CoreError::new(
                ErrorCode::SandboxUnavailable,
                format!("sandbox for project {} is {status}", project.id),
            ));
        }
        Ok(sandbox)
    }

    /// Exec the agent binary and wire a bridge onto its stdout. Returns
    /// the exec handle and the bridge's cancellation token.
    async fn launch_exec(
        &self,
        sandbox: &Arc<dyn Sandbox>,
        exec_env: HashMap<String, String>,
        workdir: String,
        bindings: BridgeBindings,
        max_turns: u32,
        signal_tx: mpsc::Sender<AgentSignal>,
    ) -> CoreResult<(Box<dyn ExecHandle>, CancellationToken)> {
        let spec = ExecSpec {
            cmd: self.config.agent_binary.clone(),
            args: Vec::new(),
            env: exec_env,
            workdir: Some(workdir),
        };

        let mut exec_stream = sandbox.exec_stream(spec).await?;

        let limiter = SessionTurnLimiter::new(
            self.sessions.streams().clone(),
            bindings.session_id.clone(),
            max_turns,
            self.config.warning_threshold,
        );
        let task_id = bindings.task_id.clone();
        let bridge = ContainerBridge::new(bindings, self.sessions.clone(), signal_tx, Some(limiter));
        let bridge_cancel = bridge.cancel_token();

        // Stderr is diagnostics only.
        let mut stderr = exec_stream.stderr;
        tokio::spawn(async move {
            while let Some(Ok(line)) = stderr.next().await {
                debug!(task_id = %task_id, line = %line, "agent stderr");
            }
        });

        tokio::spawn(bridge.run(exec_stream.stdout));

        Ok((exec_stream.handle, bridge_cancel))
    }

    /// Undo partial launch side effects: close a session we created and
    /// remove a worktree we created. Publishes nothing.
    async fn rollback_launch(&self, session_id: Option<&str>, worktree_id: Option<&str>) {
        if let Some(session_id) = session_id {
            if let Err(e) = self.sessions.close(session_id).await {
                warn!(session_id, error = %e, "rollback: failed to close session");
            }
        }
        if let Some(worktree_id) = worktree_id {
            if let Err(e) = self.worktrees.remove(worktree_id).await {
                warn!(worktree_id, error = %e, "rollback: failed to remove worktree");
            }
        }
    }

    /// Per-run state machine: consumes bridge signals until the run is
    /// finalized and the channel drains.
    async fn run_state_machine(self: Arc<Self>, task_id: String, mut rx: mpsc::Receiver<AgentSignal>) {
        while let Some(signal) = rx.recv().await {
            match signal {
                AgentSignal::PlanReady(data) => self.on_plan_ready(&task_id, data).await,
                AgentSignal::Complete { status, turn_count } => {
                    self.on_complete(&task_id, status, turn_count).await;
                }
                AgentSignal::Error {
                    message,
                    turn_count,
                } => self.on_error(&task_id, message, turn_count).await,
                AgentSignal::Eof { expected } => self.on_eof(&task_id, expected).await,
            }
        }
        debug!(task_id = %task_id, "run state machine drained");
    }

    /// `agent:plan_ready`: persist the plan, hold the pending record, keep
    /// the session open. Never a completion, never an error.
    async fn on_plan_ready(&self, task_id: &str, data: crate::events::PlanReadyData) {
        let task_lock = self.task_lock(task_id);
        let _guard = task_lock.lock().await;

        let session_id = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = running.get_mut(task_id) else {
                warn!(task_id, "plan_ready for unknown run, ignoring");
                return;
            };
            if entry.phase != Phase::Plan {
                warn!(task_id, "plan_ready during execute phase, ignoring");
                return;
            }
            entry.last_turn_count = data.turn_count;
            entry.sdk_session_id = Some(data.sdk_session_id.clone());
            entry.session_id.clone()
        };

        let options = PlanOptions {
            sdk_session_id: data.sdk_session_id.clone(),
            allowed_prompts: data.allowed_prompts.clone(),
        };
        if let Err(e) = self.tasks.persist_plan(task_id, &data.plan, &options).await {
            warn!(task_id, error = %e, "failed to persist plan");
            return;
        }

        self.pending_plans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                task_id.to_string(),
                PendingPlan {
                    task_id: task_id.to_string(),
                    session_id,
                    plan: data.plan,
                    turn_count: data.turn_count,
                    sdk_session_id: data.sdk_session_id,
                    allowed_prompts: data.allowed_prompts,
                },
            );

        info!(task_id, "plan ready, task waiting for approval");
    }

    /// Terminal `agent:complete` / `agent:cancelled`.
    async fn on_complete(&self, task_id: &str, status: CompleteStatus, turn_count: u32) {
        let task_lock = self.task_lock(task_id);
        let _guard = task_lock.lock().await;

        let entry = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.remove(task_id)
        };
        let Some(mut entry) = entry else {
            return;
        };
        entry.last_turn_count = turn_count;
        entry.bridge_cancel.cancel();

        match status {
            CompleteStatus::Completed => {
                if entry.phase == Phase::Execute {
                    match self
                        .worktrees
                        .commit_all(&entry.worktree_id, &format!("corral: task {task_id}"))
                        .await
                    {
                        Ok(true) => debug!(task_id, "agent work committed"),
                        Ok(false) => debug!(task_id, "no agent changes to commit"),
                        Err(e) => warn!(task_id, error = %e, "failed to commit agent work"),
                    }
                    if let Err(e) = self.tasks.transition(task_id, TaskTransition::Complete).await
                    {
                        warn!(task_id, error = %e, "failed to move completed task");
                    }
                }
                let _ = self
                    .tasks
                    .set_run_status(task_id, Some(AgentRunStatus::Completed))
                    .await;
                let _ = agents_db::update_agent_status(
                    &self.pool,
                    &entry.agent_id,
                    AgentStatus::Completed,
                    Some(task_id),
                )
                .await;
            }
            CompleteStatus::TurnLimit => {
                let _ = self
                    .tasks
                    .set_run_status(task_id, Some(AgentRunStatus::Error))
                    .await;
                let _ = agents_db::update_agent_status(
                    &self.pool,
                    &entry.agent_id,
                    AgentStatus::Error,
                    Some(task_id),
                )
                .await;
                let _ = audit::insert_audit(
                    &self.pool,
                    "task",
                    task_id,
                    "turn_limit",
                    Some(&json!({"code": "TURN_LIMIT_REACHED", "turnCount": turn_count})),
                )
                .await;
            }
            CompleteStatus::Cancelled => {
                self.finalize_cancelled(task_id, &entry).await;
                return;
            }
        }

        if let Err(e) = self.sessions.close(&entry.session_id).await {
            warn!(task_id, error = %e, "failed to close session");
        }
        info!(task_id, ?status, turn_count, "agent run finished");
    }

    /// Shared cancel bookkeeping for cooperative and hard-kill stops: the
    /// column reverts, the badge flips to cancelled, the session closes.
    async fn finalize_cancelled(&self, task_id: &str, entry: &RunningAgent) {
        if let Err(e) = self.tasks.transition(task_id, TaskTransition::Cancel).await {
            debug!(task_id, error = %e, "cancel transition not applicable");
        }
        let _ = self
            .tasks
            .set_run_status(task_id, Some(AgentRunStatus::Cancelled))
            .await;
        let _ = agents_db::update_agent_status(&self.pool, &entry.agent_id, AgentStatus::Idle, None)
            .await;
        if let Err(e) = self.sessions.close(&entry.session_id).await {
            warn!(task_id, error = %e, "failed to close session");
        }
        let _ = audit::insert_audit(&self.pool, "task", task_id, "agent_cancelled", None).await;
        info!(task_id, "agent run cancelled");
    }

    /// `agent:error`: consult the recovery policy; restart within the same
    /// sandbox when retryable, finalize otherwise.
    async fn on_error(&self, task_id: &str, message: String, turn_count: u32) {
        let task_lock = self.task_lock(task_id);
        let guard = task_lock.lock().await;

        let retry = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = running.get_mut(task_id) else {
                return;
            };
            entry.last_turn_count = turn_count;

            let decision = handle_agent_error(&message, turn_count, entry.max_turns);
            let can_retry = decision.should_retry
                && entry.attempt < self.config.retry.max_retries
                && !entry.stop_requested;
            if can_retry {
                entry.attempt += 1;
                Some((decision, entry.attempt, entry.session_id.clone()))
            } else {
                None
            }
        };

        let Some((decision, attempt, session_id)) = retry else {
            self.finalize_error(task_id, &message).await;
            return;
        };

        // Status breadcrumb on the stream; the retry itself is silent at
        // the task level.
        let _ = self.sessions.publish(
            &session_id,
            "container-agent:status",
            json!({
                "stage": "retrying",
                "message": decision.message,
                "attempt": attempt,
                "taskId": task_id,
            }),
        );

        let delay = self.config.retry.jittered_delay_for(attempt - 1);
        info!(
            task_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "restarting agent after retryable error"
        );
        drop(guard);
        tokio::time::sleep(delay).await;

        let _guard = task_lock.lock().await;
        if let Err(e) = self.relaunch(task_id).await {
            warn!(task_id, error = %e, "relaunch failed");
            self.finalize_error(task_id, &format!("relaunch failed: {e}")).await;
        }
    }

    /// Restart the exec for a still-registered run, resuming the SDK
    /// session recorded at plan time when available.
    async fn relaunch(&self, task_id: &str) -> CoreResult<()> {
        let Some((sandbox, exec_env, workdir, bindings, max_turns, signal_tx)) = ({
            let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.get(task_id).filter(|e| !e.stop_requested).map(|entry| {
                let mut exec_env = entry.exec_env.clone();
                if let Some(sdk) = &entry.sdk_session_id {
                    exec_env.insert(env::RESUME_SESSION.to_string(), sdk.clone());
                }
                (
                    Arc::clone(&entry.sandbox),
                    exec_env,
                    entry.workdir.clone(),
                    BridgeBindings {
                        task_id: task_id.to_string(),
                        session_id: entry.session_id.clone(),
                        project_id: entry.project_id.clone(),
                    },
                    entry.max_turns,
                    entry.signal_tx.clone(),
                )
            })
        }) else {
            // Stopped or finalized during the backoff sleep.
            return Ok(());
        };

        let (exec_handle, bridge_cancel) = self
            .launch_exec(&sandbox, exec_env, workdir, bindings, max_turns, signal_tx)
            .await?;

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = running.get_mut(task_id) {
            entry.exec = Some(exec_handle);
            entry.bridge_cancel = bridge_cancel;
        }
        Ok(())
    }

    /// Terminal error: the bridge already published `container-agent:error`;
    /// here the task flips its badge and the run tears down.
    async fn finalize_error(&self, task_id: &str, message: &str) {
        let entry = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.remove(task_id)
        };
        let Some(entry) = entry else {
            return;
        };
        entry.bridge_cancel.cancel();

        let _ = self
            .tasks
            .set_run_status(task_id, Some(AgentRunStatus::Error))
            .await;
        let _ = agents_db::update_agent_status(
            &self.pool,
            &entry.agent_id,
            AgentStatus::Error,
            Some(task_id),
        )
        .await;
        if let Err(e) = self.sessions.close(&entry.session_id).await {
            warn!(task_id, error = %e, "failed to close session");
        }
        let _ = audit::insert_audit(
            &self.pool,
            "task",
            task_id,
            "agent_error",
            Some(&json!({"error": message})),
        )
        .await;
        warn!(task_id, error = message, "agent run failed");
    }

    /// Stdout closed. A clean exit after `plan_ready` ends the plan run
    /// without closing the session; an exit without any terminal event is
    /// an error.
    async fn on_eof(&self, task_id: &str, expected: bool) {
        let task_lock = self.task_lock(task_id);
        let _guard = task_lock.lock().await;

        if expected {
            let has_pending = self
                .pending_plans
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(task_id);

            let plan_run_over = {
                let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
                matches!(
                    running.get(task_id),
                    Some(entry) if entry.phase == Phase::Plan
                ) && has_pending
            };

            if plan_run_over {
                let entry = {
                    let mut running =
                        self.running.lock().unwrap_or_else(|e| e.into_inner());
                    running.remove(task_id)
                };
                if let Some(entry) = entry {
                    entry.bridge_cancel.cancel();
                    // The session stays open: the execute phase resumes it.
                    debug!(task_id, "plan run ended, awaiting approval");
                }
            }
            return;
        }

        let session_info = {
            let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running
                .get(task_id)
                .map(|entry| (entry.session_id.clone(), entry.project_id.clone(), entry.last_turn_count))
        };
        let Some((session_id, project_id, turn_count)) = session_info else {
            return;
        };

        let message = "agent exited without a terminal event";
        let _ = self.sessions.publish(
            &session_id,
            "container-agent:error",
            json!({
                "error": message,
                "turnCount": turn_count,
                "taskId": task_id,
                "sessionId": session_id,
                "projectId": project_id,
            }),
        );
        self.finalize_error(task_id, message).await;
    }
}
