//! End-to-end orchestrator tests.
//!
//! Each test drives the real orchestrator against the local sandbox
//! backend with a scripted fake agent, the same way the Claude binary
//! would behave: line-framed JSON on stdout, env-var contract, stop-file
//! polling.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tempfile::TempDir;

use corral_core::credentials::CredentialResolver;
use corral_core::error::ErrorCode;
use corral_core::orchestrator::{AgentOrchestrator, OrchestratorConfig};
use corral_core::recovery::RetryPolicy;
use corral_core::sandbox::local::LocalProvider;
use corral_core::session::SessionService;
use corral_core::streams::StreamService;
use corral_core::tasks::TaskService;
use corral_core::worktree::WorktreeService;

use corral_db::config::DbConfig;
use corral_db::models::{
    AgentRunStatus, ProjectConfig, SandboxStatus, SessionStatus, Task, TaskColumn, WorktreeStatus,
};
use corral_db::queries::{api_keys, projects, tasks as tasks_db};

/// Shell prologue shared by every fake agent: an `emit` function that
/// frames an event for the current task/session.
const EMIT: &str = r#"emit() {
  printf '{"type":"%s","timestamp":1,"taskId":"%s","sessionId":"%s","data":%s}\n' \
    "$1" "$CORRAL_TASK_ID" "$CORRAL_SESSION_ID" "$2"
}
"#;

struct Harness {
    _dir: TempDir,
    pool: SqlitePool,
    orchestrator: AgentOrchestrator,
    streams: StreamService,
    provider: Arc<LocalProvider>,
    project_id: String,
    repo_path: PathBuf,
}

struct SetupOptions {
    max_concurrent: i64,
    with_api_key: bool,
    stop_grace: Duration,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            with_api_key: true,
            stop_grace: Duration::from_millis(600),
        }
    }
}

fn git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn create_repo(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
    git(path, &["init", "-b", "main"]);
    git(path, &["config", "user.email", "test@corral.dev"]);
    git(path, &["config", "user.name", "Corral Test"]);
    std::fs::write(path.join("README.md"), "# demo\n").unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "-m", "initial commit"]);
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{EMIT}{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

async fn setup(script_body: &str, options: SetupOptions) -> Harness {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let repo_path = dir.path().join("repo");
    create_repo(&repo_path);

    let pool = corral_db::pool::open(&DbConfig::new(dir.path().join("corral.db")))
        .await
        .expect("failed to open test db");

    let project = projects::insert_project(
        &pool,
        "demo",
        &repo_path.to_string_lossy(),
        &ProjectConfig::default(),
        options.max_concurrent,
    )
    .await
    .unwrap();

    if options.with_api_key {
        api_keys::upsert_api_key(&pool, "anthropic", "test-token", None)
            .await
            .unwrap();
    }

    let script = write_script(dir.path(), script_body);

    let streams = StreamService::new();
    let sessions = SessionService::new(pool.clone(), streams.clone());
    let worktrees = WorktreeService::new(pool.clone());
    let tasks = TaskService::new(pool.clone());
    // Point the file fallback at a path that never exists so the host's
    // own credentials cannot leak into the test.
    let credentials = CredentialResolver::new(pool.clone())
        .with_credentials_path(dir.path().join("no-credentials.json"));
    let provider = Arc::new(LocalProvider::new());

    let config = OrchestratorConfig {
        agent_binary: script.to_string_lossy().into_owned(),
        stop_grace: options.stop_grace,
        retry: RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(50),
        },
        ..Default::default()
    };

    let orchestrator = AgentOrchestrator::new(
        pool.clone(),
        provider.clone(),
        sessions,
        worktrees,
        tasks,
        credentials,
        config,
    );

    Harness {
        _dir: dir,
        pool,
        orchestrator,
        streams,
        provider,
        project_id: project.id,
        repo_path,
    }
}

impl Harness {
    async fn add_task(&self, title: &str) -> Task {
        tasks_db::insert_task(&self.pool, &self.project_id, title, "do the thing", None)
            .await
            .unwrap()
    }

    async fn task(&self, task_id: &str) -> Task {
        tasks_db::get_task(&self.pool, task_id)
            .await
            .unwrap()
            .expect("task should exist")
    }

    /// Poll until the task satisfies `predicate` (5s budget).
    async fn wait_for_task(&self, task_id: &str, predicate: impl Fn(&Task) -> bool) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.task(task_id).await;
            if predicate(&task) {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for task {task_id}; column={} status={:?}",
                    task.column, task.last_agent_status
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_not_running(&self, task_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.orchestrator.is_agent_running(task_id) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for run of {task_id} to end");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn stream_kinds(&self, session_id: &str) -> Vec<String> {
        self.streams
            .get_events(session_id)
            .map(|events| events.into_iter().map(|e| e.kind).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Scenario: plan then approve
// ---------------------------------------------------------------------------

const PLAN_THEN_EXECUTE: &str = r#"if [ "$CORRAL_PHASE" = "plan" ]; then
  emit "agent:started" '{"model":"m","maxTurns":50}'
  emit "agent:turn" '{"turn":1,"maxTurns":50,"remaining":49}'
  emit "agent:plan_ready" '{"plan":"P","turnCount":1,"sdkSessionId":"sdk-1"}'
else
  printf '%s' "$CLAUDE_RESUME_SESSION" > resume-session.txt
  emit "agent:started" '{"model":"m","maxTurns":50}'
  emit "agent:complete" '{"status":"completed","turnCount":2}'
fi
"#;

#[tokio::test]
async fn plan_then_approve_lifecycle() {
    let harness = setup(PLAN_THEN_EXECUTE, SetupOptions::default()).await;
    let task = harness.add_task("add feature").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();

    // Plan lands: waiting_approval with plan + options persisted.
    let task_row = harness
        .wait_for_task(&task.id, |t| t.column == TaskColumn::WaitingApproval)
        .await;
    assert_eq!(task_row.plan.as_deref(), Some("P"));
    assert_eq!(task_row.last_agent_status, Some(AgentRunStatus::Planning));
    let options = task_row.plan_options().unwrap().unwrap();
    assert_eq!(options.sdk_session_id, "sdk-1");

    let session_id = task_row.session_id.clone().expect("session attached");
    harness.wait_not_running(&task.id).await;

    // Stream: started + turn republished, plan_ready suppressed, no error.
    let kinds = harness.stream_kinds(&session_id);
    assert!(kinds.contains(&"container-agent:started".to_string()));
    assert!(kinds.contains(&"container-agent:turn".to_string()));
    assert!(!kinds.iter().any(|k| k.contains("plan_ready")));
    assert!(!kinds.iter().any(|k| k.contains("error")));

    // The session survives plan completion so execute can resume it.
    let session = corral_db::queries::sessions::get_session(&harness.pool, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(harness.orchestrator.pending_plan(&task.id).is_some());

    // Approve: column flips to in_progress, execute runs, and the agent
    // resumed the SDK session captured at plan time.
    harness
        .orchestrator
        .approve_plan(&task.id, Some("alice"))
        .await
        .unwrap();

    let task_row = harness
        .wait_for_task(&task.id, |t| {
            t.column == TaskColumn::WaitingApproval
                && t.last_agent_status == Some(AgentRunStatus::Completed)
        })
        .await;
    assert!(task_row.approved_at.is_some());
    assert_eq!(task_row.approved_by.as_deref(), Some("alice"));
    assert!(harness.orchestrator.pending_plan(&task.id).is_none());

    let worktree_dir = harness
        .repo_path
        .join(".corral/worktrees")
        .join(&task.id);
    let resumed = std::fs::read_to_string(worktree_dir.join("resume-session.txt")).unwrap();
    assert_eq!(resumed, "sdk-1");

    harness.wait_not_running(&task.id).await;
    let kinds = harness.stream_kinds(&session_id);
    assert!(kinds.contains(&"container-agent:complete".to_string()));

    let session = corral_db::queries::sessions::get_session(&harness.pool, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Closed);

    // A second approve with the pending plan cleared is refused.
    let err = harness
        .orchestrator
        .approve_plan(&task.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PlanNotPending);

    // Operator signs off.
    harness.orchestrator.verify_task(&task.id).await.unwrap();
    assert_eq!(harness.task(&task.id).await.column, TaskColumn::Verified);
}

// ---------------------------------------------------------------------------
// Scenario: reject is clean
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reject_clears_plan_without_error_event() {
    let harness = setup(PLAN_THEN_EXECUTE, SetupOptions::default()).await;
    let task = harness.add_task("doomed idea").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();
    let task_row = harness
        .wait_for_task(&task.id, |t| t.column == TaskColumn::WaitingApproval)
        .await;
    let session_id = task_row.session_id.clone().unwrap();
    harness.wait_not_running(&task.id).await;

    harness.orchestrator.reject_plan(&task.id).await.unwrap();

    let task_row = harness.task(&task.id).await;
    assert_eq!(task_row.column, TaskColumn::Backlog);
    assert!(task_row.plan.is_none());
    assert!(task_row.plan_options.is_none());
    assert!(task_row.last_agent_status.is_none());
    assert!(harness.orchestrator.pending_plan(&task.id).is_none());

    // No error event was published anywhere on the stream.
    let kinds = harness.stream_kinds(&session_id);
    assert!(!kinds.iter().any(|k| k.contains("error")));

    // Rejecting again is refused.
    let err = harness.orchestrator.reject_plan(&task.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PlanNotPending);
}

// ---------------------------------------------------------------------------
// Scenario: concurrency gate
// ---------------------------------------------------------------------------

const HANG: &str = r#"emit "agent:started" '{"model":"m","maxTurns":50}'
sleep 30
"#;

#[tokio::test]
async fn concurrency_gate_admits_up_to_limit() {
    let harness = setup(HANG, SetupOptions::default()).await;
    let task1 = harness.add_task("one").await;
    let task2 = harness.add_task("two").await;
    let task3 = harness.add_task("three").await;

    harness.orchestrator.start_task(&task1.id).await.unwrap();
    harness.orchestrator.start_task(&task2.id).await.unwrap();

    let err = harness.orchestrator.start_task(&task3.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ConcurrencyLimit);
    // The failed start rolled the column back.
    assert_eq!(harness.task(&task3.id).await.column, TaskColumn::Backlog);

    // Releasing one slot admits the third task.
    harness.orchestrator.stop_agent(&task1.id).await.unwrap();
    harness.wait_not_running(&task1.id).await;

    harness.orchestrator.start_task(&task3.id).await.unwrap();
    assert!(harness.orchestrator.is_agent_running(&task3.id));

    harness.orchestrator.stop_agent(&task2.id).await.unwrap();
    harness.orchestrator.stop_agent(&task3.id).await.unwrap();
}

#[tokio::test]
async fn duplicate_start_is_rejected() {
    let harness = setup(HANG, SetupOptions::default()).await;
    let task = harness.add_task("solo").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();
    let err = harness
        .orchestrator
        .start_agent(corral_core::orchestrator::StartAgentInput {
            project_id: harness.project_id.clone(),
            task_id: task.id.clone(),
            session_id: None,
            prompt: "again".to_string(),
            model: None,
            max_turns: None,
            phase: corral_core::orchestrator::Phase::Plan,
            resume: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AgentAlreadyRunning);

    harness.orchestrator.stop_agent(&task.id).await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario: cooperative stop and hard-kill fallback
// ---------------------------------------------------------------------------

const COOPERATIVE: &str = r#"emit "agent:started" '{"model":"m","maxTurns":50}'
i=0
while [ $i -lt 200 ]; do
  if [ -f "$CORRAL_STOP_FILE" ]; then
    emit "agent:cancelled" '{"turnCount":1}'
    exit 0
  fi
  sleep 0.05
  i=$((i+1))
done
"#;

#[tokio::test]
async fn cooperative_stop_via_stop_file() {
    let harness = setup(
        COOPERATIVE,
        SetupOptions {
            stop_grace: Duration::from_secs(3),
            ..Default::default()
        },
    )
    .await;
    let task = harness.add_task("stoppable").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();
    let task_row = harness
        .wait_for_task(&task.id, |t| t.session_id.is_some())
        .await;
    let session_id = task_row.session_id.unwrap();

    harness.orchestrator.stop_agent(&task.id).await.unwrap();
    harness.wait_not_running(&task.id).await;

    // The agent saw the stop-file and emitted agent:cancelled itself.
    let kinds = harness.stream_kinds(&session_id);
    assert!(kinds.contains(&"container-agent:cancelled".to_string()));

    let task_row = harness
        .wait_for_task(&task.id, |t| {
            t.last_agent_status == Some(AgentRunStatus::Cancelled)
        })
        .await;
    assert_eq!(task_row.column, TaskColumn::Backlog);

    let session = corral_db::queries::sessions::get_session(&harness.pool, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Closed);
}

#[tokio::test]
async fn stop_hard_kills_after_grace() {
    // The hang script never reads the stop-file.
    let harness = setup(
        HANG,
        SetupOptions {
            stop_grace: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .await;
    let task = harness.add_task("stubborn").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();
    let task_row = harness
        .wait_for_task(&task.id, |t| t.session_id.is_some())
        .await;
    let session_id = task_row.session_id.unwrap();

    harness.orchestrator.stop_agent(&task.id).await.unwrap();

    assert!(!harness.orchestrator.is_agent_running(&task.id));
    // A cancelled event was synthesized locally since the agent never
    // emitted one.
    let kinds = harness.stream_kinds(&session_id);
    assert!(kinds.contains(&"container-agent:cancelled".to_string()));

    let task_row = harness.task(&task.id).await;
    assert_eq!(task_row.column, TaskColumn::Backlog);
    assert_eq!(task_row.last_agent_status, Some(AgentRunStatus::Cancelled));
}

#[tokio::test]
async fn stop_without_run_is_idempotent() {
    let harness = setup(HANG, SetupOptions::default()).await;
    let task = harness.add_task("never started").await;
    harness.orchestrator.stop_agent(&task.id).await.unwrap();
    assert_eq!(harness.task(&task.id).await.column, TaskColumn::Backlog);
}

// ---------------------------------------------------------------------------
// Scenario: retryable error restarts within the same sandbox
// ---------------------------------------------------------------------------

const RATE_LIMITED_ONCE: &str = r#"if [ ! -f attempted ]; then
  touch attempted
  emit "agent:started" '{"model":"m","maxTurns":50}'
  emit "agent:error" '{"error":"Rate limit exceeded","turnCount":3}'
else
  emit "agent:started" '{"model":"m","maxTurns":50}'
  emit "agent:plan_ready" '{"plan":"P2","turnCount":4,"sdkSessionId":"sdk-2"}'
fi
"#;

#[tokio::test]
async fn retryable_error_restarts_and_reaches_plan() {
    let harness = setup(RATE_LIMITED_ONCE, SetupOptions::default()).await;
    let task = harness.add_task("flaky start").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();

    // Despite the first attempt's rate limit, the run converges on a plan
    // and no terminal error is surfaced to the task.
    let task_row = harness
        .wait_for_task(&task.id, |t| t.column == TaskColumn::WaitingApproval)
        .await;
    assert_eq!(task_row.plan.as_deref(), Some("P2"));
    assert_eq!(task_row.last_agent_status, Some(AgentRunStatus::Planning));

    let session_id = task_row.session_id.unwrap();
    let kinds = harness.stream_kinds(&session_id);
    // The bridge republished the error event and the orchestrator left a
    // retry breadcrumb; the task itself never flipped to error.
    assert!(kinds.contains(&"container-agent:error".to_string()));
    assert!(kinds.contains(&"container-agent:status".to_string()));

    let pending = harness.orchestrator.pending_plan(&task.id).unwrap();
    assert_eq!(pending.sdk_session_id, "sdk-2");
}

const ALWAYS_FATAL: &str = r#"emit "agent:started" '{"model":"m","maxTurns":50}'
emit "agent:error" '{"error":"invalid api key","turnCount":1}'
"#;

#[tokio::test]
async fn fatal_error_finalizes_the_run() {
    let harness = setup(ALWAYS_FATAL, SetupOptions::default()).await;
    let task = harness.add_task("broken").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();

    let task_row = harness
        .wait_for_task(&task.id, |t| {
            t.last_agent_status == Some(AgentRunStatus::Error)
        })
        .await;
    // The task stays in its column with an error badge; the user decides.
    assert_eq!(task_row.column, TaskColumn::InProgress);
    harness.wait_not_running(&task.id).await;

    let session_id = task_row.session_id.unwrap();
    let session = corral_db::queries::sessions::get_session(&harness.pool, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Closed);
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

const SILENT_EXIT: &str = "exit 0\n";

#[tokio::test]
async fn exit_without_terminal_event_is_an_error() {
    let harness = setup(SILENT_EXIT, SetupOptions::default()).await;
    let task = harness.add_task("ghost").await;

    harness.orchestrator.start_task(&task.id).await.unwrap();

    let task_row = harness
        .wait_for_task(&task.id, |t| {
            t.last_agent_status == Some(AgentRunStatus::Error)
        })
        .await;
    let session_id = task_row.session_id.unwrap();
    let kinds = harness.stream_kinds(&session_id);
    assert!(kinds.contains(&"container-agent:error".to_string()));
    assert!(!harness.orchestrator.is_agent_running(&task.id));
}

#[tokio::test]
async fn missing_credentials_refuse_launch() {
    let harness = setup(
        HANG,
        SetupOptions {
            with_api_key: false,
            ..Default::default()
        },
    )
    .await;
    let task = harness.add_task("no key").await;

    let err = harness.orchestrator.start_task(&task.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ApiKeyNotConfigured);
    assert_eq!(harness.task(&task.id).await.column, TaskColumn::Backlog);
}

#[tokio::test]
async fn stopped_sandbox_refuses_launch_and_rolls_back() {
    let harness = setup(HANG, SetupOptions::default()).await;
    let task = harness.add_task("nowhere to run").await;

    // Pre-create the project sandbox and stop it.
    use corral_core::sandbox::{SandboxConfig, SandboxProvider};
    harness
        .provider
        .create(&harness.project_id, &SandboxConfig::default())
        .await
        .unwrap();
    harness
        .provider
        .sandbox(&harness.project_id)
        .unwrap()
        .set_status(SandboxStatus::Stopped);

    let err = harness.orchestrator.start_task(&task.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::SandboxUnavailable);

    let task_row = harness.task(&task.id).await;
    assert_eq!(task_row.column, TaskColumn::Backlog);

    // Launch rollback: the session we created is closed and the worktree
    // row is marked removed.
    if let Some(session_id) = task_row.session_id {
        let session = corral_db::queries::sessions::get_session(&harness.pool, &session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Closed);
    }
    if let Some(worktree_id) = task_row.worktree_id {
        let worktree = corral_db::queries::worktrees::get_worktree(&harness.pool, &worktree_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worktree.status, WorktreeStatus::Removed);
    }
}
