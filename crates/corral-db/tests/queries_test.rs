//! Integration tests for the corral-db query layer.

use corral_db::config::DbConfig;
use corral_db::models::{
    AgentConfig, AgentRunStatus, AgentStatus, PlanOptions, ProjectConfig, SandboxStatus,
    SessionStatus, TaskColumn, WorktreeStatus,
};
use corral_db::pool;
use corral_db::queries::{agents, api_keys, audit, projects, sandboxes, sessions, tasks, worktrees};
use sqlx::SqlitePool;

/// Create a pool over a fresh temp-file database with the schema applied.
async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = DbConfig::new(dir.path().join("corral-test.db"));
    let pool = pool::open(&config).await.expect("failed to open test db");
    (pool, dir)
}

async fn seed_project(pool: &SqlitePool) -> corral_db::models::Project {
    projects::insert_project(pool, "demo", "/tmp/demo", &ProjectConfig::default(), 2)
        .await
        .expect("insert project failed")
}

// -- projects ---------------------------------------------------------------

#[tokio::test]
async fn project_insert_and_get() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;

    let fetched = projects::get_project(&pool, &project.id)
        .await
        .unwrap()
        .expect("project should exist");
    assert_eq!(fetched.name, "demo");
    assert_eq!(fetched.max_concurrent_agents, 2);
    assert_eq!(fetched.config().unwrap(), ProjectConfig::default());
}

#[tokio::test]
async fn project_delete_refused_with_active_session() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let _session = sessions::insert_session(&pool, &project.id, None, None, "s")
        .await
        .unwrap();

    let result = projects::delete_project(&pool, &project.id).await;
    assert!(result.is_err(), "delete should fail with an active session");
}

#[tokio::test]
async fn project_delete_after_sessions_closed() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let session = sessions::insert_session(&pool, &project.id, None, None, "s")
        .await
        .unwrap();
    sessions::close_session(&pool, &session.id).await.unwrap();

    projects::delete_project(&pool, &project.id)
        .await
        .expect("delete should succeed once sessions are closed");
    assert!(projects::get_project(&pool, &project.id)
        .await
        .unwrap()
        .is_none());
}

// -- tasks ------------------------------------------------------------------

#[tokio::test]
async fn task_insert_defaults_to_backlog_tail() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;

    let first = tasks::insert_task(&pool, &project.id, "one", "", None)
        .await
        .unwrap();
    let second = tasks::insert_task(&pool, &project.id, "two", "", None)
        .await
        .unwrap();

    assert_eq!(first.column, TaskColumn::Backlog);
    assert_eq!(first.position, 0);
    assert_eq!(second.position, 1);
    assert!(first.plan.is_none());
    assert!(first.last_agent_status.is_none());
}

#[tokio::test]
async fn task_transition_column_optimistic_lock() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let task = tasks::insert_task(&pool, &project.id, "t", "", None)
        .await
        .unwrap();

    let rows = tasks::transition_column(&pool, &task.id, TaskColumn::Backlog, TaskColumn::InProgress)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Re-running the same transition finds the wrong current column.
    let rows = tasks::transition_column(&pool, &task.id, TaskColumn::Backlog, TaskColumn::InProgress)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn task_persist_and_clear_plan() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let task = tasks::insert_task(&pool, &project.id, "t", "", None)
        .await
        .unwrap();
    tasks::transition_column(&pool, &task.id, TaskColumn::Backlog, TaskColumn::InProgress)
        .await
        .unwrap();

    let options = PlanOptions {
        sdk_session_id: "sdk-1".to_string(),
        allowed_prompts: vec![],
    };
    let rows = tasks::persist_plan(&pool, &task.id, "the plan", &options)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let task = tasks::get_task(&pool, &task.id).await.unwrap().unwrap();
    assert_eq!(task.column, TaskColumn::WaitingApproval);
    assert_eq!(task.plan.as_deref(), Some("the plan"));
    assert_eq!(task.last_agent_status, Some(AgentRunStatus::Planning));
    assert_eq!(
        task.plan_options().unwrap().unwrap().sdk_session_id,
        "sdk-1"
    );

    let rows = tasks::clear_plan(&pool, &task.id).await.unwrap();
    assert_eq!(rows, 1);

    let task = tasks::get_task(&pool, &task.id).await.unwrap().unwrap();
    assert_eq!(task.column, TaskColumn::Backlog);
    assert!(task.plan.is_none());
    assert!(task.plan_options.is_none());
    assert!(task.last_agent_status.is_none());
}

#[tokio::test]
async fn task_persist_plan_requires_in_progress() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let task = tasks::insert_task(&pool, &project.id, "t", "", None)
        .await
        .unwrap();

    let options = PlanOptions {
        sdk_session_id: "sdk-1".to_string(),
        allowed_prompts: vec![],
    };
    // Task is still in backlog: the guarded update touches nothing.
    let rows = tasks::persist_plan(&pool, &task.id, "plan", &options)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn task_run_refs_and_status() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let task = tasks::insert_task(&pool, &project.id, "t", "", None)
        .await
        .unwrap();

    tasks::set_run_refs(&pool, &task.id, Some("agent-1"), Some("sess-1"), Some("wt-1"))
        .await
        .unwrap();
    tasks::set_last_agent_status(
        &pool,
        &task.id,
        Some(AgentRunStatus::Completed),
        Some(chrono::Utc::now()),
    )
    .await
    .unwrap();

    let task = tasks::get_task(&pool, &task.id).await.unwrap().unwrap();
    assert_eq!(task.agent_id.as_deref(), Some("agent-1"));
    assert_eq!(task.session_id.as_deref(), Some("sess-1"));
    assert_eq!(task.worktree_id.as_deref(), Some("wt-1"));
    assert_eq!(task.last_agent_status, Some(AgentRunStatus::Completed));
    assert!(task.completed_at.is_some());

    tasks::clear_session_ref(&pool, &task.id).await.unwrap();
    let task = tasks::get_task(&pool, &task.id).await.unwrap().unwrap();
    assert!(task.session_id.is_none());
}

// -- sessions ---------------------------------------------------------------

#[tokio::test]
async fn session_close_is_idempotent() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let session = sessions::insert_session(&pool, &project.id, None, None, "run")
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.closed_at.is_none());

    let closed = sessions::close_session(&pool, &session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.status, SessionStatus::Closed);
    let first_stamp = closed.closed_at.expect("closed_at should be set");

    let closed_again = sessions::close_session(&pool, &session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed_again.closed_at, Some(first_stamp));
}

// -- agents -----------------------------------------------------------------

#[tokio::test]
async fn agent_status_requires_task_when_busy() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;
    let agent = agents::insert_agent(&pool, &project.id, "container", &AgentConfig::default())
        .await
        .unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);

    let result = agents::update_agent_status(&pool, &agent.id, AgentStatus::Running, None).await;
    assert!(result.is_err(), "running without a task should be rejected");

    agents::update_agent_status(&pool, &agent.id, AgentStatus::Running, Some("task-1"))
        .await
        .unwrap();
    let agent = agents::get_agent(&pool, &agent.id).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Running);
    assert_eq!(agent.current_task_id.as_deref(), Some("task-1"));
}

// -- worktrees --------------------------------------------------------------

#[tokio::test]
async fn worktree_lifecycle_rows() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;

    let worktree = worktrees::insert_worktree(
        &pool,
        &project.id,
        Some("task-1"),
        None,
        None,
        "corral/task-1",
        "/tmp/demo/.corral/worktrees/task-1",
        "main",
    )
    .await
    .unwrap();
    assert_eq!(worktree.status, WorktreeStatus::Active);

    worktrees::update_worktree_status(&pool, &worktree.id, WorktreeStatus::Merged)
        .await
        .unwrap();

    let active = worktrees::list_worktrees_for_project(&pool, &project.id, Some(WorktreeStatus::Active))
        .await
        .unwrap();
    assert!(active.is_empty());

    let all = worktrees::list_worktrees_for_project(&pool, &project.id, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, WorktreeStatus::Merged);
}

// -- sandboxes --------------------------------------------------------------

#[tokio::test]
async fn sandbox_status_updates() {
    let (pool, _dir) = test_pool().await;
    let project = seed_project(&pool).await;

    let sandbox = sandboxes::insert_sandbox(&pool, &project.id).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Creating);

    sandboxes::update_sandbox_status(&pool, &sandbox.id, SandboxStatus::Running)
        .await
        .unwrap();

    let fetched = sandboxes::get_sandbox_for_project(&pool, &project.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.status, SandboxStatus::Running);
    assert_eq!(fetched.id, sandbox.id);
}

// -- api keys ---------------------------------------------------------------

#[tokio::test]
async fn api_key_upsert_replaces() {
    let (pool, _dir) = test_pool().await;

    api_keys::upsert_api_key(&pool, "anthropic", "tok-1", None)
        .await
        .unwrap();
    api_keys::upsert_api_key(&pool, "anthropic", "tok-2", Some("work"))
        .await
        .unwrap();

    let key = api_keys::get_api_key(&pool, "anthropic")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key.token, "tok-2");
    assert_eq!(key.label.as_deref(), Some("work"));

    assert!(api_keys::delete_api_key(&pool, "anthropic").await.unwrap());
    assert!(api_keys::get_api_key(&pool, "anthropic")
        .await
        .unwrap()
        .is_none());
}

// -- audit ------------------------------------------------------------------

#[tokio::test]
async fn audit_entries_ordered() {
    let (pool, _dir) = test_pool().await;

    audit::insert_audit(&pool, "task", "task-1", "move", None)
        .await
        .unwrap();
    audit::insert_audit(
        &pool,
        "task",
        "task-1",
        "approve",
        Some(&serde_json::json!({"by": "alice"})),
    )
    .await
    .unwrap();

    let entries = audit::list_audit_for_entity(&pool, "task", "task-1")
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, "move");
    assert_eq!(entries[1].action, "approve");
    assert!(entries[1].detail.as_deref().unwrap().contains("alice"));
}
