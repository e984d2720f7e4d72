//! `corral task` subcommands: board management plus the agent lifecycle.
//!
//! Streams live in the orchestrating process, so lifecycle commands that
//! launch agents (`run`, `approve`) stay attached and print the session
//! stream as it flows.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use futures::StreamExt;
use sqlx::SqlitePool;

use corral_core::credentials::CredentialResolver;
use corral_core::orchestrator::{AgentOrchestrator, OrchestratorConfig};
use corral_core::sandbox::docker::DockerProvider;
use corral_core::sandbox::local::LocalProvider;
use corral_core::sandbox::{SandboxConfig, SandboxProvider};
use corral_core::session::SessionService;
use corral_core::streams::StreamService;
use corral_core::tasks::TaskService;
use corral_core::worktree::WorktreeService;

use corral_db::queries::tasks as tasks_db;

use crate::config;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Add a task to a project's backlog
    Add {
        /// Project id
        project_id: String,
        /// Task title
        title: String,
        /// Longer description handed to the agent
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List a project's tasks
    List {
        /// Project id
        project_id: String,
    },
    /// Show one task
    Show {
        /// Task id
        task_id: String,
    },
    /// Start the plan phase and follow the session stream
    Run {
        /// Task id
        task_id: String,
    },
    /// Approve the pending plan and follow the execute phase
    Approve {
        /// Task id
        task_id: String,
        /// Recorded approver
        #[arg(long)]
        by: Option<String>,
    },
    /// Reject the pending plan (clears it, returns the task to backlog)
    Reject {
        /// Task id
        task_id: String,
    },
    /// Mark a reviewed task verified
    Verify {
        /// Task id
        task_id: String,
    },
    /// Cancel a task's run and return it to backlog
    Cancel {
        /// Task id
        task_id: String,
    },
}

/// Wire the full orchestrator stack for one CLI invocation.
pub(crate) fn build_orchestrator(pool: &SqlitePool) -> Result<AgentOrchestrator> {
    let file = config::load_config()?;

    let provider: Arc<dyn SandboxProvider> = match file.agent.sandbox.as_str() {
        "local" => Arc::new(LocalProvider::new()),
        _ => Arc::new(DockerProvider::new()),
    };

    let streams = StreamService::new();
    let sessions = SessionService::new(pool.clone(), streams);
    let worktrees = WorktreeService::new(pool.clone());
    let tasks = TaskService::new(pool.clone());
    let credentials = CredentialResolver::new(pool.clone());

    let config = OrchestratorConfig {
        agent_binary: file.agent.binary,
        sandbox: SandboxConfig {
            image: file.agent.image,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(AgentOrchestrator::new(
        pool.clone(),
        provider,
        sessions,
        worktrees,
        tasks,
        credentials,
        config,
    ))
}

/// Print the session stream until the run ends and the stream drains.
async fn follow_run(orchestrator: &AgentOrchestrator, pool: &SqlitePool, task_id: &str) -> Result<()> {
    // The session id appears on the task row once the launch registers.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let session_id = loop {
        let task = tasks_db::get_task(pool, task_id)
            .await?
            .context("task vanished")?;
        if let Some(session_id) = task.session_id {
            break session_id;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("run never attached a session to task {task_id}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let mut subscription = orchestrator
        .sessions()
        .subscribe(&session_id, 0)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    loop {
        match tokio::time::timeout(Duration::from_millis(300), subscription.next()).await {
            Ok(Some(Ok(event))) => println!("{}", serde_json::to_string(&event)?),
            Ok(Some(Err(e))) => {
                eprintln!("stream terminated: {e}");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                if !orchestrator.is_agent_running(task_id) {
                    break;
                }
            }
        }
    }

    let task = tasks_db::get_task(pool, task_id)
        .await?
        .context("task vanished")?;
    println!(
        "task {}: column={} status={}",
        task.id,
        task.column,
        task.last_agent_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    if orchestrator.pending_plan(task_id).is_some() {
        println!("plan is waiting for approval: corral task approve {task_id}");
    }
    Ok(())
}

pub async fn run(pool: &SqlitePool, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Add {
            project_id,
            title,
            description,
        } => {
            let task = tasks_db::insert_task(pool, &project_id, &title, &description, None).await?;
            println!("{}  {}", task.id, task.title);
            Ok(())
        }
        TaskCommands::List { project_id } => {
            let tasks = tasks_db::list_tasks_for_project(pool, &project_id).await?;
            if tasks.is_empty() {
                println!("no tasks");
                return Ok(());
            }
            for task in tasks {
                println!(
                    "{}  [{}]  {}  status={}",
                    task.id,
                    task.column,
                    task.title,
                    task.last_agent_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
            Ok(())
        }
        TaskCommands::Show { task_id } => {
            let task = tasks_db::get_task(pool, &task_id)
                .await?
                .context("task not found")?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        TaskCommands::Run { task_id } => {
            let orchestrator = build_orchestrator(pool)?;
            orchestrator
                .start_task(&task_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            follow_run(&orchestrator, pool, &task_id).await
        }
        TaskCommands::Approve { task_id, by } => {
            let orchestrator = build_orchestrator(pool)?;
            orchestrator
                .approve_plan(&task_id, by.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            follow_run(&orchestrator, pool, &task_id).await
        }
        TaskCommands::Reject { task_id } => {
            let orchestrator = build_orchestrator(pool)?;
            orchestrator
                .reject_plan(&task_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("plan rejected, task back in backlog");
            Ok(())
        }
        TaskCommands::Verify { task_id } => {
            let orchestrator = build_orchestrator(pool)?;
            orchestrator
                .verify_task(&task_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("task verified");
            Ok(())
        }
        TaskCommands::Cancel { task_id } => {
            let orchestrator = build_orchestrator(pool)?;
            orchestrator
                .cancel_task(&task_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("task cancelled");
            Ok(())
        }
    }
}
