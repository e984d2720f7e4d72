//! Task service and kanban state machine.
//!
//! Enforces the legal column transition graph:
//!
//! ```text
//! backlog          --start-->       in_progress
//! in_progress      --plan_ready-->  waiting_approval
//! waiting_approval --approve-->     in_progress
//! waiting_approval --reject-->      backlog          (plan cleared)
//! in_progress      --complete-->    waiting_approval (execute phase)
//! waiting_approval --verify-->      verified
//! in_progress      --cancel-->      backlog
//! ```
//!
//! Transitions run as guarded single-row updates (optimistic locking), so
//! two racing movers cannot both win. Agent-launch side effects live in the
//! orchestrator, which calls down into this service.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::warn;

use corral_db::models::{AgentRunStatus, PlanOptions, Task, TaskColumn};
use corral_db::queries::{audit, tasks as db};

use crate::error::{CoreError, CoreResult, ErrorCode};

/// A named edge in the transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    Start,
    PlanReady,
    Approve,
    Reject,
    Complete,
    Verify,
    Cancel,
}

impl TaskTransition {
    /// The `(from, to)` columns this edge connects.
    pub fn edge(&self) -> (TaskColumn, TaskColumn) {
        match self {
            Self::Start => (TaskColumn::Backlog, TaskColumn::InProgress),
            Self::PlanReady => (TaskColumn::InProgress, TaskColumn::WaitingApproval),
            Self::Approve => (TaskColumn::WaitingApproval, TaskColumn::InProgress),
            Self::Reject => (TaskColumn::WaitingApproval, TaskColumn::Backlog),
            Self::Complete => (TaskColumn::InProgress, TaskColumn::WaitingApproval),
            Self::Verify => (TaskColumn::WaitingApproval, TaskColumn::Verified),
            Self::Cancel => (TaskColumn::InProgress, TaskColumn::Backlog),
        }
    }

    /// Audit action name.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PlanReady => "plan_ready",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Complete => "complete",
            Self::Verify => "verify",
            Self::Cancel => "cancel",
        }
    }
}

/// Whether `(from, to)` is an edge in the graph, regardless of name.
pub fn is_valid_transition(from: TaskColumn, to: TaskColumn) -> bool {
    matches!(
        (from, to),
        (TaskColumn::Backlog, TaskColumn::InProgress)
            | (TaskColumn::InProgress, TaskColumn::WaitingApproval)
            | (TaskColumn::WaitingApproval, TaskColumn::InProgress)
            | (TaskColumn::WaitingApproval, TaskColumn::Backlog)
            | (TaskColumn::WaitingApproval, TaskColumn::Verified)
            | (TaskColumn::InProgress, TaskColumn::Backlog)
    )
}

/// Service over task rows.
#[derive(Clone)]
pub struct TaskService {
    pool: SqlitePool,
}

impl TaskService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch a task, failing with `INVALID_TRANSITION` detail if missing.
    pub async fn get_required(&self, task_id: &str) -> CoreResult<Task> {
        db::get_task(&self.pool, task_id)
            .await
            .map_err(|e| {
                CoreError::new(ErrorCode::InvalidTransition, format!("{e:#}"))
            })?
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::InvalidTransition,
                    format!("task {task_id} not found"),
                )
            })
    }

    /// Fetch a task.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        db::get_task(&self.pool, task_id).await
    }

    /// Execute a named transition with optimistic locking.
    ///
    /// Fails with `INVALID_TRANSITION` when the task is missing or its
    /// current column does not match the edge's source.
    pub async fn transition(&self, task_id: &str, transition: TaskTransition) -> CoreResult<()> {
        let (from, to) = transition.edge();

        let rows = db::transition_column(&self.pool, task_id, from, to)
            .await
            .map_err(|e| CoreError::new(ErrorCode::InvalidTransition, format!("{e:#}")))?;

        if rows == 0 {
            let current = self
                .get(task_id)
                .await
                .ok()
                .flatten()
                .map(|t| t.column.to_string());
            return Err(CoreError::new(
                ErrorCode::InvalidTransition,
                match current {
                    Some(current) => format!(
                        "cannot {} task {task_id}: column is {current}, expected {from}",
                        transition.action()
                    ),
                    None => format!("task {task_id} not found"),
                },
            ));
        }

        self.audit(task_id, transition.action(), None).await;
        Ok(())
    }

    /// Persist a ready plan: `{plan, plan_options, column=waiting_approval,
    /// last_agent_status=planning}` in one atomic update.
    pub async fn persist_plan(
        &self,
        task_id: &str,
        plan: &str,
        options: &PlanOptions,
    ) -> CoreResult<()> {
        let rows = db::persist_plan(&self.pool, task_id, plan, options)
            .await
            .map_err(|e| CoreError::new(ErrorCode::InvalidTransition, format!("{e:#}")))?;
        if rows == 0 {
            return Err(CoreError::new(
                ErrorCode::InvalidTransition,
                format!("cannot record plan for task {task_id}: not in progress"),
            ));
        }
        self.audit(
            task_id,
            TaskTransition::PlanReady.action(),
            Some(serde_json::json!({"sdkSessionId": options.sdk_session_id})),
        )
        .await;
        Ok(())
    }

    /// Approve a pending plan: column back to `in_progress`, approval
    /// stamped. `last_agent_status` stays `planning` until execute ends.
    pub async fn approve_plan(&self, task_id: &str, approved_by: Option<&str>) -> CoreResult<()> {
        self.transition(task_id, TaskTransition::Approve).await?;
        db::mark_approved(&self.pool, task_id, approved_by)
            .await
            .map_err(|e| CoreError::new(ErrorCode::InvalidTransition, format!("{e:#}")))?;
        Ok(())
    }

    /// Reject a pending plan: plan fields cleared, column back to backlog,
    /// agent status reset. A clean, bookkeeping-only transition.
    pub async fn reject_plan(&self, task_id: &str) -> CoreResult<()> {
        let rows = db::clear_plan(&self.pool, task_id)
            .await
            .map_err(|e| CoreError::new(ErrorCode::InvalidTransition, format!("{e:#}")))?;
        if rows == 0 {
            return Err(CoreError::new(
                ErrorCode::InvalidTransition,
                format!("cannot reject plan for task {task_id}: not waiting for approval"),
            ));
        }
        self.audit(task_id, TaskTransition::Reject.action(), None).await;
        Ok(())
    }

    /// Attach run artifacts to the task row.
    pub async fn set_run_refs(
        &self,
        task_id: &str,
        agent_id: Option<&str>,
        session_id: Option<&str>,
        worktree_id: Option<&str>,
    ) -> Result<()> {
        db::set_run_refs(&self.pool, task_id, agent_id, session_id, worktree_id).await
    }

    /// Update the run-status badge; stamps `completed_at` for terminal
    /// statuses.
    pub async fn set_run_status(
        &self,
        task_id: &str,
        status: Option<AgentRunStatus>,
    ) -> Result<()> {
        let completed_at = match status {
            Some(AgentRunStatus::Completed)
            | Some(AgentRunStatus::Error)
            | Some(AgentRunStatus::Cancelled) => Some(chrono::Utc::now()),
            _ => None,
        };
        db::set_last_agent_status(&self.pool, task_id, status, completed_at).await
    }

    /// Detach the session reference (run over).
    pub async fn clear_session_ref(&self, task_id: &str) -> Result<()> {
        db::clear_session_ref(&self.pool, task_id).await
    }

    /// Best-effort audit append.
    async fn audit(&self, task_id: &str, action: &str, detail: Option<serde_json::Value>) {
        if let Err(e) =
            audit::insert_audit(&self.pool, "task", task_id, action, detail.as_ref()).await
        {
            warn!(task_id, action, error = %e, "failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_edges_are_valid() {
        for transition in [
            TaskTransition::Start,
            TaskTransition::PlanReady,
            TaskTransition::Approve,
            TaskTransition::Reject,
            TaskTransition::Complete,
            TaskTransition::Verify,
            TaskTransition::Cancel,
        ] {
            let (from, to) = transition.edge();
            assert!(
                is_valid_transition(from, to),
                "edge for {transition:?} should be valid"
            );
        }
    }

    #[test]
    fn illegal_edges_rejected() {
        assert!(!is_valid_transition(TaskColumn::Backlog, TaskColumn::Verified));
        assert!(!is_valid_transition(TaskColumn::Verified, TaskColumn::Backlog));
        assert!(!is_valid_transition(TaskColumn::Backlog, TaskColumn::WaitingApproval));
        assert!(!is_valid_transition(TaskColumn::InProgress, TaskColumn::Verified));
    }
}
