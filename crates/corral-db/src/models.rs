use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kanban column a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskColumn {
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
}

impl fmt::Display for TaskColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::WaitingApproval => "waiting_approval",
            Self::Verified => "verified",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskColumn {
    type Err = TaskColumnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "verified" => Ok(Self::Verified),
            other => Err(TaskColumnParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskColumn`] string.
#[derive(Debug, Clone)]
pub struct TaskColumnParseError(pub String);

impl fmt::Display for TaskColumnParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task column: {:?}", self.0)
    }
}

impl std::error::Error for TaskColumnParseError {}

// ---------------------------------------------------------------------------

/// Outcome status of the most recent agent run for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Planning,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRunStatus {
    type Err = AgentRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AgentRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRunStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentRunStatusParseError(pub String);

impl fmt::Display for AgentRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent run status: {:?}", self.0)
    }
}

impl std::error::Error for AgentRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of an agent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Planning,
    Running,
    Completed,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "planning" => Ok(Self::Planning),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = SessionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(SessionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionStatus`] string.
#[derive(Debug, Clone)]
pub struct SessionStatusParseError(pub String);

impl fmt::Display for SessionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session status: {:?}", self.0)
    }
}

impl std::error::Error for SessionStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a worktree row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Merged,
    Removed,
}

impl fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

impl FromStr for WorktreeStatus {
    type Err = WorktreeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "merged" => Ok(Self::Merged),
            "removed" => Ok(Self::Removed),
            other => Err(WorktreeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorktreeStatus`] string.
#[derive(Debug, Clone)]
pub struct WorktreeStatusParseError(pub String);

impl fmt::Display for WorktreeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worktree status: {:?}", self.0)
    }
}

impl std::error::Error for WorktreeStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for SandboxStatus {
    type Err = SandboxStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(SandboxStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SandboxStatus`] string.
#[derive(Debug, Clone)]
pub struct SandboxStatusParseError(pub String);

impl fmt::Display for SandboxStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid sandbox status: {:?}", self.0)
    }
}

impl std::error::Error for SandboxStatusParseError {}

// ---------------------------------------------------------------------------
// JSON column payloads
// ---------------------------------------------------------------------------

/// Per-project configuration, stored as JSON in `projects.config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    /// Directory (relative to the project path) under which worktrees live.
    pub worktree_root: String,
    /// Branch worktrees are created from when a task has no override.
    pub default_branch: String,
    /// Tools the agent binary is allowed to use.
    pub allowed_tools: Vec<String>,
    /// Per-run turn ceiling.
    pub max_turns: u32,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            worktree_root: ".corral/worktrees".to_string(),
            default_branch: "main".to_string(),
            allowed_tools: vec![
                "Bash".to_string(),
                "Read".to_string(),
                "Edit".to_string(),
                "Write".to_string(),
                "Glob".to_string(),
                "Grep".to_string(),
            ],
            max_turns: 50,
        }
    }
}

/// Agent configuration, stored as JSON in `agents.config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Vec<String>,
}

/// A prompt the operator pre-approved at plan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedPrompt {
    pub tool: String,
    pub prompt: String,
}

/// Options captured alongside an approved-pending plan, stored as JSON in
/// `tasks.plan_options`. `sdk_session_id` is what the execute phase resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOptions {
    pub sdk_session_id: String,
    #[serde(default)]
    pub allowed_prompts: Vec<AllowedPrompt>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project -- a repository that agents work on.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    /// JSON-encoded [`ProjectConfig`].
    pub config: String,
    pub max_concurrent_agents: i64,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Decode the JSON config column.
    pub fn config(&self) -> Result<ProjectConfig, serde_json::Error> {
        serde_json::from_str(&self.config)
    }
}

/// A task -- a card on the kanban board.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    #[sqlx(rename = "column_name")]
    pub column: TaskColumn,
    pub position: i64,
    /// JSON-encoded list of labels.
    pub labels: Option<String>,
    pub plan: Option<String>,
    /// JSON-encoded [`PlanOptions`].
    pub plan_options: Option<String>,
    pub last_agent_status: Option<AgentRunStatus>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub worktree_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Decode the JSON plan options column, if present.
    pub fn plan_options(&self) -> Result<Option<PlanOptions>, serde_json::Error> {
        match &self.plan_options {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

/// An agent row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: String,
    pub project_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    /// JSON-encoded [`AgentConfig`].
    pub config: String,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Decode the JSON config column.
    pub fn config(&self) -> Result<AgentConfig, serde_json::Error> {
        serde_json::from_str(&self.config)
    }
}

/// A session -- owns exactly one durable stream with the same id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A worktree -- a per-task branch checkout.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worktree {
    pub id: String,
    pub project_id: String,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub branch: String,
    pub path: String,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
}

/// A sandbox instance -- one per project is sufficient.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SandboxInstance {
    pub id: String,
    pub project_id: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored API credential.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub id: String,
    pub kind: String,
    pub token: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An audit log entry recorded for state-changing operations.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
