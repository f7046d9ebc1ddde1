use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`Mission`].
///
/// See the transition table in `MissionStateMachine` (`gator-core`) for
/// which edges are legal; this type only carries the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionState {
    Draft,
    GeneratingPrd,
    PrdReview,
    PreparingTasks,
    TasksReview,
    InProgress,
    CompletedSuccess,
    CompletedFailed,
}

impl MissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CompletedSuccess | Self::CompletedFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::GeneratingPrd => "GENERATING_PRD",
            Self::PrdReview => "PRD_REVIEW",
            Self::PreparingTasks => "PREPARING_TASKS",
            Self::TasksReview => "TASKS_REVIEW",
            Self::InProgress => "IN_PROGRESS",
            Self::CompletedSuccess => "COMPLETED_SUCCESS",
            Self::CompletedFailed => "COMPLETED_FAILED",
        }
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MissionState {
    type Err = MissionStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "GENERATING_PRD" => Ok(Self::GeneratingPrd),
            "PRD_REVIEW" => Ok(Self::PrdReview),
            "PREPARING_TASKS" => Ok(Self::PreparingTasks),
            "TASKS_REVIEW" => Ok(Self::TasksReview),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED_SUCCESS" => Ok(Self::CompletedSuccess),
            "COMPLETED_FAILED" => Ok(Self::CompletedFailed),
            other => Err(MissionStateParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MissionStateParseError(pub String);

impl fmt::Display for MissionStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid mission state: {:?}", self.0)
    }
}

impl std::error::Error for MissionStateParseError {}

// ---------------------------------------------------------------------------

/// Status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a [`ProcessRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Queued,
    Running,
    Success,
    Error,
    Canceled,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = ProcessStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(ProcessStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessStatusParseError(pub String);

impl fmt::Display for ProcessStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid process status: {:?}", self.0)
    }
}

impl std::error::Error for ProcessStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of a [`ProcessRow`]: a detached local subprocess, or a sandbox
/// container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    Local,
    Container,
}

impl ProcessType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = ProcessTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "container" => Ok(Self::Container),
            other => Err(ProcessTypeParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessTypeParseError(pub String);

impl fmt::Display for ProcessTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid process type: {:?}", self.0)
    }
}

impl std::error::Error for ProcessTypeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A tracked project: a directory on disk under version control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub is_active: bool,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw row shape as sqlx sees it (booleans and JSON are stored as
/// integers/text in sqlite).
#[derive(Debug, FromRow)]
pub(crate) struct ProjectRow {
    pub id: String,
    pub name: String,
    pub path: String,
    pub is_active: i64,
    pub config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProjectRow> for Project {
    fn from(r: ProjectRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            path: r.path,
            is_active: r.is_active != 0,
            config: serde_json::from_str(&r.config).unwrap_or(serde_json::json!({})),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// A project with a count of its missions, for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectWithMissionCount {
    #[serde(flatten)]
    pub project: Project,
    pub mission_count: i64,
}

/// A mission: one end-to-end PRD -> tasks -> execution pass for a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    pub id: String,
    pub project_id: String,
    pub feature_name: String,
    pub description: Option<String>,
    pub state: MissionState,
    pub worktree_path: Option<String>,
    pub prd_path: Option<String>,
    pub tasks_path: Option<String>,
    pub prd_iterations: i64,
    pub tasks_iterations: i64,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
pub(crate) struct MissionRow {
    pub id: String,
    pub project_id: String,
    pub feature_name: String,
    pub description: Option<String>,
    pub state: String,
    pub worktree_path: Option<String>,
    pub prd_path: Option<String>,
    pub tasks_path: Option<String>,
    pub prd_iterations: i64,
    pub tasks_iterations: i64,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<MissionRow> for Mission {
    fn from(r: MissionRow) -> Self {
        Self {
            id: r.id,
            project_id: r.project_id,
            feature_name: r.feature_name,
            description: r.description,
            state: r.state.parse().unwrap_or(MissionState::Draft),
            worktree_path: r.worktree_path,
            prd_path: r.prd_path,
            tasks_path: r.tasks_path,
            prd_iterations: r.prd_iterations,
            tasks_iterations: r.tasks_iterations,
            result: r.result,
            failure_reason: r.failure_reason,
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            ended_at: r.ended_at,
        }
    }
}

/// A task within a mission's execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub mission_id: String,
    pub name: String,
    pub description: Option<String>,
    pub order_num: i64,
    pub status: TaskStatus,
    pub agents: Vec<String>,
    pub skills: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub mission_id: String,
    pub name: String,
    pub description: Option<String>,
    pub order_num: i64,
    pub status: String,
    pub agents: String,
    pub skills: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(r: TaskRow) -> Self {
        Self {
            id: r.id,
            mission_id: r.mission_id,
            name: r.name,
            description: r.description,
            order_num: r.order_num,
            status: r.status.parse().unwrap_or(TaskStatus::Pending),
            agents: serde_json::from_str(&r.agents).unwrap_or_default(),
            skills: serde_json::from_str(&r.skills).unwrap_or_default(),
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
        }
    }
}

/// A new task to be inserted as part of a batch (see `task::create_many`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub description: Option<String>,
    pub agents: Vec<String>,
    pub skills: Vec<String>,
}

/// A supervised local process or sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRow {
    pub id: String,
    pub mission_id: Option<String>,
    pub r#type: ProcessType,
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub pid: Option<i64>,
    pub pgid: Option<i64>,
    pub container_id: Option<String>,
    pub status: ProcessStatus,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
pub(crate) struct ProcessRowSql {
    pub id: String,
    pub mission_id: Option<String>,
    pub r#type: String,
    pub command: String,
    pub cwd: Option<String>,
    pub env: String,
    pub pid: Option<i64>,
    pub pgid: Option<i64>,
    pub container_id: Option<String>,
    pub status: String,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl From<ProcessRowSql> for ProcessRow {
    fn from(r: ProcessRowSql) -> Self {
        Self {
            id: r.id,
            mission_id: r.mission_id,
            r#type: r.r#type.parse().unwrap_or(ProcessType::Local),
            command: r.command,
            cwd: r.cwd,
            env: serde_json::from_str(&r.env).unwrap_or_default(),
            pid: r.pid,
            pgid: r.pgid,
            container_id: r.container_id,
            status: r.status.parse().unwrap_or(ProcessStatus::Queued),
            exit_code: r.exit_code,
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            ended_at: r.ended_at,
            heartbeat_at: r.heartbeat_at,
        }
    }
}

/// An append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub event: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct AuditEntryRow {
    pub id: String,
    pub event: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<AuditEntryRow> for AuditEntry {
    fn from(r: AuditEntryRow) -> Self {
        Self {
            id: r.id,
            event: r.event,
            entity_type: r.entity_type,
            entity_id: r.entity_id,
            details: r.details.and_then(|d| serde_json::from_str(&d).ok()),
            created_at: r.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
