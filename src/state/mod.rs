//! Session state model.
//!
//! A [`SessionState`] is one checkpoint of a long-running work session: the
//! work done so far, the environment it ran in, and what should happen next.
//! Snapshots are validated by the [`SessionStateManager`] before any other
//! component is allowed to see them.

mod fields;
mod manager;


pub use fields::{project, rebuild, ElementType};
pub use manager::{validate_state, ContinuationPoint, SessionStateManager, ValidationResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a work session at one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Opaque stable session key.
    pub session_id: String,
    /// When the snapshot was taken. Mandatory; `None` only for corrupt input.
    pub timestamp: Option<DateTime<Utc>>,
    /// Wall-clock length of the session so far.
    #[serde(default)]
    pub duration_seconds: u64,
    /// Identifier of the most recently completed phase.
    #[serde(default)]
    pub last_completed_phase: String,
    /// Overall progress in percent (0-100).
    #[serde(default)]
    pub progress_percentage: f64,
    /// Tasks finished in this session, in completion order.
    #[serde(default)]
    pub completed_tasks: Vec<Task>,
    /// Tasks currently being worked on.
    #[serde(default)]
    pub in_progress_tasks: Vec<Task>,
    /// Files touched during the session.
    #[serde(default)]
    pub files_modified: Vec<FileModification>,
    /// Planned follow-up work.
    #[serde(default)]
    pub next_actions: Vec<NextAction>,
    /// Open problems carried over between sessions.
    #[serde(default)]
    pub known_issues: Vec<Issue>,
    /// Outcome of the last build.
    #[serde(default)]
    pub compilation_status: Option<CompilationStatus>,
    /// Datastore reachability at capture time.
    #[serde(default)]
    pub database_status: Option<DatabaseStatus>,
    /// Toolchain version string, e.g. `rustc 1.80.0`.
    #[serde(default)]
    pub toolchain_version: String,
    /// Free-form build tool status, e.g. `dependencies resolved`.
    #[serde(default)]
    pub build_tool_status: String,
}

impl SessionState {
    /// Create a new snapshot stamped with the current time.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Some(Utc::now()),
            duration_seconds: 0,
            last_completed_phase: String::new(),
            progress_percentage: 0.0,
            completed_tasks: Vec::new(),
            in_progress_tasks: Vec::new(),
            files_modified: Vec::new(),
            next_actions: Vec::new(),
            known_issues: Vec::new(),
            compilation_status: None,
            database_status: None,
            toolchain_version: String::new(),
            build_tool_status: String::new(),
        }
    }

    /// Set (or clear) the snapshot timestamp.
    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the session duration in seconds.
    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration_seconds = seconds;
        self
    }

    /// Set the last completed phase.
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.last_completed_phase = phase.into();
        self
    }

    /// Set the progress percentage. Not clamped: out-of-range values are a
    /// validation error, not something to hide.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress_percentage = progress;
        self
    }

    /// Append a completed task.
    pub fn with_completed_task(mut self, task: Task) -> Self {
        self.completed_tasks.push(task);
        self
    }

    /// Append an in-progress task.
    pub fn with_in_progress_task(mut self, task: Task) -> Self {
        self.in_progress_tasks.push(task);
        self
    }

    /// Append a file modification.
    pub fn with_file_modification(mut self, modification: FileModification) -> Self {
        self.files_modified.push(modification);
        self
    }

    /// Append a next action.
    pub fn with_next_action(mut self, action: NextAction) -> Self {
        self.next_actions.push(action);
        self
    }

    /// Append a known issue.
    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.known_issues.push(issue);
        self
    }

    /// Set the compilation status.
    pub fn with_compilation(mut self, status: CompilationStatus) -> Self {
        self.compilation_status = Some(status);
        self
    }

    /// Set the database status.
    pub fn with_database(mut self, status: DatabaseStatus) -> Self {
        self.database_status = Some(status);
        self
    }

    /// Set the toolchain version string.
    pub fn with_toolchain(mut self, version: impl Into<String>) -> Self {
        self.toolchain_version = version.into();
        self
    }

    /// Set the build tool status string.
    pub fn with_build_tool_status(mut self, status: impl Into<String>) -> Self {
        self.build_tool_status = status.into();
        self
    }

    /// Whether the build tool reported a healthy status.
    pub fn build_tool_healthy(&self) -> bool {
        let status = self.build_tool_status.to_lowercase();
        !status.trim().is_empty() && !status.contains("fail") && !status.contains("error")
    }

    /// All task ids known to this snapshot.
    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.completed_tasks
            .iter()
            .chain(self.in_progress_tasks.iter())
            .map(|t| t.id.as_str())
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// A unit of work tracked within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Phase the task belongs to.
    #[serde(default)]
    pub phase: String,
}

impl Task {
    /// Create a completed task.
    pub fn completed(
        id: impl Into<String>,
        description: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Completed,
            phase: phase.into(),
        }
    }

    /// Create an in-progress task.
    pub fn in_progress(
        id: impl Into<String>,
        description: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::InProgress,
            phase: phase.into(),
        }
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    InProgress,
    Other,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "completed" | "done" => Ok(TaskStatus::Completed),
            "in_progress" => Ok(TaskStatus::InProgress),
            "other" => Ok(TaskStatus::Other),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

// ============================================================================
// File modifications
// ============================================================================

/// A file touched during the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileModification {
    pub path: String,
    pub kind: ModificationKind,
    #[serde(default)]
    pub lines_changed: u32,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl FileModification {
    /// Create a modification record stamped with the current time.
    pub fn new(path: impl Into<String>, kind: ModificationKind, lines_changed: u32) -> Self {
        Self {
            path: path.into(),
            kind,
            lines_changed,
            timestamp: Some(Utc::now()),
        }
    }
}

/// Kind of file modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModificationKind::Created => write!(f, "created"),
            ModificationKind::Modified => write!(f, "modified"),
            ModificationKind::Deleted => write!(f, "deleted"),
        }
    }
}

// ============================================================================
// Next actions
// ============================================================================

/// Planned follow-up work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextAction {
    pub description: String,
    pub priority: Priority,
    /// Estimated effort in minutes.
    #[serde(default)]
    pub estimated_minutes: u32,
    /// Ids of tasks this action depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl NextAction {
    /// Create a next action without dependencies.
    pub fn new(description: impl Into<String>, priority: Priority, estimated_minutes: u32) -> Self {
        Self {
            description: description.into(),
            priority,
            estimated_minutes,
            dependencies: Vec::new(),
        }
    }

    /// Add a task dependency.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }
}

/// Priority of a next action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

// ============================================================================
// Issues
// ============================================================================

/// A known problem carried across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    pub status: IssueStatus,
    /// Ordered steps towards resolution.
    #[serde(default)]
    pub resolution_steps: Vec<String>,
}

impl Issue {
    /// Create an open issue.
    pub fn open(id: impl Into<String>, description: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            severity,
            status: IssueStatus::Open,
            resolution_steps: Vec::new(),
        }
    }

    /// Whether the issue still needs attention.
    pub fn is_open(&self) -> bool {
        self.status != IssueStatus::Resolved
    }
}

/// Severity of a known issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle status of a known issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Resolved,
}

// ============================================================================
// Environment status
// ============================================================================

/// Outcome of the last build. Invariant: `success == (error_count == 0)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationStatus {
    pub success: bool,
    pub error_count: u32,
    pub warning_count: u32,
}

impl CompilationStatus {
    /// A successful build with the given number of warnings.
    pub fn succeeded(warning_count: u32) -> Self {
        Self {
            success: true,
            error_count: 0,
            warning_count,
        }
    }

    /// A failed build. At least one error is recorded so the invariant holds.
    pub fn failed(error_count: u32, warning_count: u32) -> Self {
        Self {
            success: false,
            error_count: error_count.max(1),
            warning_count,
        }
    }

    /// Whether `success` agrees with `error_count`.
    pub fn is_consistent(&self) -> bool {
        self.success == (self.error_count == 0)
    }
}

/// Datastore reachability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStatus {
    pub connected: bool,
    pub schema_valid: bool,
    /// Connection descriptor, e.g. a URL with credentials stripped.
    #[serde(default)]
    pub connection: String,
}

impl DatabaseStatus {
    /// A connected datastore with a valid schema.
    pub fn healthy(connection: impl Into<String>) -> Self {
        Self {
            connected: true,
            schema_valid: true,
            connection: connection.into(),
        }
    }

    /// An unreachable datastore.
    pub fn disconnected(connection: impl Into<String>) -> Self {
        Self {
            connected: false,
            schema_valid: false,
            connection: connection.into(),
        }
    }
}
