//! Canonical element projection of a session state.
//!
//! Backends, projected documents, cross-validation and recovery all compare
//! states through this projection, so two copies agree on an element exactly
//! when their encoded values are byte-equal.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{
    CompilationStatus, DatabaseStatus, FileModification, Issue, NextAction, SessionState, Task,
};

/// Semantic element of a session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementType {
    SessionId,
    Timestamp,
    Duration,
    Phase,
    Progress,
    Tasks,
    Environment,
    FileChanges,
    NextActions,
    KnownIssues,
}

impl ElementType {
    /// Every element, in canonical order.
    pub const ALL: [ElementType; 10] = [
        ElementType::SessionId,
        ElementType::Timestamp,
        ElementType::Duration,
        ElementType::Phase,
        ElementType::Progress,
        ElementType::Tasks,
        ElementType::Environment,
        ElementType::FileChanges,
        ElementType::NextActions,
        ElementType::KnownIssues,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::SessionId => "SESSION_ID",
            ElementType::Timestamp => "TIMESTAMP",
            ElementType::Duration => "DURATION",
            ElementType::Phase => "PHASE",
            ElementType::Progress => "PROGRESS",
            ElementType::Tasks => "TASKS",
            ElementType::Environment => "ENVIRONMENT",
            ElementType::FileChanges => "FILE_CHANGES",
            ElementType::NextActions => "NEXT_ACTIONS",
            ElementType::KnownIssues => "KNOWN_ISSUES",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ElementType::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown element type: {}", s))
    }
}

#[derive(Serialize, Deserialize)]
struct TasksElement {
    completed: Vec<Task>,
    in_progress: Vec<Task>,
}

#[derive(Serialize, Deserialize)]
struct EnvironmentElement {
    toolchain_version: String,
    build_tool_status: String,
    compilation_status: Option<CompilationStatus>,
    database_status: Option<DatabaseStatus>,
}

/// Encode a timestamp the way every projection does.
pub(crate) fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Project a state onto its canonical elements.
///
/// An empty session id and a missing timestamp are omitted rather than
/// encoded, so they surface as gaps instead of bogus values.
pub fn project(state: &SessionState) -> BTreeMap<ElementType, String> {
    let mut elements = BTreeMap::new();

    if !state.session_id.trim().is_empty() {
        elements.insert(ElementType::SessionId, state.session_id.clone());
    }
    if let Some(ts) = &state.timestamp {
        elements.insert(ElementType::Timestamp, encode_timestamp(ts));
    }
    elements.insert(ElementType::Duration, state.duration_seconds.to_string());
    elements.insert(ElementType::Phase, state.last_completed_phase.clone());
    elements.insert(ElementType::Progress, state.progress_percentage.to_string());
    elements.insert(
        ElementType::Tasks,
        serde_json::to_string(&TasksElement {
            completed: state.completed_tasks.clone(),
            in_progress: state.in_progress_tasks.clone(),
        })
        .unwrap_or_default(),
    );
    elements.insert(
        ElementType::Environment,
        serde_json::to_string(&EnvironmentElement {
            toolchain_version: state.toolchain_version.clone(),
            build_tool_status: state.build_tool_status.clone(),
            compilation_status: state.compilation_status.clone(),
            database_status: state.database_status.clone(),
        })
        .unwrap_or_default(),
    );
    elements.insert(
        ElementType::FileChanges,
        serde_json::to_string(&state.files_modified).unwrap_or_default(),
    );
    elements.insert(
        ElementType::NextActions,
        serde_json::to_string(&state.next_actions).unwrap_or_default(),
    );
    elements.insert(
        ElementType::KnownIssues,
        serde_json::to_string(&state.known_issues).unwrap_or_default(),
    );

    elements
}

/// Rebuild a best-effort state from recovered elements.
///
/// Elements that are absent or fail to decode leave the corresponding
/// fields at their empty defaults.
pub fn rebuild(elements: &BTreeMap<ElementType, String>) -> SessionState {
    let mut state = SessionState::new(
        elements
            .get(&ElementType::SessionId)
            .cloned()
            .unwrap_or_default(),
    )
    .with_timestamp(None);

    for (element, value) in elements {
        match element {
            ElementType::SessionId => {}
            ElementType::Timestamp => {
                state.timestamp = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            }
            ElementType::Duration => {
                state.duration_seconds = value.parse().unwrap_or_default();
            }
            ElementType::Phase => state.last_completed_phase = value.clone(),
            ElementType::Progress => {
                state.progress_percentage = value.parse().unwrap_or_default();
            }
            ElementType::Tasks => {
                if let Ok(tasks) = serde_json::from_str::<TasksElement>(value) {
                    state.completed_tasks = tasks.completed;
                    state.in_progress_tasks = tasks.in_progress;
                }
            }
            ElementType::Environment => {
                if let Ok(env) = serde_json::from_str::<EnvironmentElement>(value) {
                    state.toolchain_version = env.toolchain_version;
                    state.build_tool_status = env.build_tool_status;
                    state.compilation_status = env.compilation_status;
                    state.database_status = env.database_status;
                }
            }
            ElementType::FileChanges => {
                state.files_modified =
                    serde_json::from_str::<Vec<FileModification>>(value).unwrap_or_default();
            }
            ElementType::NextActions => {
                state.next_actions =
                    serde_json::from_str::<Vec<NextAction>>(value).unwrap_or_default();
            }
            ElementType::KnownIssues => {
                state.known_issues = serde_json::from_str::<Vec<Issue>>(value).unwrap_or_default();
            }
        }
    }

    state
}

impl SessionState {
    /// Canonical elements of this state. See [`project`].
    pub fn elements(&self) -> BTreeMap<ElementType, String> {
        project(self)
    }

    /// Best-effort state from recovered elements. See [`rebuild`].
    pub fn from_elements(elements: &BTreeMap<ElementType, String>) -> Self {
        rebuild(elements)
    }
}
