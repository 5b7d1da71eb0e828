use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{SessionState, TaskStatus};

/// Outcome of validating a session state. Always returned, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the state may be admitted to storage.
    pub valid: bool,
    /// Human-readable errors, in check order.
    pub errors: Vec<String>,
    /// Findings that do not block admission.
    pub warnings: Vec<String>,
    /// 100 minus 10 per error, floored at 0.
    pub score: f64,
    /// When the validation ran.
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    /// Build a result from collected findings.
    pub fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        let score = (100.0 - errors.len() as f64 * 10.0).max(0.0);
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
            score,
            validated_at: Utc::now(),
        }
    }

    /// Whether the state passed validation.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Check structural invariants and cross-field consistency of a state.
pub fn validate_state(state: &SessionState) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if state.session_id.trim().is_empty() {
        errors.push("Session ID is missing".to_string());
    }
    if state.timestamp.is_none() {
        errors.push("Session timestamp is missing".to_string());
    }

    let progress = state.progress_percentage;
    if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
        errors.push(format!("Progress percentage is invalid: {}", progress));
    }

    match &state.compilation_status {
        None => errors.push("Compilation status is missing".to_string()),
        Some(status) if !status.is_consistent() => errors.push(format!(
            "Compilation status is inconsistent: success={} with {} errors",
            status.success, status.error_count
        )),
        Some(_) => {}
    }

    match &state.database_status {
        None => errors.push("Database status is missing".to_string()),
        Some(status) if status.schema_valid && !status.connected => {
            errors.push("Database schema reported valid while disconnected".to_string())
        }
        Some(_) => {}
    }

    for task in &state.completed_tasks {
        if task.status != TaskStatus::Completed {
            errors.push(format!(
                "Task {} is listed as completed but has status {}",
                task.id, task.status
            ));
        }
    }
    for task in &state.in_progress_tasks {
        if task.status == TaskStatus::Completed {
            errors.push(format!(
                "Task {} is listed as in progress but has status completed",
                task.id
            ));
        }
    }

    let mut seen = HashSet::new();
    for id in state.task_ids() {
        if !seen.insert(id) {
            errors.push(format!("Duplicate task id: {}", id));
        }
    }

    for modification in &state.files_modified {
        if modification.path.trim().is_empty() {
            errors.push("File modification with empty path".to_string());
        }
    }

    for action in &state.next_actions {
        for dep in &action.dependencies {
            if !seen.contains(dep.as_str()) {
                warnings.push(format!(
                    "Next action '{}' depends on unknown task {}",
                    action.description, dep
                ));
            }
        }
    }

    ValidationResult::from_findings(errors, warnings)
}

/// Exact point at which the next session should resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationPoint {
    pub session_id: String,
    pub phase: String,
    pub current_task: Option<String>,
    pub current_file: Option<String>,
    pub next_action: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl ContinuationPoint {
    /// First in-progress task, last touched file and most urgent next action.
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            phase: state.last_completed_phase.clone(),
            current_task: state
                .in_progress_tasks
                .first()
                .map(|t| format!("{} {}", t.id, t.description)),
            current_file: state.files_modified.last().map(|f| f.path.clone()),
            next_action: state
                .next_actions
                .iter()
                .min_by_key(|a| a.priority)
                .map(|a| a.description.clone()),
            generated_at: Utc::now(),
        }
    }
}

/// Validates snapshots and remembers the last one admitted.
#[derive(Debug, Default)]
pub struct SessionStateManager {
    current: RwLock<Option<SessionState>>,
}

impl SessionStateManager {
    /// Create a manager with no captured state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a snapshot and, if valid, make it the current state.
    ///
    /// Callers must check [`ValidationResult::is_valid`] before handing the
    /// state to storage.
    pub fn capture_session_state(&self, state: &SessionState) -> ValidationResult {
        let result = validate_state(state);

        if result.valid {
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
            info!(
                session_id = %state.session_id,
                phase = %state.last_completed_phase,
                progress = state.progress_percentage,
                "Session state captured"
            );
        } else {
            warn!(
                session_id = %state.session_id,
                errors = result.errors.len(),
                "Session state rejected"
            );
        }
        for warning in &result.warnings {
            debug!(session_id = %state.session_id, warning = %warning, "Validation warning");
        }

        result
    }

    /// The last state that passed validation.
    pub fn current(&self) -> Option<SessionState> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Derive where the next session should pick up from the current state.
    pub fn continuation_point(&self) -> Option<ContinuationPoint> {
        self.current().as_ref().map(ContinuationPoint::from_state)
    }
}
