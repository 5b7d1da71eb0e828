//! Quality gates evaluated against a session state.
//!
//! Four independent gates (compilation, documentation, progress, quality)
//! each yield a [`GateResult`]. A failed gate always carries at least one
//! recommendation. Emergency bypasses are audited overrides: they are
//! recorded with a remediation plan and never alter a gate result.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::docs::DocumentationSynchronizer;
use crate::state::{validate_state, SessionState, Severity, TaskStatus};

/// Minimum compilation score to pass.
pub const COMPILATION_PASS_SCORE: f64 = 90.0;
/// Minimum composite quality score to pass.
pub const QUALITY_PASS_SCORE: f64 = 85.0;

/// The fixed gate battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Compilation,
    Documentation,
    Progress,
    Quality,
}

impl GateKind {
    /// All gates, in evaluation order.
    pub const ALL: [GateKind; 4] = [
        GateKind::Compilation,
        GateKind::Documentation,
        GateKind::Progress,
        GateKind::Quality,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Compilation => "COMPILATION",
            GateKind::Documentation => "DOCUMENTATION",
            GateKind::Progress => "PROGRESS",
            GateKind::Quality => "QUALITY",
        }
    }

    /// Human-readable gate name.
    pub fn display_name(&self) -> &'static str {
        match self {
            GateKind::Compilation => "Compilation Gate",
            GateKind::Documentation => "Documentation Gate",
            GateKind::Progress => "Progress Gate",
            GateKind::Quality => "Quality Gate",
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for GateKind {
    type Err = String;

    /// Accepts `COMPILATION`, `compilation` or `Compilation Gate`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim();
        GateKind::ALL
            .into_iter()
            .find(|g| {
                g.as_str().eq_ignore_ascii_case(normalized)
                    || g.display_name().eq_ignore_ascii_case(normalized)
            })
            .ok_or_else(|| format!("Unknown quality gate: {}", s))
    }
}

/// Outcome of one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub kind: GateKind,
    pub passed: bool,
    /// 0-100.
    pub score: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub details: String,
    pub executed_at: DateTime<Utc>,
}

impl GateResult {
    fn new(kind: GateKind) -> Self {
        Self {
            name: kind.display_name().to_string(),
            kind,
            passed: false,
            score: 0.0,
            issues: Vec::new(),
            recommendations: Vec::new(),
            details: String::new(),
            executed_at: Utc::now(),
        }
    }
}

/// Aggregated outcome of the whole battery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateResults {
    pub session_id: String,
    /// One entry per gate, in evaluation order.
    pub results: Vec<GateResult>,
    pub all_passed: bool,
    pub passed_count: usize,
    /// Names of failed gates.
    pub failed_gates: Vec<String>,
    pub recommendations: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl QualityGateResults {
    /// Result of a single gate.
    pub fn gate(&self, kind: GateKind) -> Option<&GateResult> {
        self.results.iter().find(|r| r.kind == kind)
    }
}

/// A recorded emergency bypass request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassResult {
    pub id: Uuid,
    pub gate_name: String,
    pub justification: String,
    pub remediation_plan: Vec<String>,
    pub approved: bool,
    pub reason: String,
    pub conditions: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

// ============================================================================
// Manager
// ============================================================================

/// Runs quality gates and keeps the bypass audit log.
pub struct QualityGateManager {
    docs: Arc<DocumentationSynchronizer>,
    audit_log: Mutex<Vec<BypassResult>>,
}

impl QualityGateManager {
    /// Create a manager reading documentation state from `docs`.
    pub fn new(docs: Arc<DocumentationSynchronizer>) -> Self {
        Self {
            docs,
            audit_log: Mutex::new(Vec::new()),
        }
    }

    /// Run all four gates and aggregate.
    pub async fn run_all_gates(&self, state: &SessionState) -> QualityGateResults {
        let results = vec![
            self.run_compilation_gate(state),
            self.run_documentation_gate(state).await,
            self.run_progress_gate(state),
            self.run_quality_gate(state),
        ];

        let failed_gates: Vec<String> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.clone())
            .collect();

        let mut recommendations: Vec<String> = results
            .iter()
            .filter(|r| !r.passed)
            .flat_map(|r| r.recommendations.iter().cloned())
            .collect();
        if recommendations.is_empty() {
            recommendations.push("All quality gates passed - proceed with confidence".to_string());
        }

        let passed_count = results.len() - failed_gates.len();
        info!(
            session_id = %state.session_id,
            passed = passed_count,
            failed = failed_gates.len(),
            "Quality gates evaluated"
        );

        QualityGateResults {
            session_id: state.session_id.clone(),
            all_passed: failed_gates.is_empty(),
            passed_count,
            failed_gates,
            recommendations,
            results,
            evaluated_at: Utc::now(),
        }
    }

    /// Passes iff the build succeeded with few enough warnings.
    pub fn run_compilation_gate(&self, state: &SessionState) -> GateResult {
        let mut result = GateResult::new(GateKind::Compilation);

        match &state.compilation_status {
            None => {
                result.issues.push("Compilation status is unknown".to_string());
                result
                    .recommendations
                    .push("Run a build and record its outcome".to_string());
                result.details = "No compilation status captured".to_string();
            }
            Some(status) if !status.success || status.error_count > 0 => {
                result.issues.push(format!(
                    "Compilation failed with {} errors",
                    status.error_count
                ));
                result
                    .recommendations
                    .push("Fix all compilation errors before proceeding".to_string());
                result
                    .recommendations
                    .push("Review error messages and resolve missing imports".to_string());
                result.details = format!(
                    "errors: {}, warnings: {}",
                    status.error_count, status.warning_count
                );
            }
            Some(status) => {
                result.score = (100.0 - 2.0 * status.warning_count as f64).max(0.0);
                result.passed = result.score >= COMPILATION_PASS_SCORE;
                if status.warning_count > 0 {
                    result.issues.push(format!(
                        "Compilation successful but {} warnings found",
                        status.warning_count
                    ));
                    result
                        .recommendations
                        .push("Address compilation warnings".to_string());
                }
                result.details = format!("warnings: {}", status.warning_count);
            }
        }

        log_gate(&state.session_id, &result);
        result
    }

    /// Passes iff every document carries this snapshot's record. Reads the
    /// documents back and never writes them.
    pub async fn run_documentation_gate(&self, state: &SessionState) -> GateResult {
        let mut result = GateResult::new(GateKind::Documentation);

        let check = self.docs.check_projection(state).await;
        result.score = check.current_rate() * 100.0;
        result.passed = check.is_current();
        if !result.passed {
            result.issues.push(format!(
                "{} of {} documents do not reflect this snapshot",
                check.errors.len(),
                check.total_files
            ));
            for file_error in &check.errors {
                result
                    .issues
                    .push(format!("{}: {}", file_error.file, file_error.message));
            }
            result
                .recommendations
                .push("Checkpoint the session to refresh its documentation".to_string());
            if let Some(summary) = self.docs.last_summary() {
                if summary.session_id == state.session_id
                    && summary.snapshot_at == state.timestamp
                    && !summary.success
                {
                    result
                        .recommendations
                        .push("Check file permissions and disk space".to_string());
                }
            }
        }

        let consistency = self.docs.validate_consistency().await;
        if !consistency.consistent {
            result.issues.push(format!(
                "Documentation consistency issues found: {}",
                consistency.mismatches.len()
            ));
            result.issues.extend(consistency.mismatches);
            result
                .recommendations
                .push("Resolve documentation consistency issues".to_string());
        }

        result.details = format!(
            "{}/{} documents current",
            check.current_files.len(),
            check.total_files
        );

        log_gate(&state.session_id, &result);
        result
    }

    /// Passes iff phase and progress data are internally consistent.
    /// Always carries at least one recommendation.
    pub fn run_progress_gate(&self, state: &SessionState) -> GateResult {
        let mut result = GateResult::new(GateKind::Progress);
        let mut score: f64 = 100.0;
        let mut violations = 0;

        let progress = state.progress_percentage;
        if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
            result
                .issues
                .push(format!("Invalid progress percentage: {}", progress));
            result
                .recommendations
                .push("Keep progress within 0-100%".to_string());
            score -= 25.0;
            violations += 1;
        }

        if state.completed_tasks.is_empty() && progress > 10.0 {
            result
                .issues
                .push("Progress percentage inconsistent with completed tasks".to_string());
            result
                .recommendations
                .push("Record the completed tasks that account for the progress".to_string());
            score -= 20.0;
            violations += 1;
        }

        if state.last_completed_phase.trim().is_empty() {
            result
                .issues
                .push("Last completed phase is not specified".to_string());
            result
                .recommendations
                .push("Record the last completed phase".to_string());
            score -= 15.0;
            violations += 1;
        }

        if progress >= 100.0 && !state.in_progress_tasks.is_empty() {
            result.issues.push(format!(
                "Progress is 100% but {} tasks are still in progress",
                state.in_progress_tasks.len()
            ));
            result
                .recommendations
                .push("Finish or re-plan in-progress tasks before reporting completion".to_string());
            score -= 10.0;
            violations += 1;
        }

        let mismatched = state
            .completed_tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .chain(
                state
                    .in_progress_tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed),
            )
            .count();
        if mismatched > 0 {
            result
                .issues
                .push(format!("{} tasks are filed under the wrong status", mismatched));
            result
                .recommendations
                .push("Move tasks to the list matching their status".to_string());
            score -= 10.0;
            violations += 1;
        }

        if state.next_actions.is_empty() {
            result.issues.push("Next actions are not defined".to_string());
            result
                .recommendations
                .push("Define clear next actions for session continuation".to_string());
            score -= 10.0;
        }

        let known: Vec<&str> = state.task_ids().collect();
        let unknown_deps = state
            .next_actions
            .iter()
            .flat_map(|a| a.dependencies.iter())
            .filter(|d| !known.contains(&d.as_str()))
            .count();
        if unknown_deps > 0 {
            result.issues.push(format!(
                "{} next-action dependencies name unknown tasks",
                unknown_deps
            ));
            result
                .recommendations
                .push("Link next actions to recorded task ids".to_string());
            score -= 5.0;
        }

        if result.recommendations.is_empty() {
            result
                .recommendations
                .push("Progress data is consistent; continue with the next action".to_string());
        }

        result.score = score.max(0.0);
        result.passed = violations == 0;
        result.details = format!(
            "Completed tasks: {}, In progress: {}, consistency violations: {}",
            state.completed_tasks.len(),
            state.in_progress_tasks.len(),
            violations
        );

        log_gate(&state.session_id, &result);
        result
    }

    /// Composite health score; passes at 85 or above.
    pub fn run_quality_gate(&self, state: &SessionState) -> GateResult {
        let mut result = GateResult::new(GateKind::Quality);
        let mut score: f64 = 100.0;

        let compiled = state
            .compilation_status
            .as_ref()
            .is_some_and(|c| c.success && c.error_count == 0);
        if !compiled {
            result.issues.push("Code validation failed".to_string());
            result
                .recommendations
                .push("Fix code compilation issues".to_string());
            score -= 30.0;
        }

        match &state.database_status {
            Some(db) if db.connected => {
                if !db.schema_valid {
                    result.issues.push("Database schema is invalid".to_string());
                    result
                        .recommendations
                        .push("Run pending schema migrations".to_string());
                    score -= 10.0;
                }
            }
            _ => {
                result.issues.push("Database connection failed".to_string());
                result
                    .recommendations
                    .push("Restore database connectivity".to_string());
                score -= 20.0;
            }
        }

        if !validate_state(state).is_valid() {
            result.issues.push("Session state is incomplete".to_string());
            result
                .recommendations
                .push("Ensure complete session state capture".to_string());
            score -= 15.0;
        }

        if state.toolchain_version.trim().is_empty() {
            result
                .issues
                .push("Toolchain version is unknown".to_string());
            result
                .recommendations
                .push("Record the toolchain version".to_string());
            score -= 10.0;
        }

        if !state.build_tool_healthy() {
            result.issues.push(format!(
                "Build tool status is not healthy: '{}'",
                state.build_tool_status
            ));
            result
                .recommendations
                .push("Resolve build tool dependency issues".to_string());
            score -= 15.0;
        }

        let critical = state
            .known_issues
            .iter()
            .filter(|i| i.is_open() && i.severity == Severity::Critical)
            .count();
        if critical > 0 {
            result
                .issues
                .push(format!("Critical issues present: {}", critical));
            result
                .recommendations
                .push("Resolve all critical issues before proceeding".to_string());
            score -= 10.0 * critical as f64;
        }

        let warnings = state
            .compilation_status
            .as_ref()
            .map_or(0, |c| c.warning_count);
        score -= f64::from(warnings.min(10));

        result.score = score.max(0.0);
        result.passed = result.score >= QUALITY_PASS_SCORE;
        if !result.passed && result.recommendations.is_empty() {
            result
                .recommendations
                .push("Reduce compilation warnings".to_string());
        }
        result.details = format!("Composite quality score: {:.1}", result.score);

        log_gate(&state.session_id, &result);
        result
    }

    /// Request a bypass with a generated remediation plan.
    ///
    /// Fails closed: a blank justification or unknown gate is denied. Every
    /// request, approved or not, lands in the audit log.
    pub fn request_emergency_bypass(&self, gate: &str, justification: &str) -> BypassResult {
        let plan = gate
            .parse::<GateKind>()
            .map(remediation_plan)
            .unwrap_or_default();
        self.execute_emergency_bypass(gate, justification, plan)
    }

    /// Request a bypass with a caller-supplied remediation plan.
    pub fn execute_emergency_bypass(
        &self,
        gate: &str,
        justification: &str,
        remediation_plan: Vec<String>,
    ) -> BypassResult {
        warn!(gate = %gate, justification = %justification, "Emergency bypass requested");

        let remediation_plan: Vec<String> = remediation_plan
            .into_iter()
            .filter(|step| !step.trim().is_empty())
            .collect();

        let mut result = BypassResult {
            id: Uuid::new_v4(),
            gate_name: gate.to_string(),
            justification: justification.to_string(),
            remediation_plan,
            approved: false,
            reason: String::new(),
            conditions: Vec::new(),
            requested_at: Utc::now(),
        };

        let denial = match gate.parse::<GateKind>() {
            Err(e) => Some(e),
            Ok(_) if justification.trim().is_empty() => {
                Some("Justification is required for emergency bypass".to_string())
            }
            Ok(_) if result.remediation_plan.is_empty() => {
                Some("Remediation plan is required for emergency bypass".to_string())
            }
            Ok(kind) => {
                result.gate_name = kind.display_name().to_string();
                None
            }
        };

        match denial {
            Some(reason) => {
                error!(gate = %gate, reason = %reason, "Emergency bypass denied");
                result.reason = reason;
            }
            None => {
                result.approved = true;
                result.reason = "Emergency bypass approved with mandatory remediation".to_string();
                result.conditions = vec![
                    "Address bypassed issues within 24 hours".to_string(),
                    "Document all changes made during the bypass period".to_string(),
                    "Re-run all quality gates before the next checkpoint".to_string(),
                ];
                warn!(
                    gate = %result.gate_name,
                    bypass_id = %result.id,
                    "Emergency bypass approved; remediation required"
                );
            }
        }

        self.audit_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());
        result
    }

    /// Every bypass request so far, oldest first.
    pub fn audit_log(&self) -> Vec<BypassResult> {
        self.audit_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn remediation_plan(kind: GateKind) -> Vec<String> {
    let specific = match kind {
        GateKind::Compilation => [
            "Reproduce the failing build locally",
            "Fix all compilation errors and warnings above threshold",
        ],
        GateKind::Documentation => [
            "Identify the documents that failed to update",
            "Restore write access and re-run documentation sync",
        ],
        GateKind::Progress => [
            "Reconcile task lists with the reported progress",
            "Record the last completed phase and next actions",
        ],
        GateKind::Quality => [
            "Restore datastore connectivity and toolchain detection",
            "Resolve open critical issues",
        ],
    };

    specific
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(format!(
            "Re-run the {} and confirm it passes",
            kind.display_name()
        )))
        .collect()
}

fn log_gate(session_id: &str, result: &GateResult) {
    if result.passed {
        info!(session_id = %session_id, gate = %result.name, score = result.score, "Gate passed");
    } else {
        warn!(
            session_id = %session_id,
            gate = %result.name,
            score = result.score,
            issues = result.issues.len(),
            "Gate failed"
        );
    }
}
