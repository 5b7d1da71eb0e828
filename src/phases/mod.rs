//! Work phases: completion checks, successor lookup and progress tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::state::{SessionState, TaskStatus};

/// Phase id reported once the final phase is done.
pub const COMPLETE_PHASE_ID: &str = "COMPLETE";

/// One named phase of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Stable id, e.g. `Phase 2.1`. Matches task phase tags.
    pub id: String,
    pub name: String,
    pub description: String,
    pub estimated_minutes: u32,
    pub deliverables: Vec<String>,
}

impl PhaseDefinition {
    fn new(
        id: &str,
        name: &str,
        description: &str,
        estimated_minutes: u32,
        deliverables: &[&str],
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            estimated_minutes,
            deliverables: deliverables.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Default phase ordering.
pub fn default_catalog() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition::new(
            "Phase 1.1",
            "Project Foundation",
            "Repository layout, build and toolchain baseline",
            60,
            &["Build passes", "Toolchain pinned"],
        ),
        PhaseDefinition::new(
            "Phase 1.2",
            "Configuration & Logging",
            "Environment-driven configuration and structured logging",
            45,
            &["Configuration loads from environment", "Logs are structured"],
        ),
        PhaseDefinition::new(
            "Phase 2.1",
            "Core Data Model",
            "Session state model and validation",
            90,
            &["State model", "Validation rules"],
        ),
        PhaseDefinition::new(
            "Phase 2.2",
            "Redundant Storage",
            "Storage backends and quorum writes",
            120,
            &["Backends", "Quorum writes", "Cross-validation"],
        ),
        PhaseDefinition::new(
            "Phase 2.3",
            "Documentation Projection",
            "Projected documents and record format",
            60,
            &["Document set", "Record codec"],
        ),
        PhaseDefinition::new(
            "Phase 3.1",
            "Quality Gates",
            "Gate battery and bypass governance",
            90,
            &["Gates", "Bypass audit"],
        ),
        PhaseDefinition::new(
            "Phase 3.2",
            "Context Recovery",
            "Confidence-scored reconstruction",
            120,
            &["Source polling", "Merge rules", "Recovery report"],
        ),
        PhaseDefinition::new(
            "Phase 4.1",
            "Integration",
            "End-to-end checkpoint and recovery flows",
            90,
            &["Checkpoint pipeline", "CLI"],
        ),
        PhaseDefinition::new(
            "Phase 4.2",
            "Hardening",
            "Concurrency, failure injection and release",
            60,
            &["Concurrency tests", "Release build"],
        ),
    ]
}

/// Whether a phase's work is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseValidationResult {
    pub phase_id: String,
    pub phase_name: Option<String>,
    /// True iff completion is 100%.
    pub valid: bool,
    pub completion_percentage: f64,
    pub tasks_completed: usize,
    pub tasks_total: usize,
    pub issues: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

/// The phase to work on next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextPhaseRecommendation {
    /// Last completed phase, empty if none.
    pub current_phase_id: String,
    pub next_phase_id: String,
    pub next_phase_name: String,
    pub estimated_minutes: u32,
    pub preparation_steps: Vec<String>,
    pub ready_to_proceed: bool,
    pub recommended_at: DateTime<Utc>,
}

/// Progress of a session against the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressTrackingResult {
    pub session_id: String,
    /// The session's own progress percentage.
    pub overall_progress: f64,
    /// Catalog prefix through the last completed phase.
    pub completed_phases: Vec<String>,
    /// Phase in progress; `None` once every phase is done.
    pub current_phase: Option<String>,
    pub phase_progress: f64,
    pub estimated_minutes_remaining: u32,
    pub next_actions: Vec<String>,
    pub tracked_at: DateTime<Utc>,
}

/// Interprets session states against an ordered phase catalog.
pub struct PhaseManager {
    phases: Vec<PhaseDefinition>,
}

impl Default for PhaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseManager {
    /// Create a manager over the default catalog.
    pub fn new() -> Self {
        Self {
            phases: default_catalog(),
        }
    }

    /// Create a manager over a custom catalog.
    ///
    /// # Errors
    /// Returns a validation error for an empty catalog, a blank id, or a
    /// duplicate id.
    pub fn with_catalog(phases: Vec<PhaseDefinition>) -> AppResult<Self> {
        if phases.is_empty() {
            return Err(AppError::Validation {
                field: "phases".to_string(),
                reason: "catalog must not be empty".to_string(),
            });
        }
        for (i, phase) in phases.iter().enumerate() {
            if phase.id.trim().is_empty() {
                return Err(AppError::Validation {
                    field: "phases".to_string(),
                    reason: format!("phase {} has no id", i + 1),
                });
            }
            if phases[..i].iter().any(|p| p.id == phase.id) {
                return Err(AppError::Validation {
                    field: "phases".to_string(),
                    reason: format!("duplicate phase id {}", phase.id),
                });
            }
        }
        Ok(Self { phases })
    }

    /// Phases in order.
    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    /// Look up a phase by id.
    pub fn phase(&self, phase_id: &str) -> Option<&PhaseDefinition> {
        self.position(phase_id).map(|i| &self.phases[i])
    }

    fn position(&self, phase_id: &str) -> Option<usize> {
        let phase_id = phase_id.trim();
        self.phases.iter().position(|p| p.id == phase_id)
    }

    /// Index of the last completed phase, if it is in the catalog.
    fn completed_through(&self, state: &SessionState) -> Option<usize> {
        self.position(&state.last_completed_phase)
    }

    /// Check whether `phase_id` is complete for `state`.
    ///
    /// A phase at or before the last completed phase is complete. A later
    /// phase is judged by the share of its tagged tasks that are done.
    pub fn validate_phase_completion(&self, phase_id: &str, state: &SessionState) -> PhaseValidationResult {
        let Some(index) = self.position(phase_id) else {
            warn!(phase_id = %phase_id, "Unknown phase");
            return PhaseValidationResult {
                phase_id: phase_id.to_string(),
                phase_name: None,
                valid: false,
                completion_percentage: 0.0,
                tasks_completed: 0,
                tasks_total: 0,
                issues: vec![format!("Unknown phase: {}", phase_id)],
                validated_at: Utc::now(),
            };
        };
        let phase = &self.phases[index];

        let (tasks_completed, tasks_total) = tagged_task_counts(state, &phase.id);
        let mut issues = Vec::new();

        let completion_percentage = if self
            .completed_through(state)
            .is_some_and(|done| index <= done)
        {
            100.0
        } else if tasks_total == 0 {
            issues.push(format!("No tasks recorded for {}", phase.id));
            0.0
        } else {
            let pct = tasks_completed as f64 / tasks_total as f64 * 100.0;
            for task in state
                .in_progress_tasks
                .iter()
                .filter(|t| t.phase == phase.id && t.status != TaskStatus::Completed)
            {
                issues.push(format!("Task {} is not complete: {}", task.id, task.description));
            }
            pct
        };

        let valid = completion_percentage >= 100.0;
        info!(
            phase_id = %phase.id,
            completion = completion_percentage,
            valid,
            "Phase validated"
        );

        PhaseValidationResult {
            phase_id: phase.id.clone(),
            phase_name: Some(phase.name.clone()),
            valid,
            completion_percentage,
            tasks_completed,
            tasks_total,
            issues,
            validated_at: Utc::now(),
        }
    }

    /// Recommend the successor of the last completed phase.
    pub fn recommend_next_phase(&self, state: &SessionState) -> NextPhaseRecommendation {
        let current = state.last_completed_phase.trim();
        let first = &self.phases[0];

        let (next, ready_to_proceed) = if current.is_empty() {
            (Some(first), true)
        } else {
            match self.position(current) {
                Some(i) => (self.phases.get(i + 1), true),
                None => {
                    warn!(phase = %current, "Last completed phase is not in the catalog");
                    (Some(first), false)
                }
            }
        };

        let recommendation = match next {
            Some(phase) => NextPhaseRecommendation {
                current_phase_id: current.to_string(),
                next_phase_id: phase.id.clone(),
                next_phase_name: phase.name.clone(),
                estimated_minutes: phase.estimated_minutes,
                preparation_steps: preparation_steps(phase, ready_to_proceed, current),
                ready_to_proceed,
                recommended_at: Utc::now(),
            },
            None => NextPhaseRecommendation {
                current_phase_id: current.to_string(),
                next_phase_id: COMPLETE_PHASE_ID.to_string(),
                next_phase_name: "Project Complete".to_string(),
                estimated_minutes: 0,
                preparation_steps: vec![
                    "Run the full quality gate battery".to_string(),
                    "Checkpoint the final session state".to_string(),
                ],
                ready_to_proceed: true,
                recommended_at: Utc::now(),
            },
        };

        debug!(
            from = %recommendation.current_phase_id,
            to = %recommendation.next_phase_id,
            "Next phase recommended"
        );
        recommendation
    }

    /// Project the session's progress onto the catalog.
    pub fn track_progress(&self, state: &SessionState) -> ProgressTrackingResult {
        let done = self.completed_through(state);
        let completed_phases: Vec<String> = match done {
            Some(i) => self.phases[..=i].iter().map(|p| p.id.clone()).collect(),
            None => Vec::new(),
        };

        let current_index = done.map_or(0, |i| i + 1);
        let current = self.phases.get(current_index);

        let phase_progress = current.map_or(100.0, |phase| {
            let (completed, total) = tagged_task_counts(state, &phase.id);
            if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64 * 100.0
            }
        });

        let estimated_minutes_remaining = current.map_or(0, |phase| {
            let rest: u32 = self.phases[current_index + 1..]
                .iter()
                .map(|p| p.estimated_minutes)
                .sum();
            let left = f64::from(phase.estimated_minutes) * (100.0 - phase_progress) / 100.0;
            rest + left.round() as u32
        });

        let next_actions = match current {
            Some(phase) => {
                let mut actions: Vec<String> = state
                    .in_progress_tasks
                    .iter()
                    .filter(|t| t.phase == phase.id)
                    .take(3)
                    .map(|t| format!("Complete: {}", t.description))
                    .collect();
                if actions.is_empty() {
                    actions.push(format!("Start {}: {}", phase.id, phase.name));
                }
                actions
            }
            None => vec!["All phases complete".to_string()],
        };

        ProgressTrackingResult {
            session_id: state.session_id.clone(),
            overall_progress: state.progress_percentage,
            completed_phases,
            current_phase: current.map(|p| p.id.clone()),
            phase_progress,
            estimated_minutes_remaining,
            next_actions,
            tracked_at: Utc::now(),
        }
    }
}

/// Completed and total task counts tagged with `phase_id`.
fn tagged_task_counts(state: &SessionState, phase_id: &str) -> (usize, usize) {
    let completed = state
        .completed_tasks
        .iter()
        .filter(|t| t.phase == phase_id)
        .count();
    let open = state
        .in_progress_tasks
        .iter()
        .filter(|t| t.phase == phase_id && t.status != TaskStatus::Completed)
        .count();
    (completed, completed + open)
}

fn preparation_steps(phase: &PhaseDefinition, ready: bool, current: &str) -> Vec<String> {
    let mut steps = Vec::new();
    if !ready {
        steps.push(format!(
            "Phase '{}' is not in the catalog; confirm where the session stands",
            current
        ));
    }
    steps.push(format!("Review deliverables for {}: {}", phase.id, phase.deliverables.join(", ")));
    steps.push(format!("Budget about {} minutes", phase.estimated_minutes));
    steps
}
