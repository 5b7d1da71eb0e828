//! Service layer wiring the continuity components together.
//!
//! This module provides:
//! - The checkpoint pipeline: validate, store, project, gate
//! - Recovery with phase interpretation
//! - A bounded worker pool for concurrent checkpoints

mod pool;

pub use pool::CheckpointPool;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::docs::{DocumentationSynchronizer, UpdateSummary};
use crate::environment::TechnicalEnvironmentTracker;
use crate::error::{AppResult, RecoveryResult};
use crate::gates::{QualityGateManager, QualityGateResults};
use crate::phases::{NextPhaseRecommendation, PhaseManager, ProgressTrackingResult};
use crate::recovery::{ContextRecoveryEngine, RecoveryReport};
use crate::redundancy::{RedundancyManager, RedundancyStorageResult};
use crate::state::{ContinuationPoint, SessionState, SessionStateManager, ValidationResult};
use crate::storage::{open_default_backends, StorageBackend};

/// Everything that happened to one checkpoint.
///
/// Stages after a failed stage are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointReport {
    pub session_id: String,
    pub validation: ValidationResult,
    pub storage: Option<RedundancyStorageResult>,
    pub documentation: Option<UpdateSummary>,
    pub gates: Option<QualityGateResults>,
    /// Where to resume; present once the state passed validation.
    pub continuation: Option<ContinuationPoint>,
    pub completed_at: DateTime<Utc>,
}

impl CheckpointReport {
    /// Whether the state was validated and stored with quorum.
    pub fn persisted(&self) -> bool {
        self.validation.valid && self.storage.as_ref().is_some_and(|s| s.success)
    }

    /// Whether every stage ran and succeeded.
    pub fn fully_succeeded(&self) -> bool {
        self.persisted()
            && self.documentation.as_ref().is_some_and(|d| d.success)
            && self.gates.as_ref().is_some_and(|g| g.all_passed)
    }
}

/// Recovery result plus where the session stands in the phase catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub report: RecoveryReport,
    pub next_phase: NextPhaseRecommendation,
    pub progress: ProgressTrackingResult,
}

/// Shared handle to every continuity component.
pub struct ContinuityService {
    states: SessionStateManager,
    redundancy: Arc<RedundancyManager>,
    docs: Arc<DocumentationSynchronizer>,
    gates: QualityGateManager,
    recovery: ContextRecoveryEngine,
    phases: PhaseManager,
    environment: TechnicalEnvironmentTracker,
}

impl ContinuityService {
    /// Build a service over explicit backends.
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>, config: &Config) -> Self {
        let redundancy = Arc::new(RedundancyManager::new(
            backends,
            config.storage.write_timeout(),
        ));
        let docs = Arc::new(DocumentationSynchronizer::new(config.docs.dir.clone()));

        Self {
            states: SessionStateManager::new(),
            gates: QualityGateManager::new(docs.clone()),
            recovery: ContextRecoveryEngine::new(
                redundancy.clone(),
                docs.clone(),
                config.recovery.clone(),
            ),
            phases: PhaseManager::new(),
            environment: TechnicalEnvironmentTracker::new(config.environment.clone()),
            redundancy,
            docs,
        }
    }

    /// Open the default backends and build a service over them.
    pub async fn open(config: &Config) -> AppResult<Self> {
        let backends = open_default_backends(&config.storage, &config.database).await?;
        let environment = TechnicalEnvironmentTracker::new(config.environment.clone())
            .with_database(backends.sqlite.pool().clone());

        info!(
            backends = backends.all.len(),
            data_dir = %config.storage.data_dir.display(),
            docs_dir = %config.docs.dir.display(),
            "Continuity service opened"
        );

        Ok(Self::new(backends.all, config).with_environment(environment))
    }

    /// Replace the environment tracker.
    pub fn with_environment(mut self, environment: TechnicalEnvironmentTracker) -> Self {
        self.environment = environment;
        self
    }

    /// Replace the phase catalog.
    pub fn with_phases(mut self, phases: PhaseManager) -> Self {
        self.phases = phases;
        self
    }

    pub fn states(&self) -> &SessionStateManager {
        &self.states
    }

    pub fn redundancy(&self) -> &RedundancyManager {
        &self.redundancy
    }

    pub fn docs(&self) -> &DocumentationSynchronizer {
        &self.docs
    }

    pub fn gates(&self) -> &QualityGateManager {
        &self.gates
    }

    pub fn recovery(&self) -> &ContextRecoveryEngine {
        &self.recovery
    }

    pub fn phases(&self) -> &PhaseManager {
        &self.phases
    }

    pub fn environment(&self) -> &TechnicalEnvironmentTracker {
        &self.environment
    }

    /// Run the full checkpoint pipeline for one snapshot.
    ///
    /// An invalid state never reaches storage. A state that misses quorum is
    /// not projected, so the documents never run ahead of the backends.
    pub async fn checkpoint(&self, state: &SessionState) -> CheckpointReport {
        let validation = self.states.capture_session_state(state);
        let mut report = CheckpointReport {
            session_id: state.session_id.clone(),
            validation,
            storage: None,
            documentation: None,
            gates: None,
            continuation: None,
            completed_at: Utc::now(),
        };
        if !report.validation.valid {
            return report;
        }
        report.continuation = Some(ContinuationPoint::from_state(state));

        let storage = self.redundancy.store_with_redundancy(state).await;
        let stored = storage.success;
        report.storage = Some(storage);
        if !stored {
            warn!(session_id = %state.session_id, "Checkpoint not persisted; skipping projection");
            report.completed_at = Utc::now();
            return report;
        }

        report.documentation = Some(self.docs.update_all_files(state).await);
        report.gates = Some(self.gates.run_all_gates(state).await);
        report.completed_at = Utc::now();

        info!(
            session_id = %state.session_id,
            fully_succeeded = report.fully_succeeded(),
            "Checkpoint complete"
        );
        report
    }

    /// Recover a session and place it in the phase catalog.
    pub async fn recover(&self, session_id: &str) -> RecoveryResult<RecoveryOutcome> {
        let report = self.recovery.generate_recovery_report(session_id).await?;
        let state = report.context.to_session_state();

        Ok(RecoveryOutcome {
            next_phase: self.phases.recommend_next_phase(&state),
            progress: self.phases.track_progress(&state),
            report,
        })
    }
}
