//! Redundant persistence of session states across independent backends.
//!
//! A write fans out to every backend in parallel under a per-backend
//! deadline. It succeeds when a majority quorum accepted it and no reachable
//! backend rejected it. Cross-validation reads every backend back and scores
//! element-level agreement, treating an unreadable copy as disagreement.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::state::{project, validate_state, ElementType, SessionState};
use crate::storage::StorageBackend;

/// Location name used for validation failures in a storage result.
pub const VALIDATION_LOCATION: &str = "validation";

/// A failure recorded against one storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationError {
    pub location: String,
    pub message: String,
    /// Whether the backend could not be reached at all.
    pub unreachable: bool,
}

impl LocationError {
    fn from_storage(location: &str, error: &StorageError) -> Self {
        Self {
            location: location.to_string(),
            message: error.to_string(),
            unreachable: error.is_unreachable(),
        }
    }
}

/// Outcome of a redundant write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyStorageResult {
    pub success: bool,
    pub session_id: String,
    /// Locations that accepted the write, in backend order.
    pub storage_locations: Vec<String>,
    /// Per-location failures, in backend order.
    pub errors: Vec<LocationError>,
    /// Minimum number of accepting backends for success.
    pub quorum: usize,
    pub stored_at: DateTime<Utc>,
}

impl RedundancyStorageResult {
    /// Failures caused by unreachable backends.
    pub fn partial_failures(&self) -> impl Iterator<Item = &LocationError> {
        self.errors.iter().filter(|e| e.unreachable)
    }
}

/// Agreement of the stored copies of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossValidationResult {
    pub session_id: Option<String>,
    /// True iff every configured backend holds an identical copy.
    pub consistent: bool,
    /// Mean per-element agreement, scaled 0-100.
    pub consistency_score: f64,
    pub layers_checked: usize,
    /// Backends that returned a readable copy.
    pub layers_responding: usize,
    pub issues: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

/// How well a session could be recovered from storage alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryCapability {
    pub session_id: String,
    pub total_backends: usize,
    /// Locations holding a readable copy.
    pub readable_locations: Vec<String>,
    pub unreadable: Vec<LocationError>,
    /// At least one readable copy exists.
    pub recoverable: bool,
    /// Losing any single backend would still leave a readable copy.
    pub survives_single_loss: bool,
}

/// What one backend returned for a session.
#[derive(Debug, Clone)]
pub enum LayerOutcome {
    Found(SessionState),
    Missing,
    Failed(LocationError),
}

/// A backend read, tagged with its location.
#[derive(Debug, Clone)]
pub struct LayerRead {
    pub location: String,
    pub outcome: LayerOutcome,
}

impl LayerRead {
    /// The copy, if the backend returned one.
    pub fn state(&self) -> Option<&SessionState> {
        match &self.outcome {
            LayerOutcome::Found(state) => Some(state),
            _ => None,
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Persists session states to a fixed set of backends.
pub struct RedundancyManager {
    backends: Vec<Arc<dyn StorageBackend>>,
    timeout: Duration,
    last_session: RwLock<Option<String>>,
}

impl RedundancyManager {
    /// Create a manager over `backends` with a per-backend deadline.
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>, timeout: Duration) -> Self {
        Self {
            backends,
            timeout,
            last_session: RwLock::new(None),
        }
    }

    /// The configured backends, in order.
    pub fn backends(&self) -> &[Arc<dyn StorageBackend>] {
        &self.backends
    }

    /// Minimum number of accepting backends: a majority, rounded up.
    pub fn quorum(&self) -> usize {
        self.backends.len().div_ceil(2).max(1)
    }

    /// Id of the session most recently stored through this manager.
    pub fn last_session(&self) -> Option<String> {
        self.last_session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate `state` and write it to every backend in parallel.
    ///
    /// An invalid state never reaches a backend; its validation errors are
    /// reported under [`VALIDATION_LOCATION`].
    pub async fn store_with_redundancy(&self, state: &SessionState) -> RedundancyStorageResult {
        let start = Instant::now();
        let quorum = self.quorum();

        let validation = validate_state(state);
        if !validation.is_valid() {
            warn!(
                session_id = %state.session_id,
                errors = validation.errors.len(),
                "Refusing to store invalid session state"
            );
            return RedundancyStorageResult {
                success: false,
                session_id: state.session_id.clone(),
                storage_locations: Vec::new(),
                errors: validation
                    .errors
                    .into_iter()
                    .map(|message| LocationError {
                        location: VALIDATION_LOCATION.to_string(),
                        message,
                        unreachable: false,
                    })
                    .collect(),
                quorum,
                stored_at: Utc::now(),
            };
        }

        let outcomes = self.fan_out_writes(state).await;

        let mut storage_locations = Vec::new();
        let mut errors = Vec::new();
        for (backend, outcome) in self.backends.iter().zip(outcomes) {
            match outcome {
                Ok(()) => storage_locations.push(backend.location().to_string()),
                Err(error) => errors.push(error),
            }
        }

        let rejected = errors.iter().any(|e| !e.unreachable);
        let success = storage_locations.len() >= quorum && !rejected;

        if success {
            *self
                .last_session
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(state.session_id.clone());
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        if success && errors.is_empty() {
            info!(
                session_id = %state.session_id,
                locations = storage_locations.len(),
                latency_ms,
                "Session state stored redundantly"
            );
        } else {
            warn!(
                session_id = %state.session_id,
                success,
                accepted = storage_locations.len(),
                failed = errors.len(),
                quorum,
                latency_ms,
                "Redundant write degraded"
            );
        }

        RedundancyStorageResult {
            success,
            session_id: state.session_id.clone(),
            storage_locations,
            errors,
            quorum,
            stored_at: Utc::now(),
        }
    }

    /// One outcome per backend, in backend order.
    async fn fan_out_writes(&self, state: &SessionState) -> Vec<Result<(), LocationError>> {
        let shared = Arc::new(state.clone());
        let mut join_set = JoinSet::new();

        for (index, backend) in self.backends.iter().enumerate() {
            let backend = Arc::clone(backend);
            let state = Arc::clone(&shared);
            let timeout = self.timeout;
            join_set.spawn(async move {
                let location = backend.location().to_string();
                let result = match tokio::time::timeout(timeout, backend.write(&state)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(LocationError::from_storage(&location, &e)),
                    Err(_) => Err(LocationError::from_storage(
                        &location,
                        &StorageError::Timeout {
                            location: location.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        },
                    )),
                };
                (index, result)
            });
        }

        let mut outcomes: Vec<Option<Result<(), LocationError>>> = vec![None; self.backends.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => outcomes[index] = Some(result),
                Err(e) => warn!(error = %e, "Backend write task failed"),
            }
        }

        outcomes
            .into_iter()
            .zip(&self.backends)
            .map(|(outcome, backend)| {
                outcome.unwrap_or_else(|| {
                    Err(LocationError {
                        location: backend.location().to_string(),
                        message: "write task aborted".to_string(),
                        unreachable: false,
                    })
                })
            })
            .collect()
    }

    /// Read `session_id` from every backend in parallel, each under the
    /// manager's deadline. Results are in backend order.
    pub async fn read_all(&self, session_id: &str) -> Vec<LayerRead> {
        self.read_all_within(session_id, self.timeout).await
    }

    /// Like [`read_all`](Self::read_all) with an explicit deadline.
    pub async fn read_all_within(&self, session_id: &str, deadline: Duration) -> Vec<LayerRead> {
        let mut join_set = JoinSet::new();

        for (index, backend) in self.backends.iter().enumerate() {
            let backend = Arc::clone(backend);
            let session_id = session_id.to_string();
            join_set.spawn(async move {
                let location = backend.location().to_string();
                let outcome = match tokio::time::timeout(deadline, backend.read(&session_id)).await
                {
                    Ok(Ok(Some(state))) => LayerOutcome::Found(state),
                    Ok(Ok(None)) => LayerOutcome::Missing,
                    Ok(Err(e)) => LayerOutcome::Failed(LocationError::from_storage(&location, &e)),
                    Err(_) => LayerOutcome::Failed(LocationError::from_storage(
                        &location,
                        &StorageError::Timeout {
                            location: location.clone(),
                            timeout_ms: deadline.as_millis() as u64,
                        },
                    )),
                };
                (index, LayerRead { location, outcome })
            });
        }

        let mut reads: Vec<Option<LayerRead>> = vec![None; self.backends.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, read)) => reads[index] = Some(read),
                Err(e) => warn!(error = %e, "Backend read task failed"),
            }
        }

        reads
            .into_iter()
            .zip(&self.backends)
            .map(|(read, backend)| {
                read.unwrap_or_else(|| {
                    let location = backend.location().to_string();
                    LayerRead {
                        outcome: LayerOutcome::Failed(LocationError {
                            location: location.clone(),
                            message: "read task aborted".to_string(),
                            unreachable: false,
                        }),
                        location,
                    }
                })
            })
            .collect()
    }

    /// Cross-validate the session most recently stored through this manager.
    ///
    /// Vacuously consistent when nothing has been stored yet.
    pub async fn cross_validate_all_layers(&self) -> CrossValidationResult {
        match self.last_session() {
            Some(session_id) => self.cross_validate_session(&session_id).await,
            None => CrossValidationResult {
                session_id: None,
                consistent: true,
                consistency_score: 100.0,
                layers_checked: 0,
                layers_responding: 0,
                issues: Vec::new(),
                validated_at: Utc::now(),
            },
        }
    }

    /// Compare every backend's copy of `session_id` element by element.
    pub async fn cross_validate_session(&self, session_id: &str) -> CrossValidationResult {
        let reads = self.read_all(session_id).await;
        let result = score_agreement(session_id, &reads);

        debug!(
            session_id = %session_id,
            score = result.consistency_score,
            responding = result.layers_responding,
            "Cross-validation complete"
        );
        if !result.consistent {
            warn!(
                session_id = %session_id,
                score = result.consistency_score,
                issues = result.issues.len(),
                "Storage layers disagree"
            );
        }

        result
    }

    /// Report how many backends could serve `session_id` right now.
    pub async fn analyze_recovery_capability(&self, session_id: &str) -> RecoveryCapability {
        let reads = self.read_all(session_id).await;

        let mut readable_locations = Vec::new();
        let mut unreadable = Vec::new();
        for read in reads {
            match read.outcome {
                LayerOutcome::Found(_) => readable_locations.push(read.location),
                LayerOutcome::Missing => {}
                LayerOutcome::Failed(error) => unreadable.push(error),
            }
        }

        RecoveryCapability {
            session_id: session_id.to_string(),
            total_backends: self.backends.len(),
            recoverable: !readable_locations.is_empty(),
            survives_single_loss: readable_locations.len() >= 2,
            readable_locations,
            unreadable,
        }
    }
}

/// Per-element agreement over all configured layers.
///
/// Within each element the readable copies are grouped by value. A layer
/// that is unreadable or holds no copy never groups with anything, so it
/// disagrees on every element. Agreement is the largest group over the
/// layer count; a session no layer holds scores 0.
fn score_agreement(session_id: &str, reads: &[LayerRead]) -> CrossValidationResult {
    let total = reads.len();
    let mut issues = Vec::new();

    if total == 0 {
        return CrossValidationResult {
            session_id: Some(session_id.to_string()),
            consistent: true,
            consistency_score: 100.0,
            layers_checked: 0,
            layers_responding: 0,
            issues,
            validated_at: Utc::now(),
        };
    }

    let projections: Vec<_> = reads
        .iter()
        .filter_map(|read| read.state().map(project))
        .collect();
    if projections.is_empty() {
        issues.push("No layer holds a readable copy of the session".to_string());
    }

    for read in reads {
        match &read.outcome {
            LayerOutcome::Missing => {
                issues.push(format!("Layer {} holds no copy of the session", read.location))
            }
            LayerOutcome::Failed(error) => {
                issues.push(format!("Layer {} unreadable: {}", read.location, error.message))
            }
            LayerOutcome::Found(_) => {}
        }
    }

    let mut agreement_sum = 0.0;
    let mut consistent = true;

    for element in ElementType::ALL {
        let mut groups: HashMap<Option<&str>, usize> = HashMap::new();
        for elements in &projections {
            let value = elements.get(&element).map(String::as_str);
            *groups.entry(value).or_default() += 1;
        }

        let largest = groups.values().copied().max().unwrap_or(0);
        agreement_sum += largest as f64 / total as f64;

        if largest < total {
            consistent = false;
            if groups.len() > 1 {
                issues.push(format!(
                    "Element {} disagrees: {}/{} layers agree",
                    element, largest, total
                ));
            }
        }
    }

    let layers_responding = reads.iter().filter(|r| r.state().is_some()).count();
    let distinct_ids: BTreeSet<&str> = reads
        .iter()
        .filter_map(|r| r.state().map(|s| s.session_id.as_str()))
        .collect();
    if distinct_ids.iter().any(|id| *id != session_id) {
        issues.push(format!("Layers returned foreign session ids: {:?}", distinct_ids));
    }

    CrossValidationResult {
        session_id: Some(session_id.to_string()),
        consistent,
        consistency_score: agreement_sum / ElementType::ALL.len() as f64 * 100.0,
        layers_checked: total,
        layers_responding,
        issues,
        validated_at: Utc::now(),
    }
}
