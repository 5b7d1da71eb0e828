//! Confidence-scored reconstruction of a session from surviving copies.
//!
//! Every storage backend and every projected document is polled in parallel
//! under a fixed deadline. Fragments are merged per canonical element: the
//! newest write wins, then the value with the most supporting sources, then
//! source order. Each recovered element contributes a weight that depends
//! on the largest group of sources agreeing on one value, so losing a
//! source can only lower the overall confidence.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::docs::{record_write_order, DocumentOutcome, DocumentationSynchronizer};
use crate::error::{RecoveryError, RecoveryResult};
use crate::redundancy::{LayerOutcome, RecoveryCapability, RedundancyManager};
use crate::state::{rebuild, ElementType, SessionState, ValidationResult};

/// Below this confidence a reconstruction is not trusted without review.
pub const MIN_ACCEPTABLE_CONFIDENCE: f64 = 0.6;

/// Elements a usable reconstruction cannot do without.
pub const ESSENTIAL_ELEMENTS: [ElementType; 4] = [
    ElementType::SessionId,
    ElementType::Timestamp,
    ElementType::Phase,
    ElementType::Progress,
];

/// One recovered element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextElement {
    pub element_type: ElementType,
    /// Canonical encoding of the value.
    pub value: String,
    /// First source holding the winning value.
    pub source_location: String,
    /// Weight this element contributes to the overall confidence.
    pub confidence: f64,
    /// Every source holding the winning value.
    pub supporting_sources: Vec<String>,
}

/// How a disagreement between sources was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub element: ElementType,
    pub winner: String,
    pub winning_value: String,
    /// Sources holding a different value.
    pub dissenting_sources: Vec<String>,
}

/// A source that could not be read before the deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub message: String,
}

/// Best-available reconstruction of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructedContext {
    pub session_id: String,
    /// 0-1.
    pub confidence: f64,
    /// Recovered elements, in canonical order.
    pub elements: Vec<ContextElement>,
    /// Unrecoverable elements, in canonical order.
    pub missing_elements: Vec<ElementType>,
    pub conflicts: Vec<ConflictResolution>,
    pub sources_consulted: Vec<String>,
    pub sources_responded: Vec<String>,
    pub failed_sources: Vec<SourceFailure>,
    pub recommendations: Vec<String>,
    pub reconstructed_at: DateTime<Utc>,
}

impl ReconstructedContext {
    /// The recovered element of the given type.
    pub fn element(&self, element_type: ElementType) -> Option<&ContextElement> {
        self.elements.iter().find(|e| e.element_type == element_type)
    }

    /// Recovered value of the given element.
    pub fn value(&self, element_type: ElementType) -> Option<&str> {
        self.element(element_type).map(|e| e.value.as_str())
    }

    /// Rebuild a session state from the recovered elements.
    pub fn to_session_state(&self) -> SessionState {
        let elements: BTreeMap<ElementType, String> = self
            .elements
            .iter()
            .map(|e| (e.element_type, e.value.clone()))
            .collect();
        rebuild(&elements)
    }
}

/// Human-oriented summary of a recovery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub session_id: String,
    pub context: ReconstructedContext,
    pub validation: ValidationResult,
    pub capability: RecoveryCapability,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
}

struct Source {
    name: String,
    written: i64,
    elements: BTreeMap<ElementType, String>,
}

struct Candidate<'a> {
    value: &'a str,
    supporters: Vec<usize>,
    newest: i64,
}

// ============================================================================
// Engine
// ============================================================================

/// Rebuilds session context from redundant copies.
pub struct ContextRecoveryEngine {
    redundancy: Arc<RedundancyManager>,
    docs: Arc<DocumentationSynchronizer>,
    config: RecoveryConfig,
}

impl ContextRecoveryEngine {
    /// Create an engine over the given sources.
    pub fn new(
        redundancy: Arc<RedundancyManager>,
        docs: Arc<DocumentationSynchronizer>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            redundancy,
            docs,
            config,
        }
    }

    /// Reconstruct `session_id` from whatever sources answer in time.
    ///
    /// Always yields a context for a non-empty id; gaps lower the
    /// confidence instead of failing the call.
    pub async fn reconstruct_context(&self, session_id: &str) -> RecoveryResult<ReconstructedContext> {
        if session_id.trim().is_empty() {
            return Err(RecoveryError::EmptySessionId);
        }

        let deadline = self.config.deadline();
        let (layers, documents) = tokio::join!(
            self.redundancy.read_all_within(session_id, deadline),
            tokio::time::timeout(deadline, self.docs.read_records(session_id)),
        );

        let mut sources = Vec::new();
        let mut sources_consulted = Vec::new();
        let mut sources_responded = Vec::new();
        let mut failed_sources = Vec::new();

        for layer in layers {
            sources_consulted.push(layer.location.clone());
            match layer.outcome {
                LayerOutcome::Found(state) if state.session_id == session_id => {
                    sources_responded.push(layer.location.clone());
                    sources.push(Source {
                        written: crate::storage::write_order(&state),
                        elements: crate::state::project(&state),
                        name: layer.location,
                    });
                }
                LayerOutcome::Found(_) | LayerOutcome::Missing => {}
                LayerOutcome::Failed(error) => failed_sources.push(SourceFailure {
                    source: layer.location,
                    message: error.message,
                }),
            }
        }

        match documents {
            Ok(reads) => {
                for read in reads {
                    let name = format!("doc:{}", read.file);
                    sources_consulted.push(name.clone());
                    match read.outcome {
                        DocumentOutcome::Found(elements) => {
                            sources_responded.push(name.clone());
                            sources.push(Source {
                                written: record_write_order(&elements),
                                elements,
                                name,
                            });
                        }
                        DocumentOutcome::Missing => {}
                        DocumentOutcome::Failed(message) => failed_sources.push(SourceFailure {
                            source: name,
                            message,
                        }),
                    }
                }
            }
            Err(_) => {
                for target in self.docs.targets() {
                    let name = format!("doc:{}", target.file_name);
                    sources_consulted.push(name.clone());
                    failed_sources.push(SourceFailure {
                        source: name,
                        message: format!("no answer within {}ms", self.config.deadline_ms),
                    });
                }
            }
        }

        let context = self.merge(session_id, &sources, sources_consulted, sources_responded, failed_sources);

        info!(
            session_id = %session_id,
            confidence = context.confidence,
            recovered = context.elements.len(),
            missing = context.missing_elements.len(),
            conflicts = context.conflicts.len(),
            "Context reconstructed"
        );

        Ok(context)
    }

    fn merge(
        &self,
        session_id: &str,
        sources: &[Source],
        sources_consulted: Vec<String>,
        sources_responded: Vec<String>,
        failed_sources: Vec<SourceFailure>,
    ) -> ReconstructedContext {
        let mut elements = Vec::new();
        let mut missing_elements = Vec::new();
        let mut conflicts = Vec::new();
        let mut weight_sum = 0.0;

        for element in ElementType::ALL {
            let mut candidates: Vec<Candidate<'_>> = Vec::new();

            for (index, source) in sources.iter().enumerate() {
                let Some(value) = source.elements.get(&element).map(String::as_str) else {
                    continue;
                };
                match candidates.iter_mut().find(|c| c.value == value) {
                    Some(candidate) => {
                        candidate.supporters.push(index);
                        candidate.newest = candidate.newest.max(source.written);
                    }
                    None => candidates.push(Candidate {
                        value,
                        supporters: vec![index],
                        newest: source.written,
                    }),
                }
            }

            // Newest write, then most supporters, then earliest source.
            let Some(winner) = candidates
                .iter()
                .max_by_key(|c| (c.newest, c.supporters.len(), Reverse(c.supporters[0])))
            else {
                missing_elements.push(element);
                continue;
            };

            let agreeing = candidates
                .iter()
                .map(|c| c.supporters.len())
                .max()
                .unwrap_or(0);
            let weight = if agreeing > 1 {
                self.config.corroborated_weight
            } else {
                self.config.single_source_weight
            };
            weight_sum += weight;

            let supporting_sources: Vec<String> = winner
                .supporters
                .iter()
                .map(|&i| sources[i].name.clone())
                .collect();

            if candidates.len() > 1 {
                let dissenting_sources = candidates
                    .iter()
                    .filter(|c| c.value != winner.value)
                    .flat_map(|c| c.supporters.iter().map(|&i| sources[i].name.clone()))
                    .collect();
                debug!(
                    session_id = %session_id,
                    element = %element,
                    winner = %supporting_sources[0],
                    "Resolved conflicting element"
                );
                conflicts.push(ConflictResolution {
                    element,
                    winner: supporting_sources[0].clone(),
                    winning_value: winner.value.to_string(),
                    dissenting_sources,
                });
            }

            elements.push(ContextElement {
                element_type: element,
                value: winner.value.to_string(),
                source_location: supporting_sources[0].clone(),
                confidence: weight,
                supporting_sources,
            });
        }

        let confidence = (weight_sum / ElementType::ALL.len() as f64).clamp(0.0, 1.0);
        let recommendations =
            recommendations_for(confidence, &missing_elements, &conflicts, &failed_sources);

        ReconstructedContext {
            session_id: session_id.to_string(),
            confidence,
            elements,
            missing_elements,
            conflicts,
            sources_consulted,
            sources_responded,
            failed_sources,
            recommendations,
            reconstructed_at: Utc::now(),
        }
    }

    /// Judge whether a reconstruction is safe to resume from.
    ///
    /// Missing essential elements and low confidence are errors; conflicts
    /// and other gaps are warnings.
    pub fn validate_reconstruction(&self, context: &ReconstructedContext) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for element in ESSENTIAL_ELEMENTS {
            if context.missing_elements.contains(&element) {
                errors.push(format!("Essential element {} was not recovered", element));
            }
        }
        if context.confidence < MIN_ACCEPTABLE_CONFIDENCE {
            errors.push(format!(
                "Recovery confidence {:.2} is below {:.2}",
                context.confidence, MIN_ACCEPTABLE_CONFIDENCE
            ));
        }
        if let Some(id) = context.value(ElementType::SessionId) {
            if id != context.session_id {
                errors.push(format!("Recovered session id {} does not match", id));
            }
        }

        for element in &context.missing_elements {
            if !ESSENTIAL_ELEMENTS.contains(element) {
                warnings.push(format!("Element {} was not recovered", element));
            }
        }
        for conflict in &context.conflicts {
            warnings.push(format!(
                "Element {} conflicted; kept value from {} over {}",
                conflict.element,
                conflict.winner,
                conflict.dissenting_sources.join(", ")
            ));
        }

        ValidationResult::from_findings(errors, warnings)
    }

    /// Reconstruct, validate and summarize a session in one call.
    pub async fn generate_recovery_report(&self, session_id: &str) -> RecoveryResult<RecoveryReport> {
        let context = self.reconstruct_context(session_id).await?;
        let validation = self.validate_reconstruction(&context);
        let capability = self.redundancy.analyze_recovery_capability(session_id).await;

        let summary = format!(
            "Recovered {}/{} elements for {} with confidence {:.0}% from {}/{} sources; {} conflicts{}",
            context.elements.len(),
            ElementType::ALL.len(),
            session_id,
            context.confidence * 100.0,
            context.sources_responded.len(),
            context.sources_consulted.len(),
            context.conflicts.len(),
            if validation.valid { "" } else { "; review required" }
        );

        if !validation.valid {
            warn!(session_id = %session_id, errors = validation.errors.len(), "Recovery needs review");
        }

        Ok(RecoveryReport {
            session_id: session_id.to_string(),
            context,
            validation,
            capability,
            summary,
            generated_at: Utc::now(),
        })
    }
}

/// Write time of a document record, taken from its timestamp element.
fn recommendations_for(
    confidence: f64,
    missing: &[ElementType],
    conflicts: &[ConflictResolution],
    failed: &[SourceFailure],
) -> Vec<String> {
    let mut out = Vec::new();

    if missing.len() == ElementType::ALL.len() {
        out.push("No source holds this session; start a fresh session".to_string());
        return out;
    }
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|e| e.as_str()).collect();
        out.push(format!("Re-capture missing elements: {}", names.join(", ")));
    }
    if confidence < MIN_ACCEPTABLE_CONFIDENCE {
        out.push("Confidence is low; verify the recovered state before resuming".to_string());
    }
    if !conflicts.is_empty() {
        out.push(format!(
            "Review {} conflicting elements and checkpoint again",
            conflicts.len()
        ));
    }
    if !failed.is_empty() {
        let names: Vec<&str> = failed.iter().map(|f| f.source.as_str()).collect();
        out.push(format!("Check unavailable sources: {}", names.join(", ")));
    }
    if out.is_empty() {
        out.push("Context fully recovered; resume from the last completed phase".to_string());
    }
    out
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod recovery_tests;
