//! Projection of session state onto a fixed set of markdown documents.
//!
//! Each document receives a managed block (between `continuity:begin` and
//! `continuity:end` markers) with a readable summary and a continuity record
//! of its share of canonical elements. Content outside the block is kept.
//! The records give recovery an independent path to the state even when
//! every storage backend is lost.

mod record;

pub use record::{parse_record, render_record, RECORD_VERSION};

pub(crate) use record::record_write_order;

use record::{find_managed_block, BLOCK_BEGIN, BLOCK_END};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::state::{project, rebuild, ElementType, SessionState};
use crate::storage::{write_atomic, SessionLocks};

use crate::state::ElementType::*;

/// A projected document and the elements it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentTarget {
    pub file_name: &'static str,
    pub title: &'static str,
    pub elements: &'static [ElementType],
}

impl DocumentTarget {
    /// Whether this document carries `element`.
    pub fn carries(&self, element: ElementType) -> bool {
        self.elements.contains(&element)
    }
}

/// Version of the document target set.
pub const DOCUMENT_SET_VERSION: u32 = 1;

/// The fixed document set. Every element is carried by at least two documents.
pub static DOCUMENT_TARGETS: [DocumentTarget; 11] = [
    DocumentTarget {
        file_name: "CURRENT_STATUS.md",
        title: "Current Status",
        elements: &ElementType::ALL,
    },
    DocumentTarget {
        file_name: "session-continuity-brief.md",
        title: "Session Continuity Brief",
        elements: &ElementType::ALL,
    },
    DocumentTarget {
        file_name: "temporary.md",
        title: "Working Notes",
        elements: &[SessionId, Timestamp, Phase, Progress, FileChanges, NextActions],
    },
    DocumentTarget {
        file_name: "IMPLEMENTATION_FRAMEWORK.md",
        title: "Implementation Progress",
        elements: &[SessionId, Timestamp, Phase, Progress, Tasks],
    },
    DocumentTarget {
        file_name: "PROJECT_AUTOMATION_MANAGER.md",
        title: "Automation Status",
        elements: &[SessionId, Timestamp, Environment, KnownIssues],
    },
    DocumentTarget {
        file_name: "PROJECT_SCOPE_AND_TRACKING.md",
        title: "Scope Tracking",
        elements: &[SessionId, Timestamp, Duration, Phase, Progress, Tasks],
    },
    DocumentTarget {
        file_name: "SENIOR_DEVELOPER_READINESS_ANALYSIS.md",
        title: "Readiness",
        elements: &[SessionId, Timestamp, Progress, Environment, KnownIssues],
    },
    DocumentTarget {
        file_name: "AUTOMATION_REVIEW_CHECKLIST.md",
        title: "Review Checklist",
        elements: &[SessionId, Timestamp, Environment, NextActions],
    },
    DocumentTarget {
        file_name: "PROJECT_CONVERSATION_LOG.md",
        title: "Session Log",
        elements: &[SessionId, Timestamp, Duration, Phase, FileChanges],
    },
    DocumentTarget {
        file_name: "DEVELOPMENT_GUIDE.md",
        title: "Development Environment",
        elements: &[SessionId, Timestamp, Phase, Environment],
    },
    DocumentTarget {
        file_name: "README.md",
        title: "Project Status",
        elements: &[SessionId, Timestamp, Phase, Progress],
    },
];

/// A document that could not be updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub file: String,
    pub message: String,
}

/// Outcome of projecting one state onto the document set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSummary {
    /// True iff every document was updated.
    pub success: bool,
    pub session_id: String,
    /// Documents written, in target order.
    pub files_updated: Vec<String>,
    pub total_files: usize,
    pub errors: Vec<FileError>,
    /// Write time of the projected snapshot.
    pub snapshot_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UpdateSummary {
    /// Fraction of documents updated, 0-1.
    pub fn success_rate(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        self.files_updated.len() as f64 / self.total_files as f64
    }
}

/// Read-only comparison of the documents against one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionCheck {
    pub session_id: String,
    /// Documents whose record carries the snapshot's write time.
    pub current_files: Vec<String>,
    pub total_files: usize,
    /// Documents that are missing, unreadable or hold another snapshot.
    pub errors: Vec<FileError>,
}

impl ProjectionCheck {
    /// Whether every document reflects the snapshot.
    pub fn is_current(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fraction of documents reflecting the snapshot, 0-1.
    pub fn current_rate(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        self.current_files.len() as f64 / self.total_files as f64
    }
}

/// One element the documents disagreed on, and how it was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentConflict {
    pub element: ElementType,
    /// Document holding the newest record.
    pub authority: String,
    pub resolved_value: String,
    /// Documents that held another value.
    pub dissenting_files: Vec<String>,
    /// Whether every document was rewritten to the resolved value.
    pub resolved: bool,
}

/// What one document yielded for a session.
#[derive(Debug, Clone)]
pub enum DocumentOutcome {
    Found(BTreeMap<ElementType, String>),
    /// No document, no record, or a record for another session.
    Missing,
    Failed(String),
}

/// A document read, tagged with its file name.
#[derive(Debug, Clone)]
pub struct DocumentRead {
    pub file: String,
    pub outcome: DocumentOutcome,
}

/// Cross-document agreement of the projected records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub documents_checked: usize,
    pub documents_with_records: usize,
    pub session_ids: BTreeSet<String>,
    pub mismatches: Vec<String>,
}

/// Writes and reads the projected document set.
pub struct DocumentationSynchronizer {
    dir: PathBuf,
    locks: Arc<SessionLocks>,
    last_summary: RwLock<Option<UpdateSummary>>,
}

impl DocumentationSynchronizer {
    /// Project into documents under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::new(SessionLocks::default()),
            last_summary: RwLock::new(None),
        }
    }

    /// Directory holding the documents.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The fixed target set.
    pub fn targets(&self) -> &'static [DocumentTarget] {
        &DOCUMENT_TARGETS
    }

    /// Most recent update summary, if any update ran.
    pub fn last_summary(&self) -> Option<UpdateSummary> {
        self.last_summary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Project `state` onto every document.
    ///
    /// Documents are written concurrently and independently; a failure on
    /// one never blocks the others.
    pub async fn update_all_files(&self, state: &SessionState) -> UpdateSummary {
        let mut files_updated = Vec::new();
        let mut errors = Vec::new();

        let missing_identity = if state.session_id.trim().is_empty() {
            Some("session state has no session id")
        } else if state.timestamp.is_none() {
            Some("session state has no timestamp")
        } else {
            None
        };

        if let Some(reason) = missing_identity {
            errors = DOCUMENT_TARGETS
                .iter()
                .map(|t| FileError {
                    file: t.file_name.to_string(),
                    message: reason.to_string(),
                })
                .collect();
        } else {
            let elements = Arc::new(project(state));
            let state = Arc::new(state.clone());
            let mut join_set = JoinSet::new();

            for (index, target) in DOCUMENT_TARGETS.iter().enumerate() {
                let path = self.dir.join(target.file_name);
                let locks = Arc::clone(&self.locks);
                let elements = Arc::clone(&elements);
                let state = Arc::clone(&state);
                join_set.spawn(async move {
                    let lock = locks.get(target.file_name);
                    let _guard = lock.lock().await;
                    let result = write_document(&path, target, &state, &elements)
                        .await
                        .map_err(|e| e.to_string());
                    (index, result)
                });
            }

            let mut outcomes: Vec<Option<Result<(), String>>> = vec![None; DOCUMENT_TARGETS.len()];
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((index, result)) => outcomes[index] = Some(result),
                    Err(e) => warn!(error = %e, "Document write task failed"),
                }
            }

            for (target, outcome) in DOCUMENT_TARGETS.iter().zip(outcomes) {
                match outcome.unwrap_or_else(|| Err("write task aborted".to_string())) {
                    Ok(()) => files_updated.push(target.file_name.to_string()),
                    Err(message) => errors.push(FileError {
                        file: target.file_name.to_string(),
                        message,
                    }),
                }
            }
        }

        let summary = UpdateSummary {
            success: errors.is_empty(),
            session_id: state.session_id.clone(),
            files_updated,
            total_files: DOCUMENT_TARGETS.len(),
            errors,
            snapshot_at: state.timestamp,
            updated_at: Utc::now(),
        };

        if summary.success {
            info!(
                session_id = %summary.session_id,
                files = summary.files_updated.len(),
                "Documentation synchronized"
            );
        } else {
            warn!(
                session_id = %summary.session_id,
                updated = summary.files_updated.len(),
                failed = summary.errors.len(),
                "Documentation partially synchronized"
            );
        }

        *self
            .last_summary
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
        summary
    }

    /// Read every document's record for `session_id` in parallel.
    ///
    /// Results are in target order. A record naming another session counts
    /// as missing.
    pub async fn read_records(&self, session_id: &str) -> Vec<DocumentRead> {
        let mut join_set = JoinSet::new();
        for (index, target) in DOCUMENT_TARGETS.iter().enumerate() {
            let path = self.dir.join(target.file_name);
            join_set.spawn(async move { (index, read_record_at(&path).await) });
        }

        let mut records: Vec<Option<Result<_, String>>> = vec![None; DOCUMENT_TARGETS.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, record)) => records[index] = Some(record),
                Err(e) => warn!(error = %e, "Document read task failed"),
            }
        }

        DOCUMENT_TARGETS
            .iter()
            .zip(records)
            .map(|(target, record)| {
                let outcome = match record.unwrap_or_else(|| Err("read task aborted".to_string())) {
                    Ok(Some(elements))
                        if elements.get(&SessionId).map(String::as_str) == Some(session_id) =>
                    {
                        DocumentOutcome::Found(elements)
                    }
                    Ok(_) => DocumentOutcome::Missing,
                    Err(message) => DocumentOutcome::Failed(message),
                };
                DocumentRead {
                    file: target.file_name.to_string(),
                    outcome,
                }
            })
            .collect()
    }

    /// Check, without writing, which documents carry `state`'s record.
    ///
    /// A document is current when its record names the session and carries
    /// the same write time as `state`.
    pub async fn check_projection(&self, state: &SessionState) -> ProjectionCheck {
        let expected = project(state).remove(&Timestamp);
        let mut current_files = Vec::new();
        let mut errors = Vec::new();

        for read in self.read_records(&state.session_id).await {
            let problem = match (&read.outcome, &expected) {
                (_, None) => Some("session state has no timestamp".to_string()),
                (DocumentOutcome::Found(elements), Some(expected)) => {
                    match elements.get(&Timestamp) {
                        Some(found) if found == expected => None,
                        Some(found) => Some(format!("record holds snapshot {}", found)),
                        None => Some("record has no timestamp".to_string()),
                    }
                }
                (DocumentOutcome::Missing, _) => Some("no record for this session".to_string()),
                (DocumentOutcome::Failed(message), _) => Some(message.clone()),
            };
            match problem {
                None => current_files.push(read.file),
                Some(message) => errors.push(FileError {
                    file: read.file,
                    message,
                }),
            }
        }

        debug!(
            session_id = %state.session_id,
            current = current_files.len(),
            stale = errors.len(),
            "Projection checked"
        );

        ProjectionCheck {
            session_id: state.session_id.clone(),
            current_files,
            total_files: DOCUMENT_TARGETS.len(),
            errors,
        }
    }

    /// Re-project every document from the newest record.
    ///
    /// The record with the latest timestamp is authoritative; the snapshot
    /// is rebuilt from every record sharing its session id and timestamp,
    /// falling back to the newest other record of the same session for
    /// elements none of them carry. Nothing is written when the documents
    /// already agree.
    pub async fn resolve_conflicts(&self) -> Vec<DocumentConflict> {
        let mut records = Vec::new();
        for target in &DOCUMENT_TARGETS {
            match self.read_record(target).await {
                Ok(Some(elements)) => records.push((target.file_name, elements)),
                Ok(None) => {}
                Err(message) => warn!(file = target.file_name, error = %message, "Skipping unreadable record"),
            }
        }

        // Newest first; target order breaks ties.
        records.sort_by_key(|(_, elements)| std::cmp::Reverse(record_write_order(elements)));
        let Some((authority, newest)) = records.first() else {
            return Vec::new();
        };
        let session_id = newest.get(&SessionId).cloned().unwrap_or_default();

        let mut merged: BTreeMap<ElementType, String> = BTreeMap::new();
        for (_, elements) in records
            .iter()
            .filter(|(_, elements)| elements.get(&SessionId) == Some(&session_id))
        {
            for (element, value) in elements {
                merged.entry(*element).or_insert_with(|| value.clone());
            }
        }

        let mut conflicts = Vec::new();
        for element in ElementType::ALL {
            let Some(resolved_value) = merged.get(&element) else {
                continue;
            };
            let dissenting_files: Vec<String> = records
                .iter()
                .filter(|(_, elements)| {
                    elements.get(&element).is_some_and(|value| value != resolved_value)
                })
                .map(|(file, _)| file.to_string())
                .collect();
            if !dissenting_files.is_empty() {
                conflicts.push(DocumentConflict {
                    element,
                    authority: authority.to_string(),
                    resolved_value: resolved_value.clone(),
                    dissenting_files,
                    resolved: false,
                });
            }
        }

        if conflicts.is_empty() {
            debug!(documents = records.len(), "No documentation conflicts");
            return conflicts;
        }

        let summary = self.update_all_files(&rebuild(&merged)).await;
        for conflict in &mut conflicts {
            conflict.resolved = summary.success;
        }

        info!(
            session_id = %session_id,
            authority = %authority,
            conflicts = conflicts.len(),
            resolved = summary.success,
            "Documentation conflicts resolved"
        );
        conflicts
    }

    async fn read_record(
        &self,
        target: &DocumentTarget,
    ) -> Result<Option<BTreeMap<ElementType, String>>, String> {
        read_record_at(&self.dir.join(target.file_name)).await
    }

    /// Check that the projected records agree with each other.
    ///
    /// Documents without a record are skipped; unreadable records and
    /// disagreements on session id, phase or progress are reported.
    pub async fn validate_consistency(&self) -> ConsistencyReport {
        let mut mismatches = Vec::new();
        let mut records = Vec::new();

        for target in &DOCUMENT_TARGETS {
            match self.read_record(target).await {
                Ok(Some(elements)) => records.push((target.file_name, elements)),
                Ok(None) => {}
                Err(message) => mismatches.push(format!("{}: {}", target.file_name, message)),
            }
        }

        let session_ids: BTreeSet<String> = records
            .iter()
            .filter_map(|(_, elements)| elements.get(&SessionId).cloned())
            .collect();

        for element in [SessionId, Phase, Progress] {
            let mut values: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for (file, elements) in &records {
                if let Some(value) = elements.get(&element) {
                    values.entry(value.as_str()).or_default().push(*file);
                }
            }
            if values.len() > 1 {
                let detail: Vec<String> = values
                    .iter()
                    .map(|(value, files)| format!("{:?} in {}", value, files.join(", ")))
                    .collect();
                mismatches.push(format!("{} differs: {}", element, detail.join("; ")));
            }
        }

        debug!(
            documents = records.len(),
            mismatches = mismatches.len(),
            "Documentation consistency checked"
        );

        ConsistencyReport {
            consistent: mismatches.is_empty(),
            documents_checked: DOCUMENT_TARGETS.len(),
            documents_with_records: records.len(),
            session_ids,
            mismatches,
        }
    }
}

async fn read_record_at(path: &Path) -> Result<Option<BTreeMap<ElementType, String>>, String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_record(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

async fn write_document(
    path: &Path,
    target: &DocumentTarget,
    state: &SessionState,
    elements: &BTreeMap<ElementType, String>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let existing = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let carried: BTreeMap<ElementType, String> = elements
        .iter()
        .filter(|(element, _)| target.carries(**element))
        .map(|(element, value)| (*element, value.clone()))
        .collect();

    let block = format!(
        "{}\n{}\n{}{}\n",
        BLOCK_BEGIN,
        render_section(target, state),
        render_record(&carried),
        BLOCK_END
    );

    let content = splice_block(&existing, &block);
    write_atomic(path, content.as_bytes()).await
}

/// Replace the managed block in `existing`, or append one. An unclosed
/// block is replaced through the end of the document.
fn splice_block(existing: &str, block: &str) -> String {
    if let Some(managed) = find_managed_block(existing) {
        let tail = &existing[managed.range.end..];
        let tail = tail.strip_prefix('\n').unwrap_or(tail);
        return format!("{}{}{}", &existing[..managed.range.start], block, tail);
    }

    if existing.trim().is_empty() {
        block.to_string()
    } else {
        let separator = if existing.ends_with('\n') { "\n" } else { "\n\n" };
        format!("{}{}{}", existing, separator, block)
    }
}

fn render_section(target: &DocumentTarget, state: &SessionState) -> String {
    let mut out = format!("## {}\n\n", target.title);

    for element in target.elements {
        match element {
            SessionId => out.push_str(&format!("- **Session:** `{}`\n", state.session_id)),
            Timestamp => {
                if let Some(ts) = state.timestamp {
                    out.push_str(&format!("- **Checkpoint:** {}\n", ts.to_rfc3339()));
                }
            }
            Duration => out.push_str(&format!(
                "- **Duration:** {}h {}m\n",
                state.duration_seconds / 3600,
                (state.duration_seconds % 3600) / 60
            )),
            Phase => {
                let phase = if state.last_completed_phase.is_empty() {
                    "none"
                } else {
                    &state.last_completed_phase
                };
                out.push_str(&format!("- **Last completed phase:** {}\n", phase));
            }
            Progress => out.push_str(&format!(
                "- **Progress:** {}%\n",
                state.progress_percentage
            )),
            Tasks => {
                out.push_str(&format!(
                    "- **Tasks:** {} completed, {} in progress\n",
                    state.completed_tasks.len(),
                    state.in_progress_tasks.len()
                ));
                for task in &state.in_progress_tasks {
                    out.push_str(&format!("  - [ ] {} {}\n", task.id, task.description));
                }
                for task in &state.completed_tasks {
                    out.push_str(&format!("  - [x] {} {}\n", task.id, task.description));
                }
            }
            Environment => {
                let compilation = match &state.compilation_status {
                    Some(c) if c.success => format!("passing ({} warnings)", c.warning_count),
                    Some(c) => format!("failing ({} errors)", c.error_count),
                    None => "unknown".to_string(),
                };
                let database = match &state.database_status {
                    Some(d) if d.connected => "connected",
                    Some(_) => "disconnected",
                    None => "unknown",
                };
                out.push_str(&format!(
                    "- **Environment:** toolchain `{}`, build tool `{}`, compilation {}, database {}\n",
                    state.toolchain_version, state.build_tool_status, compilation, database
                ));
            }
            FileChanges => {
                out.push_str(&format!(
                    "- **Files modified:** {}\n",
                    state.files_modified.len()
                ));
                for file in &state.files_modified {
                    out.push_str(&format!(
                        "  - `{}` ({}, {} lines)\n",
                        file.path, file.kind, file.lines_changed
                    ));
                }
            }
            NextActions => {
                out.push_str("- **Next actions:**\n");
                for action in &state.next_actions {
                    out.push_str(&format!(
                        "  - [{}] {} (~{} min)\n",
                        action.priority, action.description, action.estimated_minutes
                    ));
                }
            }
            KnownIssues => {
                let open: Vec<_> = state.known_issues.iter().filter(|i| i.is_open()).collect();
                out.push_str(&format!("- **Open issues:** {}\n", open.len()));
                for issue in open {
                    out.push_str(&format!(
                        "  - {} ({:?}): {}\n",
                        issue.id, issue.severity, issue.description
                    ));
                }
            }
        }
    }

    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_element_in_two_documents() {
        for element in ElementType::ALL {
            let carriers = DOCUMENT_TARGETS
                .iter()
                .filter(|t| t.carries(element))
                .count();
            assert!(carriers >= 2, "{} carried by {} documents", element, carriers);
        }
    }

    #[test]
    fn test_every_document_carries_identity() {
        for target in &DOCUMENT_TARGETS {
            assert!(target.carries(SessionId), "{}", target.file_name);
            assert!(target.carries(Timestamp), "{}", target.file_name);
        }
    }

    #[test]
    fn test_splice_appends_to_existing_content() {
        let block = format!("{}\nnew\n{}\n", BLOCK_BEGIN, BLOCK_END);
        let spliced = splice_block("# My Project\n", &block);
        assert_eq!(spliced, format!("# My Project\n\n{}", block));
    }

    #[test]
    fn test_splice_replaces_existing_block() {
        let old = format!("# Head\n\n{}\nold\n{}\n\nFooter\n", BLOCK_BEGIN, BLOCK_END);
        let block = format!("{}\nnew\n{}\n", BLOCK_BEGIN, BLOCK_END);
        let spliced = splice_block(&old, &block);
        assert_eq!(spliced, format!("# Head\n\n{}\nFooter\n", block));
        assert!(!spliced.contains("old"));
    }
}
