//! Command-line interface for checkpointing and recovery.
//!
//! Each command runs against a [`ContinuityService`] and renders a
//! [`CliResult`]; the binary prints the message and exits with the code.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::gates::GateResult;
use crate::service::ContinuityService;
use crate::state::SessionState;

const RULE: &str = "═══════════════════════════════════════════════════════════════════════════════";

/// Session continuity command line.
#[derive(Parser, Debug)]
#[command(name = "continuity", version, about = "Checkpoint and recover work sessions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Validate, store, project and gate a session state
    Checkpoint {
        /// JSON file holding the session state
        #[arg(long)]
        file: PathBuf,

        /// Fill toolchain, build and database fields from a fresh check
        #[arg(long)]
        capture_env: bool,
    },

    /// Reconstruct a session from every surviving copy
    Recover {
        session_id: String,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare the stored copies across backends
    CrossValidate {
        /// Session to compare; defaults to the last stored session
        session_id: Option<String>,
    },

    /// Check that the projected documents agree
    Docs {
        /// Rewrite every document from the newest record
        #[arg(long)]
        resolve: bool,
    },

    /// Run the quality gates against a session state
    Gates {
        /// JSON file holding the session state
        #[arg(long)]
        file: PathBuf,
    },

    /// Record an emergency bypass for a gate
    Bypass {
        /// Gate name, e.g. COMPILATION
        gate: String,

        /// Why the bypass is needed
        #[arg(long)]
        justification: String,

        /// Remediation step; repeat for several. Defaults to a generated plan
        #[arg(long = "step")]
        steps: Vec<String>,
    },

    /// Interpret a session against the phase catalog
    Phase {
        #[command(subcommand)]
        command: PhaseCommands,
    },

    /// Check the toolchain, build and datastore
    Env,
}

/// Phase subcommands. Each recovers the session first.
#[derive(Subcommand, Debug, Clone)]
pub enum PhaseCommands {
    /// Recommend the next phase
    Next { session_id: String },

    /// Show progress against the catalog
    Track { session_id: String },

    /// Check whether a phase is complete
    Validate { phase_id: String, session_id: String },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }

    fn from_outcome(ok: bool, message: String) -> Self {
        if ok {
            Self::success(message)
        } else {
            Self::error(message)
        }
    }
}

/// Execute a CLI command.
pub async fn execute_command(command: Commands, service: &ContinuityService) -> CliResult {
    match command {
        Commands::Checkpoint { file, capture_env } => {
            execute_checkpoint(service, &file, capture_env).await
        }
        Commands::Recover { session_id, json } => execute_recover(service, &session_id, json).await,
        Commands::CrossValidate { session_id } => {
            execute_cross_validate(service, session_id).await
        }
        Commands::Docs { resolve } => execute_docs(service, resolve).await,
        Commands::Gates { file } => execute_gates(service, &file).await,
        Commands::Bypass {
            gate,
            justification,
            steps,
        } => execute_bypass(service, &gate, &justification, steps),
        Commands::Phase { command } => execute_phase(service, command).await,
        Commands::Env => execute_env(service).await,
    }
}

async fn load_state(path: &Path) -> Result<SessionState, String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("Cannot parse {}: {}", path.display(), e))
}

fn to_json<T: Serialize>(value: &T) -> CliResult {
    match serde_json::to_string_pretty(value) {
        Ok(json) => CliResult::success(json),
        Err(e) => CliResult::error(format!("Cannot serialize output: {}", e)),
    }
}

fn heading(output: &mut String, title: &str) {
    output.push_str(&format!("\n{}\n{}\n\n", title, RULE));
}

async fn execute_checkpoint(service: &ContinuityService, file: &Path, capture_env: bool) -> CliResult {
    let mut state = match load_state(file).await {
        Ok(state) => state,
        Err(e) => return CliResult::error(e),
    };
    if capture_env {
        state = service
            .environment()
            .capture_environment_state()
            .await
            .apply_to(state);
    }

    let report = service.checkpoint(&state).await;
    let mut output = String::new();
    heading(&mut output, &format!("Checkpoint {}", report.session_id));

    if !report.validation.valid {
        output.push_str("Validation: FAILED\n");
        for error in &report.validation.errors {
            output.push_str(&format!("  - {}\n", error));
        }
        return CliResult::error(output);
    }
    output.push_str(&format!("Validation: ok (score {:.0})\n", report.validation.score));

    if let Some(storage) = &report.storage {
        output.push_str(&format!(
            "Storage: {} ({}/{} backends, quorum {})\n",
            if storage.success { "stored" } else { "FAILED" },
            storage.storage_locations.len(),
            storage.storage_locations.len() + storage.errors.len(),
            storage.quorum
        ));
        for error in &storage.errors {
            output.push_str(&format!("  - {}: {}\n", error.location, error.message));
        }
    }
    if let Some(docs) = &report.documentation {
        output.push_str(&format!(
            "Documentation: {}/{} files updated\n",
            docs.files_updated.len(),
            docs.total_files
        ));
        for error in &docs.errors {
            output.push_str(&format!("  - {}: {}\n", error.file, error.message));
        }
    }
    if let Some(gates) = &report.gates {
        output.push_str(&format!(
            "Gates: {}/{} passed\n",
            gates.passed_count,
            gates.results.len()
        ));
        for result in gates.results.iter().filter(|r| !r.passed) {
            render_gate(&mut output, result);
        }
    }

    if let Some(point) = report.continuation.as_ref().filter(|_| report.persisted()) {
        output.push_str(&format!("\nResume from: {}\n", point.phase));
        if let Some(task) = &point.current_task {
            output.push_str(&format!("  Task: {}\n", task));
        }
        if let Some(action) = &point.next_action {
            output.push_str(&format!("  Next: {}\n", action));
        }
    }

    CliResult::from_outcome(report.persisted(), output)
}

async fn execute_recover(service: &ContinuityService, session_id: &str, json: bool) -> CliResult {
    let outcome = match service.recover(session_id).await {
        Ok(outcome) => outcome,
        Err(e) => return CliResult::error(e.to_string()),
    };
    if json {
        return to_json(&outcome);
    }

    let ctx = &outcome.report.context;
    let mut output = String::new();
    heading(&mut output, &format!("Recovery {}", session_id));
    output.push_str(&format!("{}\n\n", outcome.report.summary));

    for element in &ctx.elements {
        output.push_str(&format!(
            "  {:<13} {:<5.2} {} ({} sources)\n",
            element.element_type.as_str(),
            element.confidence,
            element.source_location,
            element.supporting_sources.len()
        ));
    }
    for missing in &ctx.missing_elements {
        output.push_str(&format!("  {:<13} MISSING\n", missing.as_str()));
    }

    if !outcome.report.validation.errors.is_empty() {
        output.push_str("\nProblems:\n");
        for error in &outcome.report.validation.errors {
            output.push_str(&format!("  - {}\n", error));
        }
    }
    output.push_str("\nRecommendations:\n");
    for rec in &ctx.recommendations {
        output.push_str(&format!("  - {}\n", rec));
    }
    output.push_str(&format!(
        "\nNext phase: {} {} (~{} min)\n",
        outcome.next_phase.next_phase_id,
        outcome.next_phase.next_phase_name,
        outcome.next_phase.estimated_minutes
    ));

    CliResult::from_outcome(outcome.report.validation.valid, output)
}

async fn execute_cross_validate(service: &ContinuityService, session_id: Option<String>) -> CliResult {
    let result = match session_id {
        Some(id) => service.redundancy().cross_validate_session(&id).await,
        None => service.redundancy().cross_validate_all_layers().await,
    };

    let mut output = String::new();
    heading(&mut output, "Cross-validation");
    output.push_str(&format!(
        "Session: {}\nConsistent: {}\nScore: {:.1}\nLayers responding: {}/{}\n",
        result.session_id.as_deref().unwrap_or("-"),
        result.consistent,
        result.consistency_score,
        result.layers_responding,
        result.layers_checked
    ));
    for issue in &result.issues {
        output.push_str(&format!("  - {}\n", issue));
    }

    CliResult::from_outcome(result.consistent, output)
}

async fn execute_docs(service: &ContinuityService, resolve: bool) -> CliResult {
    let mut output = String::new();

    if resolve {
        let conflicts = service.docs().resolve_conflicts().await;
        heading(&mut output, "Documentation conflicts");
        if conflicts.is_empty() {
            output.push_str("No conflicts\n");
        }
        for conflict in &conflicts {
            output.push_str(&format!(
                "{} -> {:?} from {} ({}; was different in {})\n",
                conflict.element,
                conflict.resolved_value,
                conflict.authority,
                if conflict.resolved { "resolved" } else { "unresolved" },
                conflict.dissenting_files.join(", ")
            ));
        }
    }

    let report = service.docs().validate_consistency().await;
    heading(&mut output, "Documentation consistency");
    output.push_str(&format!(
        "Consistent: {}\nDocuments with records: {}/{}\n",
        report.consistent, report.documents_with_records, report.documents_checked
    ));
    for mismatch in &report.mismatches {
        output.push_str(&format!("  - {}\n", mismatch));
    }

    CliResult::from_outcome(report.consistent, output)
}

async fn execute_gates(service: &ContinuityService, file: &Path) -> CliResult {
    let state = match load_state(file).await {
        Ok(state) => state,
        Err(e) => return CliResult::error(e),
    };
    let results = service.gates().run_all_gates(&state).await;

    let mut output = String::new();
    heading(&mut output, &format!("Quality gates for {}", results.session_id));
    for result in &results.results {
        render_gate(&mut output, result);
    }

    CliResult::from_outcome(results.all_passed, output)
}

fn render_gate(output: &mut String, result: &GateResult) {
    output.push_str(&format!(
        "  [{}] {} ({:.0})\n",
        if result.passed { "PASS" } else { "FAIL" },
        result.name,
        result.score
    ));
    for issue in &result.issues {
        output.push_str(&format!("      issue: {}\n", issue));
    }
    for rec in &result.recommendations {
        output.push_str(&format!("      fix:   {}\n", rec));
    }
}

fn execute_bypass(
    service: &ContinuityService,
    gate: &str,
    justification: &str,
    steps: Vec<String>,
) -> CliResult {
    let result = if steps.is_empty() {
        service.gates().request_emergency_bypass(gate, justification)
    } else {
        service
            .gates()
            .execute_emergency_bypass(gate, justification, steps)
    };

    let mut output = String::new();
    heading(&mut output, &format!("Bypass {}", result.id));
    output.push_str(&format!(
        "Gate: {}\nApproved: {}\nReason: {}\n",
        result.gate_name, result.approved, result.reason
    ));
    if result.approved {
        output.push_str("Remediation plan:\n");
        for (i, step) in result.remediation_plan.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, step));
        }
        output.push_str("Conditions:\n");
        for condition in &result.conditions {
            output.push_str(&format!("  - {}\n", condition));
        }
    }

    CliResult::from_outcome(result.approved, output)
}

async fn execute_phase(service: &ContinuityService, command: PhaseCommands) -> CliResult {
    let session_id = match &command {
        PhaseCommands::Next { session_id }
        | PhaseCommands::Track { session_id }
        | PhaseCommands::Validate { session_id, .. } => session_id.clone(),
    };
    let context = match service.recovery().reconstruct_context(&session_id).await {
        Ok(context) => context,
        Err(e) => return CliResult::error(e.to_string()),
    };
    if context.elements.is_empty() {
        return CliResult::error(format!("No copy of session {} was found", session_id));
    }
    let state = context.to_session_state();
    let phases = service.phases();

    match command {
        PhaseCommands::Next { .. } => to_json(&phases.recommend_next_phase(&state)),
        PhaseCommands::Track { .. } => to_json(&phases.track_progress(&state)),
        PhaseCommands::Validate { phase_id, .. } => {
            let result = phases.validate_phase_completion(&phase_id, &state);
            let valid = result.valid;
            let mut rendered = to_json(&result);
            if !valid && rendered.exit_code == 0 {
                rendered.exit_code = 1;
            }
            rendered
        }
    }
}

async fn execute_env(service: &ContinuityService) -> CliResult {
    to_json(&service.environment().capture_environment_state().await)
}
