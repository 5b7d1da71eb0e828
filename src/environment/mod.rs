//! Snapshot of the toolchain, build and datastore the session runs against.
//!
//! Every check reports a structured absence instead of failing: a missing
//! compiler or an unreachable database is a finding, not an error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::EnvironmentConfig;
use crate::state::{CompilationStatus, DatabaseStatus, SessionState};

/// Result of looking for a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolDetection {
    Detected { version: String },
    NotDetected { reason: String },
}

impl ToolDetection {
    /// Version string, if the tool was found.
    pub fn version(&self) -> Option<&str> {
        match self {
            ToolDetection::Detected { version } => Some(version),
            ToolDetection::NotDetected { .. } => None,
        }
    }
}

/// Immutable snapshot of the executing environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub toolchain: ToolDetection,
    /// Build outcome; `None` when no build command is configured or it could
    /// not be run.
    pub compilation: Option<CompilationStatus>,
    /// Why the build check produced nothing, if it was configured.
    pub build_note: Option<String>,
    /// `None` when no datastore is attached.
    pub database: Option<DatabaseStatus>,
    pub captured_at: DateTime<Utc>,
}

impl EnvironmentInfo {
    /// Copy the captured environment into `state`.
    pub fn apply_to(&self, state: SessionState) -> SessionState {
        let mut state = match &self.toolchain {
            ToolDetection::Detected { version } => state.with_toolchain(version.clone()),
            ToolDetection::NotDetected { .. } => state,
        };
        if let Some(status) = &self.compilation {
            let summary = if status.success {
                format!("build ok, {} warnings", status.warning_count)
            } else {
                format!("build failed, {} errors", status.error_count)
            };
            state = state
                .with_compilation(status.clone())
                .with_build_tool_status(summary);
        }
        if let Some(database) = &self.database {
            state = state.with_database(database.clone());
        }
        state
    }
}

enum CommandOutcome {
    Finished {
        success: bool,
        stdout: String,
        stderr: String,
    },
    Unavailable(String),
}

/// Stateless environment detector.
pub struct TechnicalEnvironmentTracker {
    config: EnvironmentConfig,
    pool: Option<SqlitePool>,
}

impl TechnicalEnvironmentTracker {
    /// Create a tracker without a datastore check.
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config, pool: None }
    }

    /// Also check the given SQLite pool.
    pub fn with_database(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Check everything that is configured, concurrently.
    pub async fn capture_environment_state(&self) -> EnvironmentInfo {
        let (toolchain, build, database) = tokio::join!(
            self.detect_toolchain(),
            self.detect_build(),
            self.detect_database(),
        );
        let (compilation, build_note) = match build {
            Some(Ok(status)) => (Some(status), None),
            Some(Err(note)) => (None, Some(note)),
            None => (None, None),
        };

        info!(
            toolchain = toolchain.version().unwrap_or("not detected"),
            build_checked = compilation.is_some(),
            database_checked = database.is_some(),
            "Environment captured"
        );

        EnvironmentInfo {
            toolchain,
            compilation,
            build_note,
            database,
            captured_at: Utc::now(),
        }
    }

    /// Run the toolchain version command.
    pub async fn detect_toolchain(&self) -> ToolDetection {
        match run_command(&self.config.toolchain_command, self.config.detect_timeout()).await {
            CommandOutcome::Finished {
                success: true,
                stdout,
                stderr,
            } => {
                let version = first_line(&stdout).or_else(|| first_line(&stderr));
                match version {
                    Some(version) => ToolDetection::Detected { version },
                    None => ToolDetection::NotDetected {
                        reason: "version command printed nothing".to_string(),
                    },
                }
            }
            CommandOutcome::Finished { stderr, .. } => ToolDetection::NotDetected {
                reason: first_line(&stderr)
                    .unwrap_or_else(|| "version command failed".to_string()),
            },
            CommandOutcome::Unavailable(reason) => ToolDetection::NotDetected { reason },
        }
    }

    /// Run the build command and count its diagnostics.
    ///
    /// `None` when no build command is configured.
    pub async fn detect_build(&self) -> Option<Result<CompilationStatus, String>> {
        let command = self.config.build_command.as_ref()?;
        let status = match run_command(command, self.config.detect_timeout()).await {
            CommandOutcome::Finished {
                success,
                stdout,
                stderr,
            } => {
                let (errors, warnings) = count_diagnostics(&format!("{}\n{}", stdout, stderr));
                debug!(success, errors, warnings, "Build check finished");
                if success && errors == 0 {
                    Ok(CompilationStatus::succeeded(warnings))
                } else {
                    Ok(CompilationStatus::failed(errors, warnings))
                }
            }
            CommandOutcome::Unavailable(reason) => Err(reason),
        };
        Some(status)
    }

    /// Check connectivity and schema of the attached datastore.
    pub async fn detect_database(&self) -> Option<DatabaseStatus> {
        let pool = self.pool.as_ref()?;
        let connection = "sqlite".to_string();

        if let Err(e) = sqlx::query("SELECT 1").execute(pool).await {
            warn!(error = %e, "Database check failed");
            return Some(DatabaseStatus::disconnected(connection));
        }

        let tables: Result<i64, sqlx::Error> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'session_states'",
        )
        .fetch_one(pool)
        .await;

        Some(DatabaseStatus {
            connected: true,
            schema_valid: matches!(tables, Ok(n) if n > 0),
            connection,
        })
    }
}

async fn run_command(command: &[String], timeout: Duration) -> CommandOutcome {
    let Some((program, args)) = command.split_first() else {
        return CommandOutcome::Unavailable("no command configured".to_string());
    };

    debug!(program = %program, args = ?args, "Running check");

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => CommandOutcome::Finished {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Ok(Err(e)) => CommandOutcome::Unavailable(format!("{}: {}", program, e)),
        Err(_) => {
            warn!(program = %program, timeout_ms = timeout.as_millis() as u64, "Check timed out");
            CommandOutcome::Unavailable(format!(
                "{} timed out after {}ms",
                program,
                timeout.as_millis()
            ))
        }
    }
}

fn first_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Count compiler error and warning lines, skipping summary lines.
fn count_diagnostics(output: &str) -> (u32, u32) {
    let mut errors = 0;
    let mut warnings = 0;
    for line in output.lines().map(str::trim_start) {
        if line.starts_with("error[") || line.starts_with("error:") {
            if line.starts_with("error: could not compile") || line.starts_with("error: aborting") {
                continue;
            }
            errors += 1;
        } else if line.starts_with("warning[") || line.starts_with("warning:") {
            if line.contains("generated") && line.contains("warning") && line.contains('(') {
                continue;
            }
            warnings += 1;
        }
    }
    (errors, warnings)
}
