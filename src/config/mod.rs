use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;
use crate::storage::DEFAULT_COMPACT_THRESHOLD_BYTES;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub docs: DocsConfig,
    pub recovery: RecoveryConfig,
    pub workers: WorkerConfig,
    pub environment: EnvironmentConfig,
    pub logging: LoggingConfig,
}

/// File-based backend configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for snapshot and journal backends.
    pub data_dir: PathBuf,
    /// Deadline for a single backend write.
    pub write_timeout_ms: u64,
    /// Journal size that triggers compaction.
    pub journal_compact_bytes: u64,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Projected documentation configuration
#[derive(Debug, Clone)]
pub struct DocsConfig {
    pub dir: PathBuf,
}

/// Context recovery tuning.
///
/// The weights parameterize the per-element voting rule: an element seen in a
/// single source contributes `single_source_weight`, an element corroborated
/// by two or more agreeing sources contributes `corroborated_weight`.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub deadline_ms: u64,
    pub single_source_weight: f64,
    pub corroborated_weight: f64,
}

/// Checkpoint worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
}

/// Environment check configuration
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Command printing the toolchain version, e.g. `rustc --version`.
    pub toolchain_command: Vec<String>,
    /// Optional build command whose diagnostics yield the compilation status.
    pub build_command: Option<Vec<String>>,
    pub detect_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            env::var("CONTINUITY_DATA_DIR").unwrap_or_else(|_| "./.continuity".to_string()),
        );

        let storage = StorageConfig {
            write_timeout_ms: parse_var("STORAGE_WRITE_TIMEOUT_MS", 5000),
            journal_compact_bytes: parse_var(
                "JOURNAL_COMPACT_BYTES",
                DEFAULT_COMPACT_THRESHOLD_BYTES,
            ),
            data_dir: data_dir.clone(),
        };

        let database = DatabaseConfig {
            path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("continuity.db")),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5),
        };

        let docs = DocsConfig {
            dir: PathBuf::from(env::var("CONTINUITY_DOCS_DIR").unwrap_or_else(|_| ".".to_string())),
        };

        let recovery = RecoveryConfig {
            deadline_ms: parse_var("RECOVERY_DEADLINE_MS", 3000),
            single_source_weight: parse_var("RECOVERY_SINGLE_SOURCE_WEIGHT", 0.85),
            corroborated_weight: parse_var("RECOVERY_CORROBORATED_WEIGHT", 1.0),
        };
        recovery.validate()?;

        let workers = WorkerConfig {
            worker_count: parse_var("WORKER_COUNT", 4),
            queue_capacity: parse_var("QUEUE_CAPACITY", 64),
        };
        if workers.worker_count == 0 || workers.queue_capacity == 0 {
            return Err(AppError::Config {
                message: "WORKER_COUNT and QUEUE_CAPACITY must be greater than zero".to_string(),
            });
        }

        let environment = EnvironmentConfig {
            toolchain_command: env::var("TOOLCHAIN_COMMAND")
                .map(|s| split_command(&s))
                .unwrap_or_else(|_| EnvironmentConfig::default().toolchain_command),
            build_command: env::var("BUILD_COMMAND")
                .ok()
                .map(|s| split_command(&s))
                .filter(|c| !c.is_empty()),
            detect_timeout_ms: parse_var("DETECT_TIMEOUT_MS", 10_000),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        Ok(Config {
            storage,
            database,
            docs,
            recovery,
            workers,
            environment,
            logging,
        })
    }
}

impl RecoveryConfig {
    /// Polling deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Reject weights outside `[0, 1]` or an inverted weight order.
    pub fn validate(&self) -> Result<(), AppError> {
        for (name, weight) in [
            ("RECOVERY_SINGLE_SOURCE_WEIGHT", self.single_source_weight),
            ("RECOVERY_CORROBORATED_WEIGHT", self.corroborated_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(AppError::Config {
                    message: format!("{} must be within [0, 1], got {}", name, weight),
                });
            }
        }
        if self.single_source_weight > self.corroborated_weight {
            return Err(AppError::Config {
                message: "single-source weight cannot exceed corroborated weight".to_string(),
            });
        }
        Ok(())
    }
}

impl StorageConfig {
    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl EnvironmentConfig {
    /// Check deadline as a [`Duration`].
    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./.continuity"),
            write_timeout_ms: 5000,
            journal_compact_bytes: DEFAULT_COMPACT_THRESHOLD_BYTES,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./.continuity/continuity.db"),
            max_connections: 5,
        }
    }
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 3000,
            single_source_weight: 0.85,
            corroborated_weight: 1.0,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 64,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            toolchain_command: vec!["rustc".to_string(), "--version".to_string()],
            build_command: None,
            detect_timeout_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            database: DatabaseConfig::default(),
            docs: DocsConfig::default(),
            recovery: RecoveryConfig::default(),
            workers: WorkerConfig::default(),
            environment: EnvironmentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
