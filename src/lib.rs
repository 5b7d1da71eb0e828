//! # Session Continuity
//!
//! Captures the state of a long-running, interruptible work session, stores
//! it redundantly, projects it into human-readable documents, and rebuilds
//! it with a confidence score after an interruption.
//!
//! ## Features
//!
//! - **Validation**: structural and cross-field checks before anything is stored
//! - **Redundant storage**: quorum writes across SQLite, snapshot files and a journal
//! - **Cross-validation**: per-element agreement between stored copies
//! - **Documentation projection**: managed status blocks in a fixed document set
//! - **Quality gates**: compilation, documentation, progress and quality checks
//!   with an audited emergency bypass
//! - **Context recovery**: weighted merge of every surviving copy, with explicit gaps
//! - **Phase tracking**: successor lookup and progress against a phase catalog
//!
//! ## Architecture
//!
//! ```text
//! capture → validate → store (4 backends) → project (docs) → gate
//!                          ↓                     ↓
//!                    ContextRecoveryEngine ←─────┘
//!                          ↓
//!                     PhaseManager
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use session_continuity::{Config, ContinuityService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let service = ContinuityService::open(&config).await?;
//!     let outcome = service.recover("session-42").await?;
//!     println!("{}", outcome.report.summary);
//!     Ok(())
//! }
//! ```

/// Command-line interface.
pub mod cli;
/// Configuration management.
pub mod config;
/// Projected documentation and the embedded continuity record.
pub mod docs;
/// Toolchain, build and datastore checks.
pub mod environment;
/// Error types and result aliases.
pub mod error;
/// Quality gates and emergency bypass governance.
pub mod gates;
/// Phase catalog and progress interpretation.
pub mod phases;
/// Confidence-scored context reconstruction.
pub mod recovery;
/// Quorum writes and cross-validation over storage backends.
pub mod redundancy;
/// Checkpoint pipeline and worker pool.
pub mod service;
/// Session state model and validation.
pub mod state;
/// Storage backends.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use service::{CheckpointPool, ContinuityService};
pub use state::SessionState;
