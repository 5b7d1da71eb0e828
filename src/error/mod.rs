use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Backend connection failed: {message}")]
    Connection { message: String },

    #[error("Backend unavailable: {location}")]
    Unavailable { location: String },

    #[error("Backend {location} timed out after {timeout_ms}ms")]
    Timeout { location: String, timeout_ms: u64 },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Stored copy is corrupt at {location}: {message}")]
    Corrupt { location: String, message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl StorageError {
    /// Whether this error means the backend could not be reached at all.
    ///
    /// Unreachable backends count as partial failures during a redundant
    /// write; every other error is a rejection by a reachable backend.
    pub fn is_unreachable(&self) -> bool {
        match self {
            StorageError::Connection { .. }
            | StorageError::Unavailable { .. }
            | StorageError::Timeout { .. }
            | StorageError::Io(_) => true,
            StorageError::Sqlx(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}

/// Context recovery errors.
///
/// Recovery gaps are never errors; only caller mistakes end up here.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Session id must not be empty")]
    EmptySessionId,
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;
