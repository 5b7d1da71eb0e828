//! Storage backends holding redundant copies of session state.
//!
//! Every backend implements [`StorageBackend`]: a location identifier plus a
//! whole-state `write` and `read`. Writes are atomic per session and an older
//! snapshot never replaces a newer one, so two racing writers can only ever
//! leave one complete state behind.

mod file;
mod journal;
mod memory;
mod sqlite;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use file::JsonFileBackend;
pub use journal::{JournalBackend, DEFAULT_COMPACT_THRESHOLD_BYTES};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::{DatabaseConfig, StorageConfig};
use crate::error::StorageResult;
use crate::state::SessionState;

/// Location identifier of the SQLite backend.
pub const SQLITE_LOCATION: &str = "sqlite";
/// Location identifier of the primary snapshot directory.
pub const PRIMARY_SNAPSHOT_LOCATION: &str = "primary-snapshot";
/// Location identifier of the mirror snapshot directory.
pub const MIRROR_SNAPSHOT_LOCATION: &str = "mirror-snapshot";
/// Location identifier of the append-only journal.
pub const JOURNAL_LOCATION: &str = "journal";

/// An independent storage target holding full copies of session states.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stable identifier of this backend.
    fn location(&self) -> &str;

    /// Store a full copy of `state`.
    ///
    /// A stored copy with a newer timestamp is left in place and the call
    /// still succeeds.
    async fn write(&self, state: &SessionState) -> StorageResult<()>;

    /// Read the stored copy for `session_id`, if any.
    async fn read(&self, session_id: &str) -> StorageResult<Option<SessionState>>;
}

/// The default backend set plus a handle on the SQLite pool for checks.
pub struct DefaultBackends {
    /// The SQLite backend, also present in `all`.
    pub sqlite: SqliteBackend,
    /// All backends, in a fixed order.
    pub all: Vec<Arc<dyn StorageBackend>>,
}

/// Open the four default backends under the configured data directory.
pub async fn open_default_backends(
    storage: &StorageConfig,
    database: &DatabaseConfig,
) -> StorageResult<DefaultBackends> {
    let sqlite = SqliteBackend::new(database).await?;
    let primary =
        JsonFileBackend::new(PRIMARY_SNAPSHOT_LOCATION, storage.data_dir.join("snapshots"))
            .await?;
    let mirror = JsonFileBackend::new(MIRROR_SNAPSHOT_LOCATION, storage.data_dir.join("mirror"))
        .await?;
    let journal = JournalBackend::new(
        JOURNAL_LOCATION,
        storage.data_dir.join("journal").join("sessions.jsonl"),
    )
    .await?
    .with_compact_threshold(storage.journal_compact_bytes);

    let all: Vec<Arc<dyn StorageBackend>> = vec![
        Arc::new(sqlite.clone()),
        Arc::new(primary),
        Arc::new(mirror),
        Arc::new(journal),
    ];

    Ok(DefaultBackends { sqlite, all })
}

/// Ordering key of a snapshot. A state without a timestamp sorts first.
pub(crate) fn write_order(state: &SessionState) -> i64 {
    state
        .timestamp
        .map(|ts| ts.timestamp_micros())
        .unwrap_or(i64::MIN)
}

/// Per-session async locks, created on first use.
///
/// A lock nobody else holds a handle to is dropped on the next `get`, so the
/// map only tracks sessions currently being written.
#[derive(Debug, Default)]
pub(crate) struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub(crate) fn get(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|id, lock| id == session_id || Arc::strong_count(lock) > 1);
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Number of sessions with a tracked lock.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Encode a session id into a file name that cannot escape its directory.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`, so distinct ids always map to distinct names.
pub(crate) fn file_stem(session_id: &str) -> String {
    let mut stem = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

/// Replace `path` with `contents` via a synced temporary sibling and rename.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}
