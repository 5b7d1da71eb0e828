use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{file_stem, write_atomic, write_order, SessionLocks, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::state::SessionState;

/// One pretty-printed JSON snapshot per session in a directory.
///
/// Writes go to a temporary sibling file which is synced and then renamed
/// over the target, so readers see either the old or the new snapshot.
pub struct JsonFileBackend {
    location: String,
    dir: PathBuf,
    locks: SessionLocks,
}

impl JsonFileBackend {
    /// Create the backend, creating `dir` if needed.
    pub async fn new(location: impl Into<String>, dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            location: location.into(),
            dir,
            locks: SessionLocks::default(),
        })
    }

    /// Directory holding the snapshots.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for `session_id`.
    pub fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }

    async fn load(&self, path: &Path) -> StorageResult<Option<SessionState>> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                location: self.location.clone(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl StorageBackend for JsonFileBackend {
    fn location(&self) -> &str {
        &self.location
    }

    async fn write(&self, state: &SessionState) -> StorageResult<()> {
        if state.session_id.trim().is_empty() {
            return Err(StorageError::Query {
                message: "session id must not be empty".to_string(),
            });
        }

        let lock = self.locks.get(&state.session_id);
        let _guard = lock.lock().await;

        let path = self.snapshot_path(&state.session_id);
        // A corrupt existing copy is simply replaced.
        if let Ok(Some(existing)) = self.load(&path).await {
            if write_order(&existing) > write_order(state) {
                debug!(
                    session_id = %state.session_id,
                    location = %self.location,
                    "Stored copy is newer; write skipped"
                );
                return Ok(());
            }
        }

        let payload = serde_json::to_vec_pretty(state)?;
        write_atomic(&path, &payload).await?;
        Ok(())
    }

    async fn read(&self, session_id: &str) -> StorageResult<Option<SessionState>> {
        self.load(&self.snapshot_path(session_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new("primary", dir.path()).await.unwrap();

        let state = SessionState::new("s1").with_phase("Phase 1.2");
        backend.write(&state).await.unwrap();

        let read = backend.read("s1").await.unwrap().unwrap();
        assert_eq!(read, state);
        assert!(backend.read("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_write_is_ignored() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new("primary", dir.path()).await.unwrap();

        let now = Utc::now();
        let newer = SessionState::new("s1")
            .with_timestamp(Some(now))
            .with_phase("Phase 2.2");
        let older = SessionState::new("s1")
            .with_timestamp(Some(now - Duration::seconds(30)))
            .with_phase("Phase 2.1");

        backend.write(&newer).await.unwrap();
        backend.write(&older).await.unwrap();

        let read = backend.read("s1").await.unwrap().unwrap();
        assert_eq!(read.last_completed_phase, "Phase 2.2");
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported_then_replaced() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new("primary", dir.path()).await.unwrap();

        std::fs::write(backend.snapshot_path("s1"), "{\"session_id\": \"s1\", ").unwrap();
        let err = backend.read("s1").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));

        backend.write(&SessionState::new("s1")).await.unwrap();
        assert!(backend.read("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new("primary", dir.path()).await.unwrap();

        backend.write(&SessionState::new("a/b")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a%2Fb.json".to_string()]);
    }
}
