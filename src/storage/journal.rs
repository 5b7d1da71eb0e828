use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{write_atomic, write_order, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::state::SessionState;

/// Journal size past which a write compacts the file.
pub const DEFAULT_COMPACT_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;

/// Append-only JSON Lines journal shared by all sessions.
///
/// Every write appends one complete line. A reader takes the newest entry for
/// a session; a line torn by a crash mid-append is skipped. Once the file
/// grows past the compaction threshold (and to twice its last compacted
/// size) it is atomically rewritten to the newest entry per session.
pub struct JournalBackend {
    location: String,
    path: PathBuf,
    compact_threshold: u64,
    /// Serializes appends; holds the file size after the last compaction.
    append: Mutex<u64>,
}

impl JournalBackend {
    /// Create the backend, creating the parent directory if needed.
    pub async fn new(location: impl Into<String>, path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            location: location.into(),
            path,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD_BYTES,
            append: Mutex::new(0),
        })
    }

    /// Compact once the file reaches `bytes`.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the journal to the newest entry per session.
    ///
    /// Returns the number of lines dropped.
    pub async fn compact(&self) -> StorageResult<usize> {
        let mut compacted_len = self.append.lock().await;
        self.compact_locked(&mut compacted_len).await
    }

    async fn compact_locked(&self, compacted_len: &mut u64) -> StorageResult<usize> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let total = raw.lines().filter(|l| !l.trim().is_empty()).count();
        let (entries, _) = latest_per_session(&raw);

        let mut contents = Vec::new();
        for entry in &entries {
            contents.extend(serde_json::to_vec(entry)?);
            contents.push(b'\n');
        }
        write_atomic(&self.path, &contents).await?;
        *compacted_len = contents.len() as u64;

        let dropped = total - entries.len();
        info!(
            location = %self.location,
            sessions = entries.len(),
            dropped,
            "Journal compacted"
        );
        Ok(dropped)
    }
}

/// Newest entry per session, in order of first appearance, plus the count
/// of unreadable lines. Later lines win ties.
fn latest_per_session(raw: &str) -> (Vec<SessionState>, usize) {
    let mut entries: Vec<SessionState> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut skipped = 0usize;

    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let entry: SessionState = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        match index.get(&entry.session_id) {
            Some(&i) => {
                if write_order(&entry) >= write_order(&entries[i]) {
                    entries[i] = entry;
                }
            }
            None => {
                index.insert(entry.session_id.clone(), entries.len());
                entries.push(entry);
            }
        }
    }

    (entries, skipped)
}

#[async_trait]
impl StorageBackend for JournalBackend {
    fn location(&self) -> &str {
        &self.location
    }

    async fn write(&self, state: &SessionState) -> StorageResult<()> {
        if state.session_id.trim().is_empty() {
            return Err(StorageError::Query {
                message: "session id must not be empty".to_string(),
            });
        }

        let mut line = serde_json::to_vec(state)?;
        line.push(b'\n');

        let mut compacted_len = self.append.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        // Terminate a torn tail so the new entry starts on its own line.
        if file.metadata().await?.len() > 0 {
            file.seek(SeekFrom::End(-1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.insert(0, b'\n');
            }
        }

        file.write_all(&line).await?;
        file.sync_data().await?;

        let len = file.metadata().await?.len();
        if len >= self.compact_threshold.max(*compacted_len * 2) {
            drop(file);
            // The entry is already durable; a failed compaction is retried
            // on a later write.
            if let Err(e) = self.compact_locked(&mut compacted_len).await {
                warn!(location = %self.location, error = %e, "Journal compaction failed");
            }
        }
        Ok(())
    }

    async fn read(&self, session_id: &str) -> StorageResult<Option<SessionState>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (entries, skipped) = latest_per_session(&raw);
        if skipped > 0 {
            warn!(location = %self.location, skipped, "Skipped unreadable journal lines");
        }

        Ok(entries.into_iter().find(|entry| entry.session_id == session_id))
    }
}
