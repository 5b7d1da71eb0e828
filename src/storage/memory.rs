use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{write_order, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::state::SessionState;

/// Process-local backend for embedding and tests.
///
/// Can be switched offline to behave like an unreachable store, or stalled
/// so that calls never complete.
pub struct MemoryBackend {
    location: String,
    states: RwLock<HashMap<String, SessionState>>,
    available: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty, available backend.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            states: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call succeed or fail as unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every subsequent call hang until the caller gives up.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Drop the stored copy of a session.
    pub async fn remove(&self, session_id: &str) -> Option<SessionState> {
        self.states.write().await.remove(session_id)
    }

    /// Number of sessions held.
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    /// Whether no session is held.
    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    async fn check_available(&self) -> StorageResult<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                location: self.location.clone(),
            })
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn location(&self) -> &str {
        &self.location
    }

    async fn write(&self, state: &SessionState) -> StorageResult<()> {
        self.check_available().await?;
        if state.session_id.trim().is_empty() {
            return Err(StorageError::Query {
                message: "session id must not be empty".to_string(),
            });
        }

        let mut states = self.states.write().await;
        let keep_existing = states
            .get(&state.session_id)
            .is_some_and(|existing| write_order(existing) > write_order(state));
        if !keep_existing {
            states.insert(state.session_id.clone(), state.clone());
        }
        Ok(())
    }

    async fn read(&self, session_id: &str) -> StorageResult<Option<SessionState>> {
        self.check_available().await?;
        Ok(self.states.read().await.get(session_id).cloned())
    }
}
