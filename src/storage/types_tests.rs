//! Unit tests for shared storage helpers and the in-memory backend.

use super::*;
use crate::error::StorageError;
use chrono::{Duration, Utc};

#[test]
fn test_file_stem_keeps_safe_characters() {
    assert_eq!(file_stem("session-2025_03"), "session-2025_03");
}

#[test]
fn test_file_stem_escapes_everything_else() {
    assert_eq!(file_stem("../etc"), "%2E%2E%2Fetc");
    assert_eq!(file_stem("a b"), "a%20b");
    assert_ne!(file_stem("a/b"), file_stem("a_b"));
}

#[test]
fn test_write_order_without_timestamp_sorts_first() {
    let dated = SessionState::new("s1");
    let undated = SessionState::new("s1").with_timestamp(None);
    assert!(write_order(&undated) < write_order(&dated));
}

#[tokio::test]
async fn test_session_locks_are_shared_per_session() {
    let locks = SessionLocks::default();
    let a1 = locks.get("a");
    let a2 = locks.get("a");
    let b = locks.get("b");

    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));

    let _held = a1.lock().await;
    assert!(a2.try_lock().is_err());
    assert!(b.try_lock().is_ok());
}

#[test]
fn test_session_locks_drop_idle_entries() {
    let locks = SessionLocks::default();
    for i in 0..50 {
        drop(locks.get(&format!("session-{}", i)));
    }
    assert_eq!(locks.len(), 1);

    let held = locks.get("busy");
    let _other = locks.get("other");
    assert_eq!(locks.len(), 2);
    assert!(Arc::ptr_eq(&held, &locks.get("busy")));
}

#[tokio::test]
async fn test_memory_backend_round_trip() {
    let backend = MemoryBackend::new("memory");
    assert!(backend.is_empty().await);

    let state = SessionState::new("s1").with_progress(12.5);
    backend.write(&state).await.unwrap();

    assert_eq!(backend.len().await, 1);
    assert_eq!(backend.read("s1").await.unwrap(), Some(state));
    assert_eq!(backend.read("s2").await.unwrap(), None);
}

#[tokio::test]
async fn test_memory_backend_keeps_newer_copy() {
    let backend = MemoryBackend::new("memory");
    let now = Utc::now();

    backend
        .write(&SessionState::new("s1").with_timestamp(Some(now)).with_phase("new"))
        .await
        .unwrap();
    backend
        .write(
            &SessionState::new("s1")
                .with_timestamp(Some(now - Duration::seconds(1)))
                .with_phase("old"),
        )
        .await
        .unwrap();

    let read = backend.read("s1").await.unwrap().unwrap();
    assert_eq!(read.last_completed_phase, "new");
}

#[tokio::test]
async fn test_memory_backend_offline() {
    let backend = MemoryBackend::new("memory");
    backend.set_available(false);

    let err = backend.write(&SessionState::new("s1")).await.unwrap_err();
    assert!(err.is_unreachable());
    assert!(matches!(
        backend.read("s1").await,
        Err(StorageError::Unavailable { .. })
    ));

    backend.set_available(true);
    assert!(backend.write(&SessionState::new("s1")).await.is_ok());
}

#[tokio::test]
async fn test_backends_reject_empty_session_id() {
    let backend = MemoryBackend::new("memory");
    let err = backend.write(&SessionState::new("")).await.unwrap_err();
    assert!(!err.is_unreachable());
}

#[tokio::test]
async fn test_sqlite_backend_upsert_keeps_newer_copy() {
    let backend = SqliteBackend::new_in_memory().await.unwrap();
    assert_eq!(backend.location(), SQLITE_LOCATION);

    let now = Utc::now();
    let newer = SessionState::new("s1")
        .with_timestamp(Some(now))
        .with_phase("Phase 2.1")
        .with_progress(45.5);
    let older = SessionState::new("s1")
        .with_timestamp(Some(now - Duration::seconds(10)))
        .with_phase("Phase 1.2");

    backend.write(&newer).await.unwrap();
    backend.write(&older).await.unwrap();

    let read = backend.read("s1").await.unwrap().unwrap();
    assert_eq!(read, newer);
    assert!(backend.read("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sqlite_backend_detects_corrupt_payload() {
    let backend = SqliteBackend::new_in_memory().await.unwrap();
    backend.write(&SessionState::new("s1")).await.unwrap();

    sqlx::query("UPDATE session_states SET payload = '{broken' WHERE session_id = 's1'")
        .execute(backend.pool())
        .await
        .unwrap();

    let err = backend.read("s1").await.unwrap_err();
    assert!(matches!(err, StorageError::Corrupt { .. }));
}

#[tokio::test]
async fn test_mock_backend_contract() {
    let mut mock = MockStorageBackend::new();
    mock.expect_location().return_const("mock".to_string());
    mock.expect_read().returning(|_| Ok(None));

    assert_eq!(mock.location(), "mock");
    assert!(mock.read("s1").await.unwrap().is_none());
}
