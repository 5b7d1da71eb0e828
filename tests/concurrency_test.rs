//! Concurrent checkpoint tests
//!
//! Drives the checkpoint pool with many sessions at once and with racing
//! snapshots of the same session.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use tokio::task::JoinSet;

use session_continuity::config::{Config, WorkerConfig};
use session_continuity::state::{
    CompilationStatus, DatabaseStatus, ElementType, NextAction, Priority, SessionState, Task,
};
use session_continuity::storage::{MemoryBackend, StorageBackend};
use session_continuity::{CheckpointPool, ContinuityService};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).single().unwrap()
}

fn snapshot(id: &str, step: i64) -> SessionState {
    SessionState::new(id)
        .with_timestamp(Some(base_time() + Duration::seconds(step)))
        .with_phase("Phase 3.1")
        .with_progress(step as f64)
        .with_completed_task(Task::completed("t1", "Storage layer", "Phase 2.1"))
        .with_next_action(NextAction::new("Keep going", Priority::Medium, 30))
        .with_compilation(CompilationStatus::succeeded(0))
        .with_database(DatabaseStatus::healthy("sqlite"))
        .with_toolchain("rustc 1.80.0")
        .with_build_tool_status("ok")
}

fn memory_service(dir: &TempDir) -> (Vec<Arc<MemoryBackend>>, Arc<ContinuityService>) {
    let mut config = Config::default();
    config.docs.dir = dir.path().join("docs");

    let backends: Vec<Arc<MemoryBackend>> = (0..3)
        .map(|i| Arc::new(MemoryBackend::new(format!("memory-{}", i))))
        .collect();
    let dyn_backends: Vec<Arc<dyn StorageBackend>> = backends
        .iter()
        .map(|b| b.clone() as Arc<dyn StorageBackend>)
        .collect();
    (
        backends,
        Arc::new(ContinuityService::new(dyn_backends, &config)),
    )
}

async fn submit_all(pool: Arc<CheckpointPool>, states: Vec<SessionState>) -> usize {
    let mut set = JoinSet::new();
    for state in states {
        let pool = Arc::clone(&pool);
        set.spawn(async move { pool.submit(state).await });
    }

    let mut persisted = 0;
    while let Some(joined) = set.join_next().await {
        let report = joined.unwrap().unwrap();
        if report.persisted() {
            persisted += 1;
        }
    }

    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.shutdown().await;
    }
    persisted
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_sessions_in_parallel() {
        let dir = TempDir::new().unwrap();
        let (backends, service) = memory_service(&dir);
        let pool = Arc::new(CheckpointPool::new(
            Arc::clone(&service),
            &WorkerConfig {
                worker_count: 4,
                queue_capacity: 8,
            },
        ));

        let states: Vec<SessionState> = (0..40)
            .map(|i| snapshot(&format!("session-{}", i), i))
            .collect();
        assert_eq!(submit_all(pool, states).await, 40);

        for backend in &backends {
            assert_eq!(backend.len().await, 40);
        }
        let ctx = service
            .recovery()
            .reconstruct_context("session-17")
            .await
            .unwrap();
        assert_eq!(ctx.value(ElementType::SessionId), Some("session-17"));
        assert_eq!(ctx.to_session_state().progress_percentage, 17.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_snapshots_of_one_session_keep_newest() {
        let dir = TempDir::new().unwrap();
        let (backends, service) = memory_service(&dir);
        let pool = Arc::new(CheckpointPool::new(
            Arc::clone(&service),
            &WorkerConfig {
                worker_count: 6,
                queue_capacity: 4,
            },
        ));

        let states: Vec<SessionState> = (0..24).map(|i| snapshot("shared", i)).collect();
        assert_eq!(submit_all(pool, states).await, 24);

        for backend in &backends {
            let stored = backend.read("shared").await.unwrap().unwrap();
            assert_eq!(stored.progress_percentage, 23.0, "{}", backend.location());
        }

        let cv = service.redundancy().cross_validate_session("shared").await;
        assert!(cv.consistent, "{:?}", cv.issues);

        // Documents may lag behind, but the newest write wins every element.
        let ctx = service.recovery().reconstruct_context("shared").await.unwrap();
        let recovered = ctx.to_session_state();
        assert_eq!(recovered.timestamp, Some(base_time() + Duration::seconds(23)));
        assert_eq!(recovered.progress_percentage, 23.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_over_default_backends() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");
        config.database.path = dir.path().join("data").join("continuity.db");
        config.docs.dir = dir.path().join("docs");

        let service = Arc::new(ContinuityService::open(&config).await.unwrap());
        let pool = Arc::new(CheckpointPool::new(Arc::clone(&service), &config.workers));

        let states: Vec<SessionState> = (0..12)
            .map(|i| snapshot(&format!("disk-{}", i % 4), i))
            .collect();
        assert_eq!(submit_all(pool, states).await, 12);

        for i in 0..4 {
            let id = format!("disk-{}", i);
            let capability = service.redundancy().analyze_recovery_capability(&id).await;
            assert!(capability.survives_single_loss, "{}", id);
            assert_eq!(capability.readable_locations.len(), 4);
        }
    }
}
