use super::*;
use crate::state::{CompilationStatus, DatabaseStatus, NextAction, Priority, Task};
use crate::storage::{MemoryBackend, StorageBackend};
use chrono::TimeZone;
use std::time::Duration;
use tempfile::TempDir;

fn state_at(id: &str, hour: u32, phase: &str) -> SessionState {
    SessionState::new(id)
        .with_timestamp(Utc.with_ymd_and_hms(2025, 3, 14, hour, 0, 0).single())
        .with_phase(phase)
        .with_progress(45.5)
        .with_completed_task(Task::completed("t1", "Storage layer", "Phase 2.1"))
        .with_in_progress_task(Task::in_progress("t2", "Recovery", "Phase 2.2"))
        .with_next_action(NextAction::new("Wire recovery", Priority::High, 90).depends_on("t2"))
        .with_compilation(CompilationStatus::succeeded(0))
        .with_database(DatabaseStatus::healthy("sqlite"))
        .with_toolchain("rustc 1.80.0")
}

fn config() -> RecoveryConfig {
    RecoveryConfig {
        deadline_ms: 2000,
        single_source_weight: 0.85,
        corroborated_weight: 1.0,
    }
}

struct Fixture {
    _dir: TempDir,
    backends: Vec<Arc<MemoryBackend>>,
    docs: Arc<DocumentationSynchronizer>,
    redundancy: Arc<RedundancyManager>,
    engine: ContextRecoveryEngine,
}

fn fixture(backend_count: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    let backends: Vec<Arc<MemoryBackend>> = (0..backend_count)
        .map(|i| Arc::new(MemoryBackend::new(format!("memory-{}", i))))
        .collect();
    let dyn_backends: Vec<Arc<dyn StorageBackend>> = backends
        .iter()
        .map(|b| b.clone() as Arc<dyn StorageBackend>)
        .collect();
    let redundancy = Arc::new(RedundancyManager::new(dyn_backends, Duration::from_secs(1)));
    let docs = Arc::new(DocumentationSynchronizer::new(dir.path()));
    let engine = ContextRecoveryEngine::new(redundancy.clone(), docs.clone(), config());
    Fixture {
        _dir: dir,
        backends,
        docs,
        redundancy,
        engine,
    }
}

#[tokio::test]
async fn test_empty_session_id_is_rejected() {
    let fx = fixture(1);
    assert!(matches!(
        fx.engine.reconstruct_context("  ").await,
        Err(RecoveryError::EmptySessionId)
    ));
}

#[tokio::test]
async fn test_full_recovery_from_every_source() {
    let fx = fixture(4);
    let state = state_at("s1", 9, "Phase 2.1");
    assert!(fx.redundancy.store_with_redundancy(&state).await.success);
    assert!(fx.docs.update_all_files(&state).await.success);

    let ctx = fx.engine.reconstruct_context("s1").await.unwrap();
    assert!(ctx.confidence > 0.95, "confidence {}", ctx.confidence);
    assert!(ctx.missing_elements.is_empty());
    assert!(ctx.conflicts.is_empty());
    assert!(ctx.failed_sources.is_empty());
    assert_eq!(ctx.sources_consulted.len(), 4 + fx.docs.targets().len());
    assert_eq!(ctx.sources_responded.len(), ctx.sources_consulted.len());
    assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.1"));
    assert_eq!(ctx.value(ElementType::Progress), Some("45.5"));

    let rebuilt = ctx.to_session_state();
    assert_eq!(rebuilt.session_id, "s1");
    assert_eq!(rebuilt.progress_percentage, 45.5);
    assert_eq!(rebuilt.timestamp, state.timestamp);

    let validation = fx.engine.validate_reconstruction(&ctx);
    assert!(validation.valid, "errors: {:?}", validation.errors);
    assert!(validation.warnings.is_empty());
}

#[tokio::test]
async fn test_nothing_stored_yields_empty_context() {
    let fx = fixture(2);

    let ctx = fx.engine.reconstruct_context("ghost").await.unwrap();
    assert_eq!(ctx.confidence, 0.0);
    assert_eq!(ctx.missing_elements.len(), ElementType::ALL.len());
    assert!(ctx.elements.is_empty());
    assert!(ctx.recommendations[0].contains("fresh session"));

    let validation = fx.engine.validate_reconstruction(&ctx);
    assert!(!validation.valid);
    assert_eq!(validation.errors.len(), ESSENTIAL_ELEMENTS.len() + 1);
}

#[tokio::test]
async fn test_single_source_scores_lower_than_corroborated() {
    let fx = fixture(2);
    let state = state_at("s1", 9, "Phase 2.1");
    fx.backends[0].write(&state).await.unwrap();

    let single = fx.engine.reconstruct_context("s1").await.unwrap();
    assert!((single.confidence - 0.85).abs() < 1e-9);
    assert!(single.missing_elements.is_empty());
    assert!(single.elements.iter().all(|e| e.supporting_sources == vec!["memory-0".to_string()]));

    fx.backends[1].write(&state).await.unwrap();
    let corroborated = fx.engine.reconstruct_context("s1").await.unwrap();
    assert!((corroborated.confidence - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_losing_a_source_never_raises_confidence() {
    let fx = fixture(3);
    let state = state_at("s1", 9, "Phase 2.1");
    fx.redundancy.store_with_redundancy(&state).await;
    fx.docs.update_all_files(&state).await;

    let mut previous = fx.engine.reconstruct_context("s1").await.unwrap().confidence;
    for backend in &fx.backends {
        backend.remove("s1").await;
        let now = fx.engine.reconstruct_context("s1").await.unwrap().confidence;
        assert!(now <= previous + 1e-9, "{} > {}", now, previous);
        previous = now;
    }
    for target in fx.docs.targets() {
        std::fs::remove_file(fx.docs.dir().join(target.file_name)).unwrap();
        let now = fx.engine.reconstruct_context("s1").await.unwrap().confidence;
        assert!(now <= previous + 1e-9, "{} > {}", now, previous);
        previous = now;
    }
    assert_eq!(previous, 0.0);
}

#[tokio::test]
async fn test_newest_write_wins_conflicts() {
    let fx = fixture(2);
    fx.backends[0].write(&state_at("s1", 9, "Phase 2.1")).await.unwrap();
    fx.backends[1].write(&state_at("s1", 11, "Phase 2.2")).await.unwrap();

    let ctx = fx.engine.reconstruct_context("s1").await.unwrap();
    assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.2"));
    let phase = ctx.element(ElementType::Phase).unwrap();
    assert_eq!(phase.source_location, "memory-1");

    let conflicted: Vec<ElementType> = ctx.conflicts.iter().map(|c| c.element).collect();
    assert_eq!(conflicted, vec![ElementType::Timestamp, ElementType::Phase]);
    assert!(ctx
        .conflicts
        .iter()
        .all(|c| c.winner == "memory-1" && c.dissenting_sources == vec!["memory-0".to_string()]));

    let validation = fx.engine.validate_reconstruction(&ctx);
    assert!(validation.valid);
    assert_eq!(validation.warnings.len(), 2);
}

#[tokio::test]
async fn test_disagreeing_sources_do_not_corroborate() {
    let fx = fixture(2);
    fx.backends[0].write(&state_at("s1", 9, "Phase 2.1")).await.unwrap();
    fx.backends[1].write(&state_at("s1", 9, "Phase 3.2")).await.unwrap();

    let ctx = fx.engine.reconstruct_context("s1").await.unwrap();
    let phase = ctx.element(ElementType::Phase).unwrap();
    assert_eq!(phase.supporting_sources, vec!["memory-0"]);
    assert!((phase.confidence - 0.85).abs() < 1e-9);
    assert_eq!(ctx.conflicts.len(), 1);

    let progress = ctx.element(ElementType::Progress).unwrap();
    assert!((progress.confidence - 1.0).abs() < 1e-9);
    assert!((ctx.confidence - 0.985).abs() < 1e-9, "confidence {}", ctx.confidence);
}

#[tokio::test]
async fn test_majority_breaks_tie_on_equal_write_time() {
    let fx = fixture(3);
    let base = state_at("s1", 9, "Phase 2.1");
    fx.backends[0].write(&base.clone().with_toolchain("rustc 1.79.0")).await.unwrap();
    fx.backends[1].write(&base).await.unwrap();
    fx.backends[2].write(&base).await.unwrap();

    let ctx = fx.engine.reconstruct_context("s1").await.unwrap();
    let env = ctx.element(ElementType::Environment).unwrap();
    assert_eq!(env.supporting_sources, vec!["memory-1", "memory-2"]);
    assert_eq!(ctx.conflicts.len(), 1);
}

#[tokio::test]
async fn test_unreachable_backend_is_reported() {
    let fx = fixture(2);
    let state = state_at("s1", 9, "Phase 2.1");
    fx.backends[0].write(&state).await.unwrap();
    fx.backends[1].set_available(false);

    let ctx = fx.engine.reconstruct_context("s1").await.unwrap();
    assert_eq!(ctx.failed_sources.len(), 1);
    assert_eq!(ctx.failed_sources[0].source, "memory-1");
    assert!(ctx.recommendations.iter().any(|r| r.contains("memory-1")));
    assert!(ctx.missing_elements.is_empty());
}

#[tokio::test]
async fn test_stalled_backend_is_a_failed_source_not_an_error() {
    let fx = fixture(2);
    let state = state_at("s1", 9, "Phase 2.1");
    fx.redundancy.store_with_redundancy(&state).await;
    fx.backends[1].set_stalled(true);
    let engine = ContextRecoveryEngine::new(
        fx.redundancy.clone(),
        fx.docs.clone(),
        RecoveryConfig {
            deadline_ms: 150,
            ..config()
        },
    );

    let started = std::time::Instant::now();
    let ctx = engine.reconstruct_context("s1").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(ctx.failed_sources.len(), 1);
    assert_eq!(ctx.failed_sources[0].source, "memory-1");
    assert!(ctx.failed_sources[0].message.contains("timed out"));
    assert!(ctx.missing_elements.is_empty());
    assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.1"));
    assert!((ctx.confidence - 0.85).abs() < 1e-9);
}

#[tokio::test]
async fn test_documents_alone_recover_their_elements() {
    let fx = fixture(1);
    let state = state_at("s1", 9, "Phase 3.1");
    fx.docs.update_all_files(&state).await;

    let ctx = fx.engine.reconstruct_context("s1").await.unwrap();
    assert_eq!(ctx.value(ElementType::Phase), Some("Phase 3.1"));
    assert!(ctx.missing_elements.is_empty());
    assert!(ctx
        .element(ElementType::SessionId)
        .unwrap()
        .source_location
        .starts_with("doc:"));
}

#[tokio::test]
async fn test_generate_recovery_report() {
    let fx = fixture(3);
    let state = state_at("s1", 9, "Phase 2.1");
    fx.redundancy.store_with_redundancy(&state).await;

    let report = fx.engine.generate_recovery_report("s1").await.unwrap();
    assert_eq!(report.session_id, "s1");
    assert!(report.validation.valid);
    assert!(report.capability.recoverable);
    assert!(report.summary.starts_with("Recovered 10/10 elements for s1"));
    assert!(!report.summary.contains("review required"));
}
