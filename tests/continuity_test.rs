//! End-to-end continuity scenarios
//!
//! Checkpoint a session through the full pipeline, lose parts of the
//! redundant copies, and recover it.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use session_continuity::config::Config;
use session_continuity::docs::DOCUMENT_TARGETS;
use session_continuity::gates::GateKind;
use session_continuity::phases::COMPLETE_PHASE_ID;
use session_continuity::state::{
    CompilationStatus, DatabaseStatus, ElementType, Issue, NextAction, Priority, SessionState,
    Severity, Task,
};
use session_continuity::storage::{MemoryBackend, StorageBackend};
use session_continuity::ContinuityService;

struct Harness {
    dir: TempDir,
    backends: Vec<Arc<MemoryBackend>>,
    service: ContinuityService,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.docs.dir = dir.path().join("docs");
    config.recovery.deadline_ms = 2000;

    let backends: Vec<Arc<MemoryBackend>> = (0..4)
        .map(|i| Arc::new(MemoryBackend::new(format!("backend-{}", i))))
        .collect();
    let dyn_backends: Vec<Arc<dyn StorageBackend>> = backends
        .iter()
        .map(|b| b.clone() as Arc<dyn StorageBackend>)
        .collect();
    let service = ContinuityService::new(dyn_backends, &config);

    Harness {
        dir,
        backends,
        service,
    }
}

fn s1() -> SessionState {
    SessionState::new("s1")
        .with_timestamp(Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).single())
        .with_duration(5400)
        .with_phase("Phase 2.1")
        .with_progress(45.5)
        .with_completed_task(Task::completed("task-1", "Session state model", "Phase 2.1"))
        .with_next_action(NextAction::new("Start redundant storage", Priority::High, 120))
        .with_compilation(CompilationStatus::succeeded(0))
        .with_database(DatabaseStatus::healthy("sqlite"))
        .with_toolchain("rustc 1.80.0")
        .with_build_tool_status("dependencies resolved")
}

#[cfg(test)]
mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_recover_s1() {
        let h = harness();
        let state = s1();

        let validation = h.service.states().capture_session_state(&state);
        assert!(validation.is_valid());

        let report = h.service.checkpoint(&state).await;
        let storage = report.storage.as_ref().unwrap();
        assert!(storage.success);
        assert_eq!(storage.storage_locations.len(), 4);

        let ctx = h.service.recovery().reconstruct_context("s1").await.unwrap();
        assert!(ctx.confidence > 0.95, "confidence {}", ctx.confidence);
        assert!(ctx.missing_elements.is_empty());
        assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.1"));
        assert_eq!(ctx.value(ElementType::SessionId), Some("s1"));
        assert_eq!(ctx.to_session_state().progress_percentage, 45.5);
    }

    #[tokio::test]
    async fn test_state_without_timestamp_never_reaches_storage() {
        let h = harness();
        let state = s1().with_timestamp(None);

        let validation = h.service.states().capture_session_state(&state);
        assert!(!validation.valid);
        assert!(!validation.errors.is_empty());

        let report = h.service.checkpoint(&state).await;
        assert!(report.storage.is_none());
        assert!(report.documentation.is_none());
        assert!(report.continuation.is_none());
        for backend in &h.backends {
            assert!(backend.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_two_of_four_backends_unreachable() {
        let h = harness();
        h.backends[1].set_available(false);
        h.backends[3].set_available(false);

        let report = h.service.checkpoint(&s1()).await;
        let storage = report.storage.unwrap();
        assert!(storage.success);
        assert_eq!(storage.storage_locations, vec!["backend-0", "backend-2"]);
        assert_eq!(storage.errors.len(), 2);
        assert_eq!(storage.partial_failures().count(), 2);
    }

    #[tokio::test]
    async fn test_three_of_four_unreachable_fails_and_skips_projection() {
        let h = harness();
        for backend in &h.backends[1..] {
            backend.set_available(false);
        }

        let report = h.service.checkpoint(&s1()).await;
        assert!(!report.storage.as_ref().unwrap().success);
        assert!(!report.persisted());
        assert!(report.documentation.is_none());
        assert!(!h.dir.path().join("docs").join("README.md").exists());
    }

    #[tokio::test]
    async fn test_unknown_session_is_empty_not_absent() {
        let h = harness();
        h.service.checkpoint(&s1()).await;

        let ctx = h.service.recovery().reconstruct_context("never-seen").await.unwrap();
        assert_eq!(ctx.confidence, 0.0);
        assert_eq!(ctx.missing_elements, ElementType::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let h = harness();
        h.service.checkpoint(&s1()).await;
        h.backends[0].remove("s1").await;

        let first = h.service.recovery().reconstruct_context("s1").await.unwrap();
        let second = h.service.recovery().reconstruct_context("s1").await.unwrap();
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.elements, second.elements);
        assert_eq!(first.missing_elements, second.missing_elements);
    }

    #[tokio::test]
    async fn test_recover_places_session_in_phase_catalog() {
        let h = harness();
        h.service.checkpoint(&s1()).await;

        let outcome = h.service.recover("s1").await.unwrap();
        assert!(outcome.report.validation.valid);
        assert_eq!(outcome.next_phase.next_phase_id, "Phase 2.2");
        assert_eq!(
            outcome.progress.completed_phases,
            vec!["Phase 1.1", "Phase 1.2", "Phase 2.1"]
        );
        assert_eq!(outcome.progress.overall_progress, 45.5);
    }

    #[tokio::test]
    async fn test_final_phase_recommends_complete() {
        let h = harness();
        h.service
            .checkpoint(&s1().with_phase("Phase 4.2").with_progress(100.0))
            .await;

        let outcome = h.service.recover("s1").await.unwrap();
        assert_eq!(outcome.next_phase.next_phase_id, COMPLETE_PHASE_ID);
        assert_eq!(outcome.next_phase.estimated_minutes, 0);
    }
}

#[cfg(test)]
mod degradation_tests {
    use super::*;

    #[tokio::test]
    async fn test_losing_backends_never_raises_scores() {
        let h = harness();
        h.service.checkpoint(&s1()).await;

        let baseline_ctx = h.service.recovery().reconstruct_context("s1").await.unwrap();
        let baseline_cv = h.service.redundancy().cross_validate_session("s1").await;
        assert!(baseline_cv.consistent);
        assert_eq!(baseline_cv.consistency_score, 100.0);

        let mut confidence = baseline_ctx.confidence;
        let mut consistency = baseline_cv.consistency_score;
        for (i, backend) in h.backends.iter().enumerate() {
            if i % 2 == 0 {
                backend.remove("s1").await;
            } else {
                backend.set_available(false);
            }
            let ctx = h.service.recovery().reconstruct_context("s1").await.unwrap();
            let cv = h.service.redundancy().cross_validate_session("s1").await;
            assert!(ctx.confidence <= confidence + 1e-9);
            assert!(cv.consistency_score <= consistency + 1e-9);
            confidence = ctx.confidence;
            consistency = cv.consistency_score;
        }

        // The projected documents alone still carry every element.
        let ctx = h.service.recovery().reconstruct_context("s1").await.unwrap();
        assert!(ctx.missing_elements.is_empty());
        assert!(ctx.confidence > 0.0);
        assert_eq!(ctx.failed_sources.len(), 2);
    }

    #[tokio::test]
    async fn test_lost_session_is_not_consistent() {
        let h = harness();
        h.service.checkpoint(&s1()).await;

        for backend in &h.backends[1..] {
            backend.remove("s1").await;
        }
        let cv = h.service.redundancy().cross_validate_session("s1").await;
        assert!(!cv.consistent);
        assert_eq!(cv.consistency_score, 25.0);

        h.backends[0].remove("s1").await;
        let cv = h.service.redundancy().cross_validate_session("s1").await;
        assert!(!cv.consistent);
        assert_eq!(cv.consistency_score, 0.0);

        let cv = h.service.redundancy().cross_validate_session("never-stored").await;
        assert!(!cv.consistent);
        assert_eq!(cv.consistency_score, 0.0);
    }

    #[tokio::test]
    async fn test_disagreeing_copy_lowers_consistency() {
        let h = harness();
        let state = s1();
        h.service.checkpoint(&state).await;

        // Same write time, different phase: a torn or tampered copy.
        h.backends[2].remove("s1").await;
        h.backends[2]
            .write(&state.clone().with_phase("Phase 1.2"))
            .await
            .unwrap();

        let cv = h.service.redundancy().cross_validate_session("s1").await;
        assert!(!cv.consistent);
        assert!(cv.consistency_score < 100.0);

        let ctx = h.service.recovery().reconstruct_context("s1").await.unwrap();
        assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.1"));
        assert!(ctx.conflicts.iter().any(|c| c.element == ElementType::Phase));
    }
}

#[cfg(test)]
mod gate_tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_runs_gates() {
        let h = harness();
        let report = h.service.checkpoint(&s1()).await;

        let point = report.continuation.as_ref().unwrap();
        assert_eq!(point.phase, "Phase 2.1");
        assert_eq!(point.next_action.as_deref(), Some("Start redundant storage"));

        let gates = report.gates.unwrap();
        assert!(gates.all_passed, "failed: {:?}", gates.failed_gates);
        assert!(report.documentation.unwrap().success);
    }

    #[tokio::test]
    async fn test_gates_on_unstored_snapshot_leave_documents_alone() {
        let h = harness();
        h.service.checkpoint(&s1()).await;

        let unstored = s1()
            .with_timestamp(Utc.with_ymd_and_hms(2025, 3, 14, 11, 0, 0).single())
            .with_phase("Phase 9.9")
            .with_progress(250.0);
        let results = h.service.gates().run_all_gates(&unstored).await;
        let docs_gate = results.gate(GateKind::Documentation).unwrap();
        assert!(!docs_gate.passed);
        assert!(!docs_gate.recommendations.is_empty());

        for backend in &h.backends {
            backend.set_available(false);
        }
        let ctx = h.service.recovery().reconstruct_context("s1").await.unwrap();
        assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.1"));
        assert_eq!(ctx.to_session_state().progress_percentage, 45.5);
    }

    #[tokio::test]
    async fn test_compilation_errors_always_fail_the_gate() {
        let h = harness();
        let base = s1()
            .with_issue(Issue::open("i1", "Flaky test", Severity::Low))
            .with_toolchain("rustc 1.81.0");

        for errors in [1, 2, 50] {
            for warnings in [0, 3] {
                let state = base
                    .clone()
                    .with_compilation(CompilationStatus::failed(errors, warnings));
                let results = h.service.gates().run_all_gates(&state).await;
                let gate = results.gate(GateKind::Compilation).unwrap();
                assert!(!gate.passed);
                assert!(!gate.recommendations.is_empty());
                assert!(!results.all_passed);
            }
        }
    }

    #[tokio::test]
    async fn test_bypass_does_not_clear_failure() {
        let h = harness();
        let broken = s1().with_compilation(CompilationStatus::failed(1, 0));

        let bypass = h
            .service
            .gates()
            .request_emergency_bypass("COMPILATION", "Production hotfix");
        assert!(bypass.approved);
        assert!(!bypass.remediation_plan.is_empty());

        let report = h.service.checkpoint(&broken).await;
        assert!(report.persisted());
        assert!(!report.fully_succeeded());
        assert_eq!(h.service.gates().audit_log().len(), 1);
    }
}

#[cfg(test)]
mod default_backend_tests {
    use super::*;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");
        config.database.path = dir.path().join("data").join("continuity.db");
        config.docs.dir = dir.path().join("docs");
        config.environment.toolchain_command = vec![];
        config
    }

    #[tokio::test]
    async fn test_round_trip_through_default_backends() {
        let dir = TempDir::new().unwrap();
        let service = ContinuityService::open(&config(&dir)).await.unwrap();

        let report = service.checkpoint(&s1()).await;
        assert_eq!(report.storage.unwrap().storage_locations.len(), 4);

        let ctx = service.recovery().reconstruct_context("s1").await.unwrap();
        assert!(ctx.confidence >= 0.95);
        assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.1"));
        assert_eq!(ctx.sources_responded.len(), 4 + DOCUMENT_TARGETS.len());
    }

    #[tokio::test]
    async fn test_documents_survive_total_storage_loss() {
        let dir = TempDir::new().unwrap();
        {
            let service = ContinuityService::open(&config(&dir)).await.unwrap();
            service.checkpoint(&s1()).await;
        }
        std::fs::remove_dir_all(dir.path().join("data")).unwrap();

        let service = ContinuityService::open(&config(&dir)).await.unwrap();
        let ctx = service.recovery().reconstruct_context("s1").await.unwrap();
        assert!(ctx.missing_elements.is_empty());
        assert_eq!(ctx.value(ElementType::Phase), Some("Phase 2.1"));
        assert!(ctx.sources_responded.iter().all(|s| s.starts_with("doc:")));
    }

    #[tokio::test]
    async fn test_environment_check_reports_database() {
        let dir = TempDir::new().unwrap();
        let service = ContinuityService::open(&config(&dir)).await.unwrap();

        let info = service.environment().capture_environment_state().await;
        assert_eq!(info.database, Some(DatabaseStatus::healthy("sqlite")));
        assert!(info.toolchain.version().is_none());
    }
}
