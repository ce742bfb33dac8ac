//! Structured log output of lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use germline_core::obs::{
    emit_candidate_culled, emit_entry_evicted, emit_lifecycle_error, emit_state_changed,
};
use germline_core::{
    CandidateId, CandidateSpan, ChunkMetadata, DataChunk, EntryId, LifecycleEvent, LifecycleState,
    OrchestratorConfig, ScriptedRuntime, Supervisor, TrainStep,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn state_change_carries_event_field_and_candidate() {
    emit_state_changed(
        CandidateId::new(4, 2),
        LifecycleState::Buffering,
        LifecycleState::TrainingReady,
    );
    assert!(logs_contain("candidate.state_changed"));
    assert!(logs_contain("c4.2"));
    assert!(logs_contain("training_ready"));
}

#[traced_test]
#[test]
fn lifecycle_errors_log_stage_and_reason() {
    emit_lifecycle_error(CandidateId::new(0, 0), "evaluation", &"runtime returned NaN");
    assert!(logs_contain("WARN"));
    assert!(logs_contain("stage=evaluation"));
    assert!(logs_contain("runtime returned NaN"));
}

#[traced_test]
#[test]
fn eviction_logs_entry_and_score() {
    emit_entry_evicted(EntryId(17), 0.25);
    assert!(logs_contain("registry.evicted"));
    assert!(logs_contain("e17"));
}

#[traced_test]
#[test]
fn candidate_span_scopes_nested_events() {
    let _span = CandidateSpan::enter(CandidateId::new(9, 0));
    tracing::info!("inside");
    assert!(logs_contain("germline.candidate"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn failed_training_is_logged_per_attempt() {
    let runtime = Arc::new(ScriptedRuntime::new().with_steps(vec![
        TrainStep::Fail("gpu lost".into());
        2
    ]));
    let config = OrchestratorConfig {
        byte_budget_per_candidate: 10,
        ready_threshold_fraction: 1.0,
        candidate_slots: 1,
        training_retry_limit: 2,
        retry_backoff_ms: 5,
        ..Default::default()
    };
    let supervisor = Supervisor::builder(config)
        .runtime(runtime)
        .start()
        .await
        .unwrap();
    let mut events = supervisor.subscribe();
    let id = supervisor.list_candidates()[0].id;

    supervisor
        .ingest(id, DataChunk::new(vec![0u8; 10], ChunkMetadata::new("obs")))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Ok(event) = events.recv().await {
            if matches!(event, LifecycleEvent::TrainingFailed { .. }) {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(logs_contain("job.attempt_failed"));
    assert!(logs_contain("gpu lost"));
    assert!(logs_contain("stage=training"));
    supervisor.shutdown().await;
}

#[traced_test]
#[test]
fn culling_logs_fitness_against_threshold() {
    emit_candidate_culled(CandidateId::new(2, 0), 0.125, 0.3);
    assert!(logs_contain("candidate.culled"));
    assert!(logs_contain("c2.0"));
    assert!(logs_contain("fitness=0.125"));
    assert!(logs_contain("threshold=0.3"));
}
