//! End-to-end tests driving the coordinator against scripted doubles.

use super::WorkflowCoordinator;
use crate::config::EngineConfig;
use crate::core::{PipelineStage, SessionState, StageStatus};
use crate::errors::{ErrorClass, SyncError};
use crate::polling::PollConfig;
use crate::realtime::{ChannelConfig, ChannelMessage, TYPE_PROGRESS};
use crate::resume::RemoteSnapshot;
use crate::retry::{JitterStrategy, RetryConfig};
use crate::testing::mocks::{MockBackend, MockTransport};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn test_config() -> EngineConfig {
    EngineConfig::new()
        .with_poll(
            PollConfig::new()
                .with_interval_ms(100)
                .with_request_timeout_ms(1_000)
                .with_retry(
                    RetryConfig::new()
                        .with_max_attempts(3)
                        .with_base_delay_ms(10)
                        .with_jitter(JitterStrategy::None),
                ),
        )
        .with_channel(ChannelConfig::new().with_heartbeat_interval_ms(1_000))
        .with_realtime_enabled(false)
}

async fn wait_for_session<F>(rx: &mut watch::Receiver<Option<SessionState>>, predicate: F)
where
    F: Fn(&SessionState) -> bool,
{
    loop {
        if rx.borrow().as_ref().map_or(false, &predicate) {
            return;
        }
        rx.changed()
            .await
            .expect("coordinator dropped before reaching expected state");
    }
}

#[tokio::test(start_paused = true)]
async fn test_scenario_new_session_through_first_confirmation() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
    backend.push_snapshot(
        RemoteSnapshot::new("outline_generated")
            .with_payload(PipelineStage::Outline, serde_json::json!("three acts")),
    );

    let coordinator = WorkflowCoordinator::new(backend.clone(), test_config());
    let mut state_rx = coordinator.subscribe_state();

    let state = coordinator
        .start_new_session(serde_json::json!("a sunset scene"))
        .await
        .unwrap();
    assert_eq!(state.active_stage, PipelineStage::Outline);
    assert_eq!(state.active_status(), StageStatus::Generating);
    let session_id = state.session_id.clone();

    // Polling observes "generating" then "generated" and the outline
    // becomes ready for confirmation.
    wait_for_session(&mut state_rx, |s| {
        s.status_of(PipelineStage::Outline) == StageStatus::Ready
    })
    .await;
    let state = coordinator.state().unwrap();
    assert_eq!(
        state.payload_of(PipelineStage::Outline).unwrap().content,
        serde_json::json!("three acts")
    );
    state.check_invariants().unwrap();

    // Confirming the outline starts the character set and a new watch.
    backend.push_snapshot(RemoteSnapshot::new("characters_generating"));
    backend.set_repeat_last(true);
    let state = coordinator.confirm_stage(PipelineStage::Outline).await.unwrap();
    assert_eq!(state.active_stage, PipelineStage::Characters);
    assert_eq!(state.active_status(), StageStatus::Generating);
    assert_eq!(
        backend.generation_requests(),
        vec![
            (session_id.clone(), PipelineStage::Outline),
            (session_id, PipelineStage::Characters),
        ]
    );
    assert_eq!(coordinator.active_watch_count(), 1);
    state.check_invariants().unwrap();

    coordinator.abandon_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_scenario_resume_mid_pipeline() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(
        RemoteSnapshot::new("scenes_generated")
            .with_payload(PipelineStage::Outline, serde_json::json!("outline"))
            .with_payload(PipelineStage::Characters, serde_json::json!("cast"))
            .with_payload(PipelineStage::Scenes, serde_json::json!("scenes")),
    );

    let coordinator = WorkflowCoordinator::new(backend, test_config());
    let state = coordinator.resume_session("s1").await.unwrap();

    assert_eq!(state.session_id, "s1");
    assert_eq!(state.active_stage, PipelineStage::Scenes);
    assert_eq!(state.status_of(PipelineStage::Outline), StageStatus::Confirmed);
    assert_eq!(state.status_of(PipelineStage::Characters), StageStatus::Confirmed);
    assert_eq!(state.status_of(PipelineStage::Scenes), StageStatus::Ready);
    assert_eq!(state.status_of(PipelineStage::Storyboard), StageStatus::NotStarted);
    state.check_invariants().unwrap();

    // Nothing is generating, so no watch was started.
    assert_eq!(coordinator.active_watch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resume_restarts_watch_for_generating_stage() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(
        RemoteSnapshot::new("storyboard_generating")
            .with_payload(PipelineStage::Outline, serde_json::json!("o"))
            .with_payload(PipelineStage::Characters, serde_json::json!("c"))
            .with_payload(PipelineStage::Scenes, serde_json::json!("s")),
    );
    backend.push_snapshot(RemoteSnapshot::new("storyboard_generating"));
    backend.set_repeat_last(true);

    let coordinator = WorkflowCoordinator::new(backend, test_config());
    let state = coordinator.resume_session("s1").await.unwrap();
    assert_eq!(state.active_status(), StageStatus::Generating);
    assert_eq!(coordinator.active_watch_count(), 1);

    coordinator.abandon_session().await;
    assert_eq!(coordinator.active_watch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resume_with_unknown_token_keeps_polling() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(RemoteSnapshot::new("v2_paused"));
    backend.set_repeat_last(true);

    let coordinator = WorkflowCoordinator::new(backend, test_config());
    let result = coordinator.resume_session("s1").await;
    match result {
        Err(SyncError::ProtocolViolation(message)) => {
            assert!(message.contains("v2_paused"));
        }
        other => panic!("expected protocol violation, got {other:?}"),
    }

    // Displayed state is a blank session, and a watch keeps polling until
    // the remote reports something usable.
    let state = coordinator.state().unwrap();
    assert_eq!(state.active_stage, PipelineStage::Input);
    assert_eq!(coordinator.active_watch_count(), 1);

    coordinator.abandon_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_scenario_transient_poll_failures_exhaust_then_retry() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
    backend.push_error("connection reset");
    backend.push_error("connection reset");
    backend.push_error("connection reset");

    let coordinator = WorkflowCoordinator::new(backend.clone(), test_config());
    let mut state_rx = coordinator.subscribe_state();
    coordinator
        .start_new_session(serde_json::json!("a heist story"))
        .await
        .unwrap();

    // Three consecutive transient failures consume the attempt budget.
    wait_for_session(&mut state_rx, |s| {
        s.status_of(PipelineStage::Outline) == StageStatus::Failed
    })
    .await;
    let state = coordinator.state().unwrap();
    let error = state.last_error.clone().unwrap();
    assert_eq!(error.class, ErrorClass::ExhaustedRetries);
    assert_eq!(error.stage, Some(PipelineStage::Outline));

    // Explicit retry clears the error and starts a fresh watch.
    backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
    backend.set_repeat_last(true);
    let state = coordinator.retry_failed_stage().await.unwrap();
    assert_eq!(state.active_status(), StageStatus::Generating);
    assert!(state.last_error.is_none());
    assert_eq!(coordinator.active_watch_count(), 1);
    let requests = backend.generation_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|(_, stage)| *stage == PipelineStage::Outline));

    coordinator.abandon_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_rejected_unless_stage_failed() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
    backend.set_repeat_last(true);

    let coordinator = WorkflowCoordinator::new(backend, test_config());
    coordinator
        .start_new_session(serde_json::json!("seed"))
        .await
        .unwrap();
    let result = coordinator.retry_failed_stage().await;
    assert!(matches!(result, Err(SyncError::IllegalTransition(_))));

    coordinator.abandon_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_generation_request_fails_stage() {
    let backend = Arc::new(MockBackend::new());
    backend.set_fail_generation_requests(true);

    let coordinator = WorkflowCoordinator::new(backend.clone(), test_config());
    let result = coordinator
        .start_new_session(serde_json::json!("seed"))
        .await;
    assert!(result.is_err());

    let state = coordinator.state().unwrap();
    assert_eq!(state.status_of(PipelineStage::Outline), StageStatus::Failed);

    // Once the backend recovers, the explicit retry path works.
    backend.set_fail_generation_requests(false);
    backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
    backend.set_repeat_last(true);
    let state = coordinator.retry_failed_stage().await.unwrap();
    assert_eq!(state.active_status(), StageStatus::Generating);

    coordinator.abandon_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_channel_progress_drives_state_and_cancels_watch() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
    backend.set_repeat_last(true);
    let transport = Arc::new(MockTransport::new());
    let ctrl = transport.push_connection();
    ctrl.set_auto_pong(true);

    let coordinator = WorkflowCoordinator::new(
        backend,
        test_config().with_realtime_enabled(true),
    )
    .with_realtime_transport(transport);
    let mut state_rx = coordinator.subscribe_state();

    let state = coordinator
        .start_new_session(serde_json::json!("a sunset scene"))
        .await
        .unwrap();
    let session_id = state.session_id.clone();

    // The push channel reports completion while polling still sees
    // "generating".
    ctrl.push_frame(
        ChannelMessage::new(TYPE_PROGRESS, session_id)
            .with_stage("outline")
            .with_payload(serde_json::json!({
                "status_token": "outline_generated",
                "content": "pushed outline",
            })),
    );
    wait_for_session(&mut state_rx, |s| {
        s.status_of(PipelineStage::Outline) == StageStatus::Ready
    })
    .await;

    let state = coordinator.state().unwrap();
    assert_eq!(
        state.payload_of(PipelineStage::Outline).unwrap().content,
        serde_json::json!("pushed outline")
    );
    state.check_invariants().unwrap();

    // The redundant poll watch is cancelled once the channel delivered
    // the terminal report.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(coordinator.active_watch_count(), 0);

    coordinator.abandon_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_terminal_reports_advance_exactly_once() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(
        RemoteSnapshot::new("outline_generated")
            .with_payload(PipelineStage::Outline, serde_json::json!("polled outline")),
    );
    backend.set_repeat_last(true);
    let transport = Arc::new(MockTransport::new());
    let ctrl = transport.push_connection();
    ctrl.set_auto_pong(true);

    let coordinator = WorkflowCoordinator::new(
        backend,
        test_config().with_realtime_enabled(true),
    )
    .with_realtime_transport(transport);
    let mut state_rx = coordinator.subscribe_state();

    let state = coordinator
        .start_new_session(serde_json::json!("seed"))
        .await
        .unwrap();
    let session_id = state.session_id.clone();

    // Both paths report the same completion; the second application is a
    // rejected no-op.
    ctrl.push_frame(
        ChannelMessage::new(TYPE_PROGRESS, session_id)
            .with_stage("outline")
            .with_payload(serde_json::json!({
                "status_token": "outline_generated",
                "content": "pushed outline",
            })),
    );
    wait_for_session(&mut state_rx, |s| {
        s.status_of(PipelineStage::Outline) == StageStatus::Ready
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let state = coordinator.state().unwrap();
    assert_eq!(state.status_of(PipelineStage::Outline), StageStatus::Ready);
    assert_eq!(state.active_stage, PipelineStage::Outline);
    state.check_invariants().unwrap();

    coordinator.abandon_session().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_pipeline_walkthrough() {
    let backend = Arc::new(MockBackend::new());
    let coordinator = WorkflowCoordinator::new(backend.clone(), test_config());
    let mut state_rx = coordinator.subscribe_state();

    backend.push_snapshot(
        RemoteSnapshot::new("outline_generated")
            .with_payload(PipelineStage::Outline, serde_json::json!("outline")),
    );
    coordinator
        .start_new_session(serde_json::json!("an ocean voyage"))
        .await
        .unwrap();

    let stages = [
        (PipelineStage::Outline, PipelineStage::Characters, "characters_generated"),
        (PipelineStage::Characters, PipelineStage::Scenes, "scenes_generated"),
        (PipelineStage::Scenes, PipelineStage::Storyboard, "storyboard_generated"),
        (PipelineStage::Storyboard, PipelineStage::Artifact, "artifact_generated"),
    ];
    for (stage, next, next_token) in stages {
        wait_for_session(&mut state_rx, |s| {
            s.status_of(stage) == StageStatus::Ready
        })
        .await;
        backend.push_snapshot(
            RemoteSnapshot::new(next_token)
                .with_payload(next, serde_json::json!(next.token_name())),
        );
        let state = coordinator.confirm_stage(stage).await.unwrap();
        assert_eq!(state.active_stage, next);
        state.check_invariants().unwrap();
    }

    wait_for_session(&mut state_rx, |s| {
        s.status_of(PipelineStage::Artifact) == StageStatus::Ready
    })
    .await;
    let state = coordinator
        .confirm_stage(PipelineStage::Artifact)
        .await
        .unwrap();
    assert!(state.completed);
    assert_eq!(coordinator.active_watch_count(), 0);
    state.check_invariants().unwrap();

    // The pipeline is terminal; confirming again is rejected.
    let result = coordinator.confirm_stage(PipelineStage::Artifact).await;
    assert!(matches!(result, Err(SyncError::IllegalTransition(_))));
}

#[tokio::test(start_paused = true)]
async fn test_abandon_tears_down_watches_and_channel() {
    let backend = Arc::new(MockBackend::new());
    backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
    backend.set_repeat_last(true);
    let transport = Arc::new(MockTransport::new());
    let ctrl = transport.push_connection();
    ctrl.set_auto_pong(true);

    let coordinator = WorkflowCoordinator::new(
        backend.clone(),
        test_config().with_realtime_enabled(true),
    )
    .with_realtime_transport(transport);
    coordinator
        .start_new_session(serde_json::json!("seed"))
        .await
        .unwrap();
    assert_eq!(coordinator.active_watch_count(), 1);

    coordinator.abandon_session().await;
    assert_eq!(coordinator.active_watch_count(), 0);
    assert!(coordinator.state().is_none());
    assert!(coordinator.connection_state().is_none());
    assert!(ctrl.is_closed());

    // No polling continues after teardown. Give the cancelled loop a tick
    // to wind down before sampling the counter.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = backend.fetch_count();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.fetch_count(), settled);
}
