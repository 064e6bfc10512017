//! The watch loop and its registry.

use super::StatusSource;
use crate::core::{ErrorInfo, PipelineStage, StagePayload, StageStatus};
use crate::errors::{ErrorClass, SyncError};
use crate::machine::StageEvent;
use crate::resume::{classify_token, TokenClass};
use crate::retry::{decide, RetryConfig, RetryDecision, RetryState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Configuration for the polling scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Fixed sleep between "still working" polls, in milliseconds.
    pub interval_ms: u64,
    /// Deadline for a single status request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Retry policy for transient query failures.
    pub retry: RetryConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            request_timeout_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl PollConfig {
    /// Creates a new poll config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_interval_ms(mut self, interval: u64) -> Self {
        self.interval_ms = interval;
        self
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub fn with_request_timeout_ms(mut self, timeout: u64) -> Self {
        self.request_timeout_ms = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Cancellation flag shared between a watch handle and its loop.
///
/// Cancellation is idempotent: only the first call flips the flag and
/// wakes the loop.
#[derive(Debug, Default)]
struct WatchCancel {
    cancelled: AtomicBool,
    notify: Notify,
}

impl WatchCancel {
    fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // A stored permit, so a waiter registered after this call still
            // wakes immediately.
            self.notify.notify_one();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type WatchKey = (String, PipelineStage);

#[derive(Debug, Clone)]
struct ActiveWatch {
    generation: u64,
    cancel: Arc<WatchCancel>,
}

/// Handle to an active watch loop.
///
/// Dropping the handle does not cancel the watch; call
/// [`WatchHandle::cancel`], which is idempotent and safe to call after the
/// loop has terminated naturally.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    key: WatchKey,
    generation: u64,
    cancel: Arc<WatchCancel>,
    watches: Arc<DashMap<WatchKey, ActiveWatch>>,
}

impl WatchHandle {
    /// Cancels the watch loop.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.watches
            .remove_if(&self.key, |_, w| w.generation == self.generation);
    }

    /// Returns true if the watch has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The stage this watch tracks.
    #[must_use]
    pub fn stage(&self) -> PipelineStage {
        self.key.1
    }
}

/// Runs one status-watch loop per active stage.
///
/// At most one watch is live per `(session, stage)` pair: starting a new
/// watch for the same pair first cancels the existing one, so duplicate
/// terminal events cannot originate from stale loops.
#[derive(Clone)]
pub struct PollingScheduler {
    source: Arc<dyn StatusSource>,
    config: PollConfig,
    events: mpsc::UnboundedSender<StageEvent>,
    watches: Arc<DashMap<WatchKey, ActiveWatch>>,
    next_generation: Arc<AtomicU64>,
}

impl PollingScheduler {
    /// Creates a scheduler emitting events into the given channel.
    #[must_use]
    pub fn new(
        source: Arc<dyn StatusSource>,
        config: PollConfig,
        events: mpsc::UnboundedSender<StageEvent>,
    ) -> Self {
        Self {
            source,
            config,
            events,
            watches: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts a watch loop for a stage, cancelling any existing watch for
    /// the same `(session, stage)` pair.
    pub fn watch(&self, session_id: &str, stage: PipelineStage) -> WatchHandle {
        let key = (session_id.to_string(), stage);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(WatchCancel::default());

        if let Some((_, previous)) = self.watches.remove(&key) {
            previous.cancel.cancel();
        }
        self.watches.insert(
            key.clone(),
            ActiveWatch {
                generation,
                cancel: cancel.clone(),
            },
        );

        let handle = WatchHandle {
            key: key.clone(),
            generation,
            cancel: cancel.clone(),
            watches: self.watches.clone(),
        };

        let loop_self = self.clone();
        let session = key.0.clone();
        tokio::spawn(async move {
            loop_self.run_watch(&session, stage, &cancel).await;
            loop_self
                .watches
                .remove_if(&key, |_, w| w.generation == generation);
        });

        handle
    }

    /// Cancels the watch for a stage, if one is live.
    pub fn cancel(&self, session_id: &str, stage: PipelineStage) {
        let key = (session_id.to_string(), stage);
        if let Some((_, watch)) = self.watches.remove(&key) {
            watch.cancel.cancel();
        }
    }

    /// Cancels every watch belonging to a session.
    pub fn cancel_session(&self, session_id: &str) {
        let keys: Vec<WatchKey> = self
            .watches
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, watch)) = self.watches.remove(&key) {
                watch.cancel.cancel();
            }
        }
    }

    /// The number of live watches.
    #[must_use]
    pub fn active_watch_count(&self) -> usize {
        self.watches.len()
    }

    async fn run_watch(&self, session_id: &str, stage: PipelineStage, cancel: &WatchCancel) {
        let mut retry_state = RetryState::new();
        debug!(session = %session_id, stage = %stage, "Watch started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let fetched = tokio::select! {
                () = cancel.notify.notified() => break,
                result = timeout(
                    Duration::from_millis(self.config.request_timeout_ms),
                    self.source.fetch_status(session_id),
                ) => result,
            };

            let outcome = match fetched {
                Err(_) => Err(SyncError::TransientTransport(format!(
                    "status request exceeded {}ms deadline",
                    self.config.request_timeout_ms
                ))),
                Ok(result) => result,
            };

            match outcome {
                Ok(snapshot) => {
                    retry_state.reset();
                    if self.handle_snapshot(session_id, stage, &snapshot) {
                        break;
                    }
                }
                Err(error) => {
                    if self.handle_query_error(session_id, stage, &mut retry_state, &error, cancel).await {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                () = cancel.notify.notified() => break,
                () = tokio::time::sleep(Duration::from_millis(self.config.interval_ms)) => {}
            }
        }

        debug!(session = %session_id, stage = %stage, "Watch stopped");
    }

    /// Handles a successful status fetch. Returns true when the loop
    /// should stop (terminal event emitted).
    fn handle_snapshot(
        &self,
        session_id: &str,
        stage: PipelineStage,
        snapshot: &crate::resume::RemoteSnapshot,
    ) -> bool {
        match classify_token(&snapshot.status_token) {
            TokenClass::Classified {
                stage: reported,
                status,
            } if reported == stage => match status {
                StageStatus::Ready | StageStatus::Confirmed => {
                    let payload = snapshot
                        .payloads
                        .get(&stage)
                        .cloned()
                        .unwrap_or_else(|| StagePayload::from_snapshot(serde_json::Value::Null));
                    self.emit(StageEvent::GenerationSucceeded { stage, payload });
                    true
                }
                StageStatus::Failed => {
                    let message = snapshot
                        .error_detail
                        .clone()
                        .unwrap_or_else(|| "remote reported generation failure".to_string());
                    self.emit(StageEvent::GenerationFailed {
                        stage,
                        error: ErrorInfo::new(ErrorClass::RemotePermanentFailure, message)
                            .with_stage(stage)
                            .stamped(),
                    });
                    true
                }
                StageStatus::Generating | StageStatus::NotStarted => false,
            },
            TokenClass::Classified { stage: reported, .. } if reported > stage => {
                // The remote already moved past the watched stage; its
                // payload, if reported, proves completion.
                if let Some(payload) = snapshot.payloads.get(&stage) {
                    self.emit(StageEvent::GenerationSucceeded {
                        stage,
                        payload: payload.clone(),
                    });
                    true
                } else {
                    debug!(
                        session = %session_id,
                        stage = %stage,
                        token = %snapshot.status_token,
                        "Remote is past watched stage but reported no payload; continuing to poll"
                    );
                    false
                }
            }
            TokenClass::Classified { .. } => false,
            TokenClass::Unknown => {
                warn!(
                    session = %session_id,
                    stage = %stage,
                    token = %snapshot.status_token,
                    "Unrecognized status token; continuing to poll"
                );
                false
            }
        }
    }

    /// Handles a failed status fetch. Returns true when the loop should
    /// stop (failure event emitted).
    async fn handle_query_error(
        &self,
        session_id: &str,
        stage: PipelineStage,
        retry_state: &mut RetryState,
        error: &SyncError,
        cancel: &WatchCancel,
    ) -> bool {
        match decide(retry_state, &self.config.retry, error.class()) {
            RetryDecision::Retry(delay) => {
                debug!(
                    session = %session_id,
                    stage = %stage,
                    attempt = retry_state.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Status query failed; retrying"
                );
                tokio::select! {
                    () = cancel.notify.notified() => true,
                    () = tokio::time::sleep(delay) => false,
                }
            }
            RetryDecision::GiveUp => {
                warn!(
                    session = %session_id,
                    stage = %stage,
                    attempts = retry_state.attempt,
                    error = %error,
                    "Status query retries exhausted"
                );
                self.emit(StageEvent::GenerationFailed {
                    stage,
                    error: ErrorInfo::new(
                        ErrorClass::ExhaustedRetries,
                        format!(
                            "{} status checks failed; last error: {error}",
                            retry_state.attempt
                        ),
                    )
                    .with_stage(stage)
                    .stamped(),
                });
                true
            }
            RetryDecision::NotRetryable => {
                self.emit(StageEvent::GenerationFailed {
                    stage,
                    error: ErrorInfo::new(error.class(), error.to_string())
                        .with_stage(stage)
                        .stamped(),
                });
                true
            }
        }
    }

    fn emit(&self, event: StageEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped; discarding watch event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockBackend;
    use pretty_assertions::assert_eq;

    fn fast_config() -> PollConfig {
        PollConfig::new()
            .with_interval_ms(100)
            .with_request_timeout_ms(1_000)
            .with_retry(
                RetryConfig::new()
                    .with_max_attempts(3)
                    .with_base_delay_ms(10)
                    .with_jitter(crate::retry::JitterStrategy::None),
            )
    }

    fn scheduler_with(
        backend: &Arc<MockBackend>,
    ) -> (PollingScheduler, mpsc::UnboundedReceiver<StageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = PollingScheduler::new(backend.clone(), fast_config(), tx);
        (scheduler, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_emits_success_when_stage_ready() {
        let backend = Arc::new(MockBackend::new());
        backend.push_snapshot(crate::resume::RemoteSnapshot::new("outline_generating"));
        backend.push_snapshot(
            crate::resume::RemoteSnapshot::new("outline_generated")
                .with_payload(PipelineStage::Outline, serde_json::json!("the outline")),
        );
        let (scheduler, mut rx) = scheduler_with(&backend);

        scheduler.watch("s1", PipelineStage::Outline);
        let event = rx.recv().await.unwrap();
        match event {
            StageEvent::GenerationSucceeded { stage, payload } => {
                assert_eq!(stage, PipelineStage::Outline);
                assert_eq!(payload.content, serde_json::json!("the outline"));
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(backend.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_emits_failure_on_remote_failure() {
        let backend = Arc::new(MockBackend::new());
        backend.push_snapshot(
            crate::resume::RemoteSnapshot::new("outline_failed")
                .with_error_detail("model refused the prompt"),
        );
        let (scheduler, mut rx) = scheduler_with(&backend);

        scheduler.watch("s1", PipelineStage::Outline);
        match rx.recv().await.unwrap() {
            StageEvent::GenerationFailed { stage, error } => {
                assert_eq!(stage, PipelineStage::Outline);
                assert_eq!(error.class, ErrorClass::RemotePermanentFailure);
                assert_eq!(error.message, "model refused the prompt");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_watch_cancels_first() {
        let backend = Arc::new(MockBackend::new());
        backend.push_snapshot(crate::resume::RemoteSnapshot::new("outline_generating"));
        backend.set_repeat_last(true);
        backend.set_fetch_delay_ms(20);
        let (scheduler, _rx) = scheduler_with(&backend);

        let first = scheduler.watch("s1", PipelineStage::Outline);
        // Let the first loop get a few polls in.
        tokio::time::sleep(Duration::from_millis(350)).await;
        let second = scheduler.watch("s1", PipelineStage::Outline);
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(scheduler.active_watch_count(), 1);
        // At most one status query was ever outstanding.
        assert_eq!(backend.max_outstanding(), 1);
        second.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_safe_after_termination() {
        let backend = Arc::new(MockBackend::new());
        backend.push_snapshot(
            crate::resume::RemoteSnapshot::new("outline_generated")
                .with_payload(PipelineStage::Outline, serde_json::json!("o")),
        );
        let (scheduler, mut rx) = scheduler_with(&backend);

        let handle = scheduler.watch("s1", PipelineStage::Outline);
        let _ = rx.recv().await.unwrap();
        // Natural termination has already removed the registry entry.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.active_watch_count(), 0);

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_into_failed_stage() {
        let backend = Arc::new(MockBackend::new());
        backend.push_error("connection refused");
        backend.push_error("connection refused");
        backend.push_error("connection refused");
        let (scheduler, mut rx) = scheduler_with(&backend);

        scheduler.watch("s1", PipelineStage::Outline);
        match rx.recv().await.unwrap() {
            StageEvent::GenerationFailed { stage, error } => {
                assert_eq!(stage, PipelineStage::Outline);
                assert_eq!(error.class, ErrorClass::ExhaustedRetries);
                assert!(error.message.contains("3 status checks failed"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(backend.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_token_keeps_polling() {
        let backend = Arc::new(MockBackend::new());
        backend.push_snapshot(crate::resume::RemoteSnapshot::new("warming_up"));
        backend.push_snapshot(
            crate::resume::RemoteSnapshot::new("outline_generated")
                .with_payload(PipelineStage::Outline, serde_json::json!("o")),
        );
        let (scheduler, mut rx) = scheduler_with(&backend);

        scheduler.watch("s1", PipelineStage::Outline);
        match rx.recv().await.unwrap() {
            StageEvent::GenerationSucceeded { stage, .. } => {
                assert_eq!(stage, PipelineStage::Outline);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(backend.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_succeeds_when_remote_already_past_stage() {
        let backend = Arc::new(MockBackend::new());
        backend.push_snapshot(
            crate::resume::RemoteSnapshot::new("characters_generating")
                .with_payload(PipelineStage::Outline, serde_json::json!("o")),
        );
        let (scheduler, mut rx) = scheduler_with(&backend);

        scheduler.watch("s1", PipelineStage::Outline);
        match rx.recv().await.unwrap() {
            StageEvent::GenerationSucceeded { stage, payload } => {
                assert_eq!(stage, PipelineStage::Outline);
                assert_eq!(payload.content, serde_json::json!("o"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_session_stops_all_watches() {
        let backend = Arc::new(MockBackend::new());
        backend.push_snapshot(crate::resume::RemoteSnapshot::new("outline_generating"));
        backend.set_repeat_last(true);
        let (scheduler, _rx) = scheduler_with(&backend);

        let a = scheduler.watch("s1", PipelineStage::Outline);
        let b = scheduler.watch("s2", PipelineStage::Outline);
        scheduler.cancel_session("s1");

        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert_eq!(scheduler.active_watch_count(), 1);
        b.cancel();
    }
}
