//! The coordinator implementation.

use super::GenerationBackend;
use crate::config::EngineConfig;
use crate::core::{ConnectionState, ErrorInfo, PipelineStage, SessionState, StagePayload, StageStatus};
use crate::errors::{ErrorClass, SyncError};
use crate::machine::{transition, StageEvent, TransitionEffect};
use crate::polling::{PollingScheduler, StatusSource};
use crate::realtime::{ChannelHandle, ChannelMessage, MessageTransport, RealtimeChannel, TYPE_PROGRESS};
use crate::resume::{classify_token, resolve, RemoteSnapshot, Resolution, TokenClass};
use crate::utils::generate_session_id;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The serialized application point for state-machine events.
///
/// Poll-derived and channel-derived events, as well as user intents, all
/// go through [`SessionCell::apply`]; the mutex guarantees that two events
/// can never interleave into an inconsistent state, and subscribers
/// observe states in application order.
struct SessionCell {
    state: Mutex<Option<SessionState>>,
    notify_tx: watch::Sender<Option<SessionState>>,
}

impl SessionCell {
    fn new() -> Self {
        let (notify_tx, _) = watch::channel(None);
        Self {
            state: Mutex::new(None),
            notify_tx,
        }
    }

    fn apply(&self, event: &StageEvent) -> Vec<TransitionEffect> {
        let mut guard = self.state.lock();
        let Some(current) = guard.as_ref() else {
            debug!(event = event.kind(), "Event arrived with no active session; ignoring");
            return vec![TransitionEffect::Rejected {
                reason: "no active session".to_string(),
            }];
        };
        let result = transition(current, event);
        if result.accepted() {
            debug!(
                session = %result.state.session_id,
                event = event.kind(),
                active_stage = %result.state.active_stage,
                "Applied transition"
            );
            *guard = Some(result.state.clone());
            // Published while the lock is held so observers see states in
            // application order.
            self.notify_tx.send_replace(Some(result.state));
        } else {
            debug!(event = event.kind(), "Rejected transition");
        }
        result.effects
    }

    fn install(&self, state: SessionState) {
        let mut guard = self.state.lock();
        *guard = Some(state.clone());
        self.notify_tx.send_replace(Some(state));
    }

    fn clear(&self) {
        let mut guard = self.state.lock();
        *guard = None;
        self.notify_tx.send_replace(None);
    }

    fn snapshot(&self) -> Option<SessionState> {
        self.state.lock().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<SessionState>> {
        self.notify_tx.subscribe()
    }
}

/// Adapts the backend's status query for the polling scheduler, which
/// depends only on the abstract read.
struct BackendStatusSource(Arc<dyn GenerationBackend>);

#[async_trait::async_trait]
impl StatusSource for BackendStatusSource {
    async fn fetch_status(&self, session_id: &str) -> Result<RemoteSnapshot, SyncError> {
        self.0.fetch_status(session_id).await
    }
}

/// Drives one pipeline session over an unreliable channel.
///
/// One coordinator instance serves one active session, driven by a single
/// logical thread of control; background watch loops and the realtime
/// channel feed events back in through a serialized apply path.
pub struct WorkflowCoordinator {
    backend: Arc<dyn GenerationBackend>,
    config: EngineConfig,
    cell: Arc<SessionCell>,
    scheduler: PollingScheduler,
    events_tx: mpsc::UnboundedSender<StageEvent>,
    pump: JoinHandle<()>,
    transport: Option<Arc<dyn MessageTransport>>,
    channel: Mutex<Option<ChannelHandle>>,
}

impl WorkflowCoordinator {
    /// Creates a coordinator over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn GenerationBackend>, config: EngineConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cell = Arc::new(SessionCell::new());
        let scheduler = PollingScheduler::new(
            Arc::new(BackendStatusSource(backend.clone())),
            config.poll.clone(),
            events_tx.clone(),
        );
        let pump = tokio::spawn(pump_events(events_rx, cell.clone(), scheduler.clone()));
        Self {
            backend,
            config,
            cell,
            scheduler,
            events_tx,
            pump,
            transport: None,
            channel: Mutex::new(None),
        }
    }

    /// Attaches a realtime transport. Without one, the coordinator relies
    /// on polling alone.
    #[must_use]
    pub fn with_realtime_transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Starts a fresh session from a seed concept.
    ///
    /// Creates the session positioned at the first generated stage,
    /// issues the generation request, starts its watch, and opens the
    /// realtime channel if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial generation request is not
    /// acknowledged; the stage is then marked failed and can be retried.
    pub async fn start_new_session(
        &self,
        seed: serde_json::Value,
    ) -> Result<SessionState, SyncError> {
        self.teardown_current().await;

        let session_id = generate_session_id();
        info!(session = %session_id, "Starting new session");
        self.cell.install(SessionState::with_seed(&session_id, seed));
        self.cell.apply(&StageEvent::StartGeneration {
            stage: PipelineStage::Outline,
        });

        self.open_realtime(&session_id).await;
        self.begin_stage(&session_id, PipelineStage::Outline).await?;
        self.current_state()
    }

    /// Resumes a session from its remote snapshot.
    ///
    /// Fetches the snapshot once, resolves it onto session state, and
    /// restarts the watch if the resolved active stage is still
    /// generating.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ProtocolViolation`] for an unrecognized status
    /// token; displayed state is left untouched and polling continues.
    pub async fn resume_session(&self, session_id: &str) -> Result<SessionState, SyncError> {
        let snapshot = self.backend.fetch_status(session_id).await?;
        match resolve(&snapshot) {
            Resolution::Resume(event) => {
                let needs_base = self
                    .cell
                    .snapshot()
                    .map_or(true, |s| s.session_id != session_id);
                if needs_base {
                    self.teardown_current().await;
                    self.cell.install(SessionState::new(session_id));
                }
                self.cell.apply(&event);
                let state = self.current_state()?;
                info!(
                    session = %session_id,
                    active_stage = %state.active_stage,
                    status = %state.active_status(),
                    "Resumed session"
                );
                if state.active_status() == StageStatus::Generating {
                    self.scheduler.watch(session_id, state.active_stage);
                }
                self.open_realtime(session_id).await;
                Ok(state)
            }
            Resolution::Unknown { token } => {
                warn!(
                    session = %session_id,
                    token = %token,
                    "Unrecognized snapshot token; keeping displayed state and polling"
                );
                if self.cell.snapshot().is_none() {
                    self.cell.install(SessionState::new(session_id));
                    // Nothing is known yet; watch the first generated
                    // stage until the remote reports something usable.
                    self.scheduler.watch(session_id, PipelineStage::Outline);
                } else if let Some(state) = self.cell.snapshot() {
                    if state.active_status() == StageStatus::Generating {
                        self.scheduler.watch(&state.session_id, state.active_stage);
                    }
                }
                Err(SyncError::ProtocolViolation(format!(
                    "unrecognized status token: {token}"
                )))
            }
        }
    }

    /// Confirms a ready stage and begins generating the next one.
    ///
    /// The generation request for the next stage is only issued after the
    /// state machine has accepted the confirmation, so a request can never
    /// race ahead of the transition that legalizes it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::IllegalTransition`] if the stage is not ready.
    pub async fn confirm_stage(&self, stage: PipelineStage) -> Result<SessionState, SyncError> {
        let state = self.current_state()?;
        let session_id = state.session_id.clone();

        let effects = self.cell.apply(&StageEvent::UserConfirmed { stage });
        if let Some(reason) = rejection_reason(&effects) {
            return Err(SyncError::IllegalTransition(reason));
        }

        let advanced = effects.iter().find_map(|effect| match effect {
            TransitionEffect::Advanced(next) => Some(*next),
            _ => None,
        });
        if let Some(next) = advanced {
            let effects = self.cell.apply(&StageEvent::StartGeneration { stage: next });
            if rejection_reason(&effects).is_none() {
                self.begin_stage(&session_id, next).await?;
            }
        } else {
            info!(session = %session_id, "Pipeline complete");
        }
        self.current_state()
    }

    /// Re-issues generation for the currently failed stage, clearing the
    /// recorded error.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::IllegalTransition`] if the active stage has
    /// not failed.
    pub async fn retry_failed_stage(&self) -> Result<SessionState, SyncError> {
        let state = self.current_state()?;
        let stage = state.active_stage;
        if state.status_of(stage) != StageStatus::Failed {
            return Err(SyncError::IllegalTransition(format!(
                "retry requested but stage {stage} is {}",
                state.status_of(stage)
            )));
        }

        let effects = self.cell.apply(&StageEvent::StartGeneration { stage });
        if let Some(reason) = rejection_reason(&effects) {
            return Err(SyncError::IllegalTransition(reason));
        }
        info!(session = %state.session_id, stage = %stage, "Retrying failed stage");
        self.begin_stage(&state.session_id, stage).await?;
        self.current_state()
    }

    /// A read-only snapshot of the session, if one is active.
    #[must_use]
    pub fn state(&self) -> Option<SessionState> {
        self.cell.snapshot()
    }

    /// Subscribes to session state changes, for presentation layers that
    /// re-render on change instead of polling the coordinator.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<Option<SessionState>> {
        self.cell.subscribe()
    }

    /// The realtime connection state, if a channel is open.
    ///
    /// A terminal state here means realtime updates are unavailable and
    /// the engine is falling back to polling; the pipeline keeps moving.
    #[must_use]
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.channel.lock().as_ref().map(ChannelHandle::state)
    }

    /// Abandons the current session: cancels its watches, tears down the
    /// channel, and discards local state. Persistence of the authoritative
    /// snapshot is the remote side's job.
    pub async fn abandon_session(&self) {
        if let Some(state) = self.cell.snapshot() {
            info!(session = %state.session_id, "Abandoning session");
        }
        self.teardown_current().await;
        self.cell.clear();
    }

    /// The number of live watch loops (for observability and tests).
    #[must_use]
    pub fn active_watch_count(&self) -> usize {
        self.scheduler.active_watch_count()
    }

    fn current_state(&self) -> Result<SessionState, SyncError> {
        self.cell
            .snapshot()
            .ok_or_else(|| SyncError::IllegalTransition("no active session".to_string()))
    }

    /// Issues the generation request and starts the stage watch. The
    /// request's ack only confirms receipt; a nack fails the stage so the
    /// user can retry explicitly.
    async fn begin_stage(&self, session_id: &str, stage: PipelineStage) -> Result<(), SyncError> {
        if let Err(error) = self.backend.request_stage_generation(session_id, stage).await {
            warn!(
                session = %session_id,
                stage = %stage,
                error = %error,
                "Generation request not acknowledged"
            );
            self.cell.apply(&StageEvent::GenerationFailed {
                stage,
                error: ErrorInfo::new(error.class(), error.to_string())
                    .with_stage(stage)
                    .stamped(),
            });
            return Err(error);
        }
        self.scheduler.watch(session_id, stage);
        Ok(())
    }

    async fn open_realtime(&self, session_id: &str) {
        if !self.config.realtime_enabled {
            return;
        }
        let Some(transport) = &self.transport else {
            return;
        };

        let previous = self.channel.lock().take();
        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        let handle = RealtimeChannel::spawn(
            transport.clone(),
            self.config.realtime_endpoint.clone(),
            session_id,
            self.config.channel.clone(),
        );
        let events_tx = self.events_tx.clone();
        let session = session_id.to_string();
        handle.subscribe(TYPE_PROGRESS, move |message| {
            if let Some(event) = progress_to_event(&session, message) {
                let _ = events_tx.send(event);
            }
        });
        *self.channel.lock() = Some(handle);
    }

    async fn teardown_current(&self) {
        if let Some(state) = self.cell.snapshot() {
            self.scheduler.cancel_session(&state.session_id);
        }
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.disconnect().await;
        }
    }
}

impl Drop for WorkflowCoordinator {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn rejection_reason(effects: &[TransitionEffect]) -> Option<String> {
    effects.iter().find_map(|effect| match effect {
        TransitionEffect::Rejected { reason } => Some(reason.clone()),
        _ => None,
    })
}

/// Applies watch events and reacts to their effects. Terminal stage
/// effects cancel the redundant poll watch, which matters when the
/// realtime channel reported completion first.
async fn pump_events(
    mut events_rx: mpsc::UnboundedReceiver<StageEvent>,
    cell: Arc<SessionCell>,
    scheduler: PollingScheduler,
) {
    while let Some(event) = events_rx.recv().await {
        let session_id = cell.snapshot().map(|s| s.session_id);
        let effects = cell.apply(&event);
        let Some(session_id) = session_id else {
            continue;
        };
        for effect in effects {
            match effect {
                TransitionEffect::Ready(stage) | TransitionEffect::Failed(stage) => {
                    scheduler.cancel(&session_id, stage);
                }
                _ => {}
            }
        }
    }
}

/// Normalizes a progress message into a state-machine event.
///
/// Malformed messages are a protocol violation: logged and dropped, never
/// an error surfaced to the state machine.
fn progress_to_event(session_id: &str, message: &ChannelMessage) -> Option<StageEvent> {
    if message.session_id != session_id {
        debug!(
            expected = %session_id,
            got = %message.session_id,
            "Progress message for another session; ignoring"
        );
        return None;
    }
    let Some(payload) = &message.payload else {
        warn!("Progress message without payload; ignoring");
        return None;
    };
    let Some(token) = payload.get("status_token").and_then(|v| v.as_str()) else {
        warn!("Progress message without status token; ignoring");
        return None;
    };

    match classify_token(token) {
        TokenClass::Classified {
            stage,
            status: StageStatus::Ready,
        } => {
            let content = payload
                .get("content")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            Some(StageEvent::GenerationSucceeded {
                stage,
                payload: StagePayload::new(content),
            })
        }
        TokenClass::Classified {
            stage,
            status: StageStatus::Failed,
        } => {
            let detail = payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("remote reported generation failure");
            Some(StageEvent::GenerationFailed {
                stage,
                error: ErrorInfo::new(ErrorClass::RemotePermanentFailure, detail)
                    .with_stage(stage)
                    .stamped(),
            })
        }
        TokenClass::Classified { .. } => None,
        TokenClass::Unknown => {
            warn!(token = %token, "Unrecognized progress token; ignoring");
            None
        }
    }
}
