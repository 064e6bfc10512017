//! Connection lifecycle, heartbeats, and subscriber dispatch.

use super::{ChannelMessage, MessageConnection, MessageTransport, TYPE_PING, TYPE_PONG};
use crate::core::{ConnectionPhase, ConnectionState};
use crate::errors::SyncError;
use crate::retry::{reconnect_delay, RetryConfig};
use crate::utils::iso_timestamp;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Heartbeat ping interval in milliseconds. A missing pong within one
    /// interval is treated as a transport failure.
    pub heartbeat_interval_ms: u64,
    /// Reconnect backoff policy. `max_attempts` bounds consecutive failed
    /// reconnects before the channel goes terminal.
    pub reconnect: RetryConfig,
    /// Whether to reconnect automatically after a transport failure.
    pub auto_reconnect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            reconnect: RetryConfig::new()
                .with_max_attempts(5)
                .with_base_delay_ms(500)
                .with_max_delay_ms(30_000),
            auto_reconnect: true,
        }
    }
}

impl ChannelConfig {
    /// Creates a new channel config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval_ms(mut self, interval: u64) -> Self {
        self.heartbeat_interval_ms = interval;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Enables or disables automatic reconnection.
    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }
}

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Per-message-type subscriber registry.
///
/// Subscribe and unsubscribe may be called while a dispatch is in
/// progress; dispatch snapshots the handler list under a read lock and
/// invokes outside it, so in-flight dispatch is never dropped.
#[derive(Default)]
struct SubscriberRegistry {
    handlers: RwLock<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    fn subscribe(&self, message_type: &str, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .entry(message_type.to_string())
            .or_default()
            .push((id, handler));
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(entry_id, _)| *entry_id != id.0);
            removed |= list.len() != before;
        }
        removed
    }

    /// Dispatches to every handler registered for the exact message type.
    fn dispatch(&self, message: &ChannelMessage) {
        let snapshot: Vec<Handler> = self
            .handlers
            .read()
            .get(&message.message_type)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in snapshot {
            handler(message);
        }
    }
}

enum Command {
    Send(ChannelMessage),
    Reconnect,
    Disconnect,
}

/// How a connected session ended.
enum SessionEnd {
    TransportFailure,
    ManualReconnect,
    Teardown,
}

enum Establish {
    Connected(Box<dyn MessageConnection>),
    Failed,
    Teardown,
}

enum Wait {
    Proceed,
    Teardown,
}

/// The realtime channel entry point.
pub struct RealtimeChannel;

impl RealtimeChannel {
    /// Spawns the channel actor for a session and returns its handle.
    ///
    /// The actor owns the connection lifecycle; the handle is the only way
    /// to interact with it. Dropping the handle tears the actor down.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn MessageTransport>,
        endpoint: impl Into<String>,
        session_id: impl Into<String>,
        config: ChannelConfig,
    ) -> ChannelHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::disconnected());
        let subscribers = Arc::new(SubscriberRegistry::default());

        let actor = ChannelActor {
            transport,
            endpoint: endpoint.into(),
            session_id: session_id.into(),
            config,
            subscribers: subscribers.clone(),
            commands: command_rx,
            state_tx,
            outbound: VecDeque::new(),
            attempt: 0,
        };
        let task = tokio::spawn(actor.run());

        ChannelHandle {
            commands: command_tx,
            subscribers,
            state_rx,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Handle to a running channel actor.
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    subscribers: Arc<SubscriberRegistry>,
    state_rx: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle {
    /// Sends a message, queueing it if the channel is not connected.
    ///
    /// Messages queued while disconnected are flushed strictly in FIFO
    /// order once the connection is (re)established.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChannelClosed`] if the actor has terminated.
    pub fn send(&self, message: ChannelMessage) -> Result<(), SyncError> {
        self.commands
            .send(Command::Send(message))
            .map_err(|_| SyncError::ChannelClosed("realtime channel actor stopped".into()))
    }

    /// Registers a handler for an exact message type.
    ///
    /// Reserved heartbeat types are never dispatched, so subscribing to
    /// them has no effect beyond occupying a registry slot.
    pub fn subscribe<F>(&self, message_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(message_type, Arc::new(handler))
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Requests an immediate reconnection, resetting the attempt counter.
    ///
    /// Explicit recovery is not penalized by prior backoff history.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChannelClosed`] if the actor has terminated.
    pub fn reconnect(&self) -> Result<(), SyncError> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| SyncError::ChannelClosed("realtime channel actor stopped".into()))
    }

    /// Tears the channel down deterministically and waits for the actor
    /// to finish. No timers or loops survive this call.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// A snapshot of the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Subscribes to connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

struct ChannelActor {
    transport: Arc<dyn MessageTransport>,
    endpoint: String,
    session_id: String,
    config: ChannelConfig,
    subscribers: Arc<SubscriberRegistry>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    outbound: VecDeque<ChannelMessage>,
    attempt: usize,
}

impl ChannelActor {
    async fn run(mut self) {
        loop {
            self.set_phase(ConnectionPhase::Connecting);
            match self.establish().await {
                Establish::Connected(conn) => {
                    self.attempt = 0;
                    self.set_phase(ConnectionPhase::Connected);
                    info!(session = %self.session_id, endpoint = %self.endpoint, "Realtime channel connected");
                    match self.run_connected(conn).await {
                        SessionEnd::Teardown => {
                            self.set_terminal();
                            return;
                        }
                        SessionEnd::ManualReconnect => {
                            self.attempt = 0;
                            continue;
                        }
                        SessionEnd::TransportFailure => {}
                    }
                }
                Establish::Failed => {}
                Establish::Teardown => {
                    self.set_terminal();
                    return;
                }
            }

            if !self.config.auto_reconnect {
                self.set_terminal();
                return;
            }
            if self.attempt >= self.config.reconnect.max_attempts {
                warn!(
                    session = %self.session_id,
                    attempts = self.attempt,
                    "Reconnect budget exhausted; realtime channel is down"
                );
                self.set_terminal();
                return;
            }
            let delay = reconnect_delay(self.attempt, &self.config.reconnect);
            self.attempt += 1;
            self.set_phase(ConnectionPhase::Disconnected);
            debug!(
                session = %self.session_id,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            match self.wait_before_reconnect(delay).await {
                Wait::Proceed => {}
                Wait::Teardown => {
                    self.set_terminal();
                    return;
                }
            }
        }
    }

    /// Opens a connection while continuing to accept commands. Sends
    /// arriving mid-connect are queued, never failed.
    async fn establish(&mut self) -> Establish {
        let connect = self.transport.connect(&self.endpoint);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(conn) => Establish::Connected(conn),
                        Err(error) => {
                            warn!(
                                session = %self.session_id,
                                endpoint = %self.endpoint,
                                error = %error,
                                "Realtime connect failed"
                            );
                            Establish::Failed
                        }
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(message)) => self.outbound.push_back(message),
                    Some(Command::Reconnect) => self.attempt = 0,
                    Some(Command::Disconnect) | None => return Establish::Teardown,
                }
            }
        }
    }

    async fn run_connected(&mut self, mut conn: Box<dyn MessageConnection>) -> SessionEnd {
        // Flush messages queued while disconnected, oldest first, before
        // accepting new sends.
        while let Some(message) = self.outbound.pop_front() {
            if let Err(error) = conn.send(message.clone()).await {
                warn!(session = %self.session_id, error = %error, "Flush failed");
                self.outbound.push_front(message);
                conn.close().await;
                return SessionEnd::TransportFailure;
            }
        }

        let mut heartbeat = tokio::time::interval(Duration::from_millis(
            self.config.heartbeat_interval_ms,
        ));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        enum Action {
            Cmd(Option<Command>),
            Frame(Result<Option<ChannelMessage>, SyncError>),
            Heartbeat,
        }

        loop {
            let action = tokio::select! {
                cmd = self.commands.recv() => Action::Cmd(cmd),
                frame = conn.recv() => Action::Frame(frame),
                _ = heartbeat.tick() => Action::Heartbeat,
            };

            match action {
                Action::Cmd(Some(Command::Send(message))) => {
                    if let Err(error) = conn.send(message.clone()).await {
                        warn!(session = %self.session_id, error = %error, "Send failed");
                        self.outbound.push_front(message);
                        conn.close().await;
                        return SessionEnd::TransportFailure;
                    }
                }
                Action::Cmd(Some(Command::Reconnect)) => {
                    conn.close().await;
                    return SessionEnd::ManualReconnect;
                }
                Action::Cmd(Some(Command::Disconnect) | None) => {
                    conn.close().await;
                    return SessionEnd::Teardown;
                }
                Action::Frame(Ok(Some(message))) => {
                    if message.message_type == TYPE_PONG {
                        // Heartbeat bookkeeping only; never dispatched.
                        awaiting_pong = false;
                        self.touch_heartbeat();
                    } else if message.message_type == TYPE_PING {
                        let pong = ChannelMessage::pong(self.session_id.clone());
                        if conn.send(pong).await.is_err() {
                            conn.close().await;
                            return SessionEnd::TransportFailure;
                        }
                    } else {
                        self.subscribers.dispatch(&message);
                    }
                }
                Action::Frame(Ok(None)) => {
                    debug!(session = %self.session_id, "Remote closed the connection");
                    return SessionEnd::TransportFailure;
                }
                Action::Frame(Err(error)) => {
                    warn!(session = %self.session_id, error = %error, "Receive failed");
                    conn.close().await;
                    return SessionEnd::TransportFailure;
                }
                Action::Heartbeat => {
                    if awaiting_pong {
                        warn!(
                            session = %self.session_id,
                            "Heartbeat pong missing within interval; dropping connection"
                        );
                        conn.close().await;
                        return SessionEnd::TransportFailure;
                    }
                    let ping = ChannelMessage::ping(self.session_id.clone());
                    if conn.send(ping).await.is_err() {
                        conn.close().await;
                        return SessionEnd::TransportFailure;
                    }
                    awaiting_pong = true;
                }
            }
        }
    }

    async fn wait_before_reconnect(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Wait::Proceed,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(message)) => self.outbound.push_back(message),
                    Some(Command::Reconnect) => {
                        self.attempt = 0;
                        return Wait::Proceed;
                    }
                    Some(Command::Disconnect) | None => return Wait::Teardown,
                }
            }
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let attempt = self.attempt;
        self.state_tx.send_modify(|state| {
            state.phase = phase;
            state.terminal = false;
            state.reconnect_attempt = attempt;
        });
    }

    fn set_terminal(&self) {
        let attempt = self.attempt;
        self.state_tx.send_modify(|state| {
            state.phase = ConnectionPhase::Disconnected;
            state.terminal = true;
            state.reconnect_attempt = attempt;
        });
    }

    fn touch_heartbeat(&self) {
        self.state_tx.send_modify(|state| {
            state.last_heartbeat_at = Some(iso_timestamp());
        });
    }
}
