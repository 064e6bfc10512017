//! Scripted mock backend and transport.

use crate::coordinator::GenerationBackend;
use crate::core::PipelineStage;
use crate::errors::SyncError;
use crate::polling::StatusSource;
use crate::realtime::{ChannelMessage, MessageConnection, MessageTransport};
use crate::resume::RemoteSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

enum ScriptEntry {
    Snapshot(RemoteSnapshot),
    Error(String),
}

/// Counts an outstanding request until dropped, so aborted requests are
/// accounted for the same way a cancelled network call would be.
struct OutstandingGuard<'a> {
    outstanding: &'a AtomicUsize,
}

impl<'a> OutstandingGuard<'a> {
    fn new(outstanding: &'a AtomicUsize, max_outstanding: &AtomicUsize) -> Self {
        let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        max_outstanding.fetch_max(now, Ordering::SeqCst);
        Self { outstanding }
    }
}

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A scripted remote backend.
///
/// Status responses are consumed front-to-back; with `repeat_last`
/// enabled, the most recent snapshot repeats once the script runs dry.
/// Records every fetch and generation request, and tracks how many status
/// queries were ever outstanding at once.
#[derive(Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<ScriptEntry>>,
    last_snapshot: Mutex<Option<RemoteSnapshot>>,
    repeat_last: AtomicBool,
    fetch_delay_ms: AtomicU64,
    fetch_count: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
    generation_requests: Mutex<Vec<(String, PipelineStage)>>,
    fail_generation_requests: AtomicBool,
}

impl MockBackend {
    /// Creates an empty mock backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a status snapshot.
    pub fn push_snapshot(&self, snapshot: RemoteSnapshot) {
        self.script
            .lock()
            .push_back(ScriptEntry::Snapshot(snapshot));
    }

    /// Queues a transient status-query failure.
    pub fn push_error(&self, message: impl Into<String>) {
        self.script
            .lock()
            .push_back(ScriptEntry::Error(message.into()));
    }

    /// Repeats the last returned snapshot once the script is exhausted.
    pub fn set_repeat_last(&self, repeat: bool) {
        self.repeat_last.store(repeat, Ordering::SeqCst);
    }

    /// Adds an artificial latency to each status query.
    pub fn set_fetch_delay_ms(&self, delay: u64) {
        self.fetch_delay_ms.store(delay, Ordering::SeqCst);
    }

    /// Makes generation requests fail with a transport error.
    pub fn set_fail_generation_requests(&self, fail: bool) {
        self.fail_generation_requests.store(fail, Ordering::SeqCst);
    }

    /// Total status queries issued.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// The most status queries ever outstanding at once.
    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    /// Every generation request received, in order.
    #[must_use]
    pub fn generation_requests(&self) -> Vec<(String, PipelineStage)> {
        self.generation_requests.lock().clone()
    }
}

#[async_trait]
impl StatusSource for MockBackend {
    async fn fetch_status(&self, _session_id: &str) -> Result<RemoteSnapshot, SyncError> {
        let _guard = OutstandingGuard::new(&self.outstanding, &self.max_outstanding);
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let entry = self.script.lock().pop_front();
        match entry {
            Some(ScriptEntry::Snapshot(snapshot)) => {
                *self.last_snapshot.lock() = Some(snapshot.clone());
                Ok(snapshot)
            }
            Some(ScriptEntry::Error(message)) => Err(SyncError::TransientTransport(message)),
            None => {
                if self.repeat_last.load(Ordering::SeqCst) {
                    if let Some(snapshot) = self.last_snapshot.lock().clone() {
                        return Ok(snapshot);
                    }
                }
                Err(SyncError::TransientTransport(
                    "mock status script exhausted".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn request_stage_generation(
        &self,
        session_id: &str,
        stage: PipelineStage,
    ) -> Result<(), SyncError> {
        if self.fail_generation_requests.load(Ordering::SeqCst) {
            return Err(SyncError::TransientTransport(
                "mock generation request failed".to_string(),
            ));
        }
        self.generation_requests
            .lock()
            .push((session_id.to_string(), stage));
        Ok(())
    }
}

enum InboundFrame {
    Frame(ChannelMessage),
    Error(String),
}

struct ConnState {
    inbound: VecDeque<InboundFrame>,
    closed: bool,
    sent: Vec<ChannelMessage>,
    auto_pong: bool,
    fail_sends: bool,
}

struct ConnInner {
    state: Mutex<ConnState>,
    notify: Notify,
}

impl ConnInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnState {
                inbound: VecDeque::new(),
                closed: false,
                sent: Vec::new(),
                auto_pong: false,
                fail_sends: false,
            }),
            notify: Notify::new(),
        })
    }
}

/// Test-side controller for one scripted connection.
///
/// Cloneable; feeds inbound frames and inspects what the channel sent.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ConnInner>,
}

impl ConnectionController {
    /// Answers every ping with a pong automatically.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.state.lock().auto_pong = enabled;
    }

    /// Makes subsequent sends fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.state.lock().fail_sends = fail;
    }

    /// Queues an inbound frame for the channel to receive.
    pub fn push_frame(&self, message: ChannelMessage) {
        self.inner.state.lock().inbound.push_back(InboundFrame::Frame(message));
        self.inner.notify.notify_one();
    }

    /// Queues an inbound transport error.
    pub fn push_error(&self, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .inbound
            .push_back(InboundFrame::Error(message.into()));
        self.inner.notify.notify_one();
    }

    /// Simulates the remote closing the connection.
    pub fn close_remote(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_one();
    }

    /// Everything the channel sent over this connection, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.inner.state.lock().sent.clone()
    }

    /// True once either side closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

struct ScriptedConnection {
    inner: Arc<ConnInner>,
}

#[async_trait]
impl MessageConnection for ScriptedConnection {
    async fn send(&mut self, message: ChannelMessage) -> Result<(), SyncError> {
        let mut state = self.inner.state.lock();
        if state.fail_sends {
            return Err(SyncError::TransientTransport(
                "mock send failure".to_string(),
            ));
        }
        if state.closed {
            return Err(SyncError::TransientTransport(
                "connection closed".to_string(),
            ));
        }
        let is_ping = message.message_type == crate::realtime::TYPE_PING;
        let session_id = message.session_id.clone();
        state.sent.push(message);
        if is_ping && state.auto_pong {
            state
                .inbound
                .push_back(InboundFrame::Frame(ChannelMessage::pong(session_id)));
            self.inner.notify.notify_one();
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ChannelMessage>, SyncError> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(frame) = state.inbound.pop_front() {
                    return match frame {
                        InboundFrame::Frame(message) => Ok(Some(message)),
                        InboundFrame::Error(message) => {
                            Err(SyncError::TransientTransport(message))
                        }
                    };
                }
                if state.closed {
                    return Ok(None);
                }
            }
            self.inner.notify.notified().await;
        }
    }

    async fn close(&mut self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_one();
    }
}

enum TransportScript {
    Connection(Arc<ConnInner>),
    Failure(String),
}

/// A scripted transport factory.
///
/// Scripted connections and failures are consumed in order; once the
/// script runs dry every connect fails, which models an endpoint that
/// went away.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<VecDeque<TransportScript>>,
    connect_count: AtomicUsize,
}

impl MockTransport {
    /// Creates an empty mock transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a successful connection and returns its controller.
    pub fn push_connection(&self) -> ConnectionController {
        let inner = ConnInner::new();
        self.scripts
            .lock()
            .push_back(TransportScript::Connection(inner.clone()));
        ConnectionController { inner }
    }

    /// Scripts a failed connection attempt.
    pub fn push_connect_failure(&self, message: impl Into<String>) {
        self.scripts
            .lock()
            .push_back(TransportScript::Failure(message.into()));
    }

    /// Total connection attempts observed.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn connect(&self, _endpoint: &str) -> Result<Box<dyn MessageConnection>, SyncError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front();
        match script {
            Some(TransportScript::Connection(inner)) => {
                Ok(Box::new(ScriptedConnection { inner }))
            }
            Some(TransportScript::Failure(message)) => {
                Err(SyncError::TransientTransport(message))
            }
            None => Err(SyncError::TransientTransport(
                "no scripted connection available".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_script_order() {
        let backend = MockBackend::new();
        backend.push_snapshot(RemoteSnapshot::new("outline_generating"));
        backend.push_error("boom");
        backend.push_snapshot(RemoteSnapshot::new("outline_generated"));

        assert_eq!(
            backend.fetch_status("s1").await.unwrap().status_token,
            "outline_generating"
        );
        assert!(backend.fetch_status("s1").await.is_err());
        assert_eq!(
            backend.fetch_status("s1").await.unwrap().status_token,
            "outline_generated"
        );
        assert_eq!(backend.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_backend_repeat_last() {
        let backend = MockBackend::new();
        backend.push_snapshot(RemoteSnapshot::new("scenes_generating"));
        backend.set_repeat_last(true);

        for _ in 0..3 {
            assert_eq!(
                backend.fetch_status("s1").await.unwrap().status_token,
                "scenes_generating"
            );
        }
    }

    #[tokio::test]
    async fn test_scripted_connection_round_trip() {
        let transport = MockTransport::new();
        let ctrl = transport.push_connection();
        let mut conn = transport.connect("ws://test").await.unwrap();

        conn.send(ChannelMessage::new("progress", "s1")).await.unwrap();
        assert_eq!(ctrl.sent().len(), 1);

        ctrl.push_frame(ChannelMessage::new("progress", "s1"));
        let received = conn.recv().await.unwrap().unwrap();
        assert_eq!(received.message_type, "progress");

        ctrl.close_remote();
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_auto_pong() {
        let transport = MockTransport::new();
        let ctrl = transport.push_connection();
        ctrl.set_auto_pong(true);
        let mut conn = transport.connect("ws://test").await.unwrap();

        conn.send(ChannelMessage::ping("s1")).await.unwrap();
        let pong = conn.recv().await.unwrap().unwrap();
        assert_eq!(pong.message_type, crate::realtime::TYPE_PONG);
    }

    #[tokio::test]
    async fn test_transport_script_exhaustion() {
        let transport = MockTransport::new();
        transport.push_connect_failure("refused");
        assert!(transport.connect("ws://test").await.is_err());
        assert!(transport.connect("ws://test").await.is_err());
        assert_eq!(transport.connect_count(), 2);
    }
}
