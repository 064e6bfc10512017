//! Transport abstraction below the channel, above the socket.
//!
//! The engine only cares about framed messages; TLS and HTTP/WebSocket
//! library internals live behind these traits.

use super::ChannelMessage;
use crate::errors::SyncError;
use async_trait::async_trait;

/// An established, framed, bidirectional connection.
#[async_trait]
pub trait MessageConnection: Send {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the connection is no longer usable.
    async fn send(&mut self, message: ChannelMessage) -> Result<(), SyncError>;

    /// Receives the next message. `Ok(None)` means the remote closed the
    /// connection cleanly.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the connection fails mid-receive.
    async fn recv(&mut self) -> Result<Option<ChannelMessage>, SyncError>;

    /// Closes the connection. Idempotent.
    async fn close(&mut self);
}

/// A factory for connections to a realtime endpoint.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the endpoint is unreachable.
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn MessageConnection>, SyncError>;
}
