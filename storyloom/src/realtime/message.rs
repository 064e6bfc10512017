//! The push channel message schema.

use serde::{Deserialize, Serialize};

/// Reserved heartbeat request type. Never dispatched to subscribers.
pub const TYPE_PING: &str = "ping";
/// Reserved heartbeat response type. Never dispatched to subscribers.
pub const TYPE_PONG: &str = "pong";
/// Stage status change notification.
pub const TYPE_PROGRESS: &str = "progress";

/// A framed message on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// The message type. `ping` and `pong` are reserved for heartbeats.
    #[serde(rename = "type")]
    pub message_type: String,
    /// The session the message concerns.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// The stage the message concerns, if stage-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Message payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ChannelMessage {
    /// Creates a message of the given type.
    #[must_use]
    pub fn new(message_type: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            session_id: session_id.into(),
            stage: None,
            payload: None,
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Creates a heartbeat ping.
    #[must_use]
    pub fn ping(session_id: impl Into<String>) -> Self {
        Self::new(TYPE_PING, session_id)
    }

    /// Creates a heartbeat pong.
    #[must_use]
    pub fn pong(session_id: impl Into<String>) -> Self {
        Self::new(TYPE_PONG, session_id)
    }

    /// Returns true for the reserved heartbeat types.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.message_type == TYPE_PING || self.message_type == TYPE_PONG
    }
}
