//! Connection state for the realtime channel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The coarse phase of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No connection is established.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection is established and heartbeating.
    Connected,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Observable state of the realtime channel.
///
/// Lifecycle is independent from session state: a session can exist with
/// the channel disconnected, in which case it falls back to polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// The current phase.
    pub phase: ConnectionPhase,
    /// True once the reconnect budget is exhausted or the channel was
    /// explicitly torn down; no further attempts will be scheduled.
    pub terminal: bool,
    /// The reconnection attempt counter.
    pub reconnect_attempt: usize,
    /// When the last heartbeat response was observed (ISO 8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<String>,
}

impl ConnectionState {
    /// The initial, not-yet-connected state.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            terminal: false,
            reconnect_attempt: 0,
            last_heartbeat_at: None,
        }
    }

    /// Returns true if the channel is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Returns true if the channel has given up and will not reconnect.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase == ConnectionPhase::Disconnected && self.terminal
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected()
    }
}
