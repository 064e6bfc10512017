//! Engine-wide configuration.

use crate::polling::PollConfig;
use crate::realtime::ChannelConfig;
use serde::{Deserialize, Serialize};

/// Tunables for the synchronization engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Polling behavior.
    pub poll: PollConfig,
    /// Realtime channel behavior.
    pub channel: ChannelConfig,
    /// Endpoint for the realtime progress channel.
    pub realtime_endpoint: String,
    /// Whether to open the realtime channel at all. Polling alone is
    /// sufficient; the channel is redundant, not depended on.
    pub realtime_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            channel: ChannelConfig::default(),
            realtime_endpoint: "ws://localhost:8700/progress".to_string(),
            realtime_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Creates a new engine config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the polling configuration.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the channel configuration.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the realtime endpoint.
    #[must_use]
    pub fn with_realtime_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.realtime_endpoint = endpoint.into();
        self
    }

    /// Enables or disables the realtime channel.
    #[must_use]
    pub fn with_realtime_enabled(mut self, enabled: bool) -> Self {
        self.realtime_enabled = enabled;
        self
    }
}
