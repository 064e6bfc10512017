//! The realtime push channel.
//!
//! One persistent bidirectional connection per session: heartbeats,
//! exponential-backoff reconnection, per-message-type subscriber dispatch,
//! and outbound queueing while disconnected. The channel is redundant with
//! polling, not depended on: a session keeps progressing with the channel
//! down.

mod channel;
mod message;
mod transport;

pub use channel::{ChannelConfig, ChannelHandle, RealtimeChannel, SubscriptionId};
pub use message::{ChannelMessage, TYPE_PING, TYPE_PONG, TYPE_PROGRESS};
pub use transport::{MessageConnection, MessageTransport};
