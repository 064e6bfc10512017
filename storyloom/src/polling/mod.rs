//! Polling: the redundant, always-available path for observing stage
//! completion.
//!
//! One watch loop runs per active stage. The loop issues at most one
//! status query at a time, so results arrive in request order; transient
//! query failures are retried with backoff, and exhausting the retry
//! budget surfaces as a failed stage rather than a crashed loop.

mod scheduler;
mod source;

pub use scheduler::{PollConfig, PollingScheduler, WatchHandle};
pub use source::StatusSource;
