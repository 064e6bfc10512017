//! Shared utilities: identifiers and timestamps.

mod ids;
mod timestamps;

pub use ids::generate_session_id;
pub use timestamps::{iso_timestamp, now_utc, Timestamp};
