//! Session identifier generation.

use uuid::Uuid;

/// Generates a new unique session identifier.
#[must_use]
pub fn generate_session_id() -> String {
    format!("sess-{}", Uuid::new_v4())
}
