//! The abstract remote status query.

use crate::errors::SyncError;
use crate::resume::RemoteSnapshot;
use async_trait::async_trait;

/// An idempotent read of a session's remote status.
///
/// Implementations must be safe to call repeatedly; the scheduler applies
/// its own request deadline around each call.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetches the current status snapshot for a session.
    ///
    /// # Errors
    ///
    /// Returns a classified [`SyncError`] on transport or protocol
    /// failure.
    async fn fetch_status(&self, session_id: &str) -> Result<RemoteSnapshot, SyncError>;
}
