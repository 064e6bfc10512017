//! The external generation service, seen from the engine.

use crate::core::PipelineStage;
use crate::errors::SyncError;
use crate::polling::StatusSource;
use async_trait::async_trait;

/// The remote collaborator that generates stage content.
///
/// Extends [`StatusSource`] with the stage-advance command. The command is
/// fire-and-forget from the coordinator's perspective: its return value
/// only acknowledges receipt, and completion is observed via polling or
/// the realtime channel.
#[async_trait]
pub trait GenerationBackend: StatusSource {
    /// Asks the remote to begin generating a stage.
    ///
    /// # Errors
    ///
    /// Returns a classified [`SyncError`] if the command was not received.
    async fn request_stage_generation(
        &self,
        session_id: &str,
        stage: PipelineStage,
    ) -> Result<(), SyncError>;
}
