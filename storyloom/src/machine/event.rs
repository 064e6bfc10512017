//! Events accepted by the stage state machine.

use crate::core::{ErrorInfo, PipelineStage, StagePayload, StageStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event driving the stage state machine.
///
/// Poll results, realtime progress messages, and user intents are all
/// normalized into this vocabulary before they touch session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    /// Begin generating the given stage.
    StartGeneration {
        /// The stage to generate.
        stage: PipelineStage,
    },
    /// The remote generator produced a payload for the stage.
    GenerationSucceeded {
        /// The stage that finished.
        stage: PipelineStage,
        /// The produced content.
        payload: StagePayload,
    },
    /// The remote generator failed the stage.
    GenerationFailed {
        /// The stage that failed.
        stage: PipelineStage,
        /// The classified error.
        error: ErrorInfo,
    },
    /// The user accepted the stage's payload.
    UserConfirmed {
        /// The stage being confirmed.
        stage: PipelineStage,
    },
    /// Bulk replacement of session state from a resumption snapshot.
    ///
    /// This is the single sanctioned back-door for non-incremental state
    /// change, used only by the resumption resolver.
    ResumeTo {
        /// The stage the session is positioned at.
        active_stage: PipelineStage,
        /// Per-stage statuses.
        statuses: HashMap<PipelineStage, StageStatus>,
        /// Per-stage payloads reported by the snapshot.
        payloads: HashMap<PipelineStage, StagePayload>,
        /// The reconstructed last error, if the snapshot reported one.
        last_error: Option<ErrorInfo>,
    },
}

impl StageEvent {
    /// A short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartGeneration { .. } => "start_generation",
            Self::GenerationSucceeded { .. } => "generation_succeeded",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::UserConfirmed { .. } => "user_confirmed",
            Self::ResumeTo { .. } => "resume_to",
        }
    }

    /// The stage the event concerns, if it is stage-scoped.
    #[must_use]
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            Self::StartGeneration { stage }
            | Self::GenerationSucceeded { stage, .. }
            | Self::GenerationFailed { stage, .. }
            | Self::UserConfirmed { stage } => Some(*stage),
            Self::ResumeTo { .. } => None,
        }
    }
}
