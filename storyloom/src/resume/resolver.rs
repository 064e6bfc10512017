//! Token classification and snapshot resolution.

use super::RemoteSnapshot;
use crate::core::{ErrorInfo, PipelineStage, SessionState, StageStatus};
use crate::errors::ErrorClass;
use crate::machine::StageEvent;
use std::collections::HashMap;

/// The classification of a remote status token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    /// The token maps to a stage and status.
    Classified {
        /// The stage the remote is positioned at.
        stage: PipelineStage,
        /// The status of that stage.
        status: StageStatus,
    },
    /// The token is not in the vocabulary. The caller must keep polling
    /// and must not change displayed state.
    Unknown,
}

/// Classifies a remote status token.
///
/// The table is fixed and total: every token the remote system emits maps
/// to exactly one (stage, status) pair, and anything else maps to
/// [`TokenClass::Unknown`]. Failure tokens map to `Failed` on their stage,
/// never to `Unknown`.
#[must_use]
pub fn classify_token(token: &str) -> TokenClass {
    use PipelineStage as S;
    use StageStatus as St;

    let classified = |stage, status| TokenClass::Classified { stage, status };
    match token {
        // A session that exists remotely but has not begun generating.
        "created" => classified(S::Outline, St::NotStarted),

        "outline_generating" => classified(S::Outline, St::Generating),
        "outline_generated" => classified(S::Outline, St::Ready),
        "outline_failed" => classified(S::Outline, St::Failed),

        "characters_generating" => classified(S::Characters, St::Generating),
        "characters_generated" => classified(S::Characters, St::Ready),
        "characters_failed" => classified(S::Characters, St::Failed),

        "scenes_generating" => classified(S::Scenes, St::Generating),
        "scenes_generated" => classified(S::Scenes, St::Ready),
        "scenes_failed" => classified(S::Scenes, St::Failed),

        "storyboard_generating" => classified(S::Storyboard, St::Generating),
        "storyboard_generated" => classified(S::Storyboard, St::Ready),
        "storyboard_failed" => classified(S::Storyboard, St::Failed),

        "artifact_generating" => classified(S::Artifact, St::Generating),
        "artifact_generated" => classified(S::Artifact, St::Ready),
        "artifact_failed" => classified(S::Artifact, St::Failed),

        "completed" => classified(S::Artifact, St::Confirmed),

        _ => TokenClass::Unknown,
    }
}

/// The outcome of resolving a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The snapshot maps onto a session state; apply the event.
    Resume(StageEvent),
    /// The status token is outside the vocabulary; keep polling and leave
    /// displayed state untouched.
    Unknown {
        /// The unrecognized token.
        token: String,
    },
}

/// Resolves a remote snapshot into a `ResumeTo` event.
///
/// Repair rules for partial snapshots:
/// - stages strictly before the classified active stage are forced
///   `Confirmed`, even if the snapshot only reported the current stage;
/// - stages whose payload is present are raised to at least `Ready` (the
///   rank ordering never demotes a status);
/// - stages strictly after the active stage stay `NotStarted`; payloads
///   reported for them are retained but do not advance status.
///
/// Pure and idempotent: the same snapshot always produces the same event.
/// No clocks or counters participate in the mapping.
#[must_use]
pub fn resolve(snapshot: &RemoteSnapshot) -> Resolution {
    let TokenClass::Classified {
        stage: active_stage,
        status: active_status,
    } = classify_token(&snapshot.status_token)
    else {
        return Resolution::Unknown {
            token: snapshot.status_token.clone(),
        };
    };

    let mut statuses: HashMap<PipelineStage, StageStatus> = PipelineStage::ALL
        .into_iter()
        .map(|stage| {
            let status = if stage < active_stage {
                StageStatus::Confirmed
            } else if stage == active_stage {
                active_status
            } else {
                StageStatus::NotStarted
            };
            (stage, status)
        })
        .collect();

    for stage in snapshot.payloads.keys().copied() {
        if stage > active_stage {
            continue;
        }
        let current = statuses.get(&stage).copied().unwrap_or_default();
        if !current.at_least(StageStatus::Ready) && current != StageStatus::Failed {
            statuses.insert(stage, StageStatus::Ready);
        }
    }

    let last_error = if active_status == StageStatus::Failed {
        let message = snapshot
            .error_detail
            .clone()
            .unwrap_or_else(|| "remote reported generation failure".to_string());
        Some(
            ErrorInfo::new(ErrorClass::RemotePermanentFailure, message)
                .with_stage(active_stage),
        )
    } else {
        None
    };

    Resolution::Resume(StageEvent::ResumeTo {
        active_stage,
        statuses,
        payloads: snapshot.payloads.clone(),
        last_error,
    })
}

/// Applies a resolution to a fresh session, returning the resulting state.
///
/// Convenience used by tests and callers that want the state without going
/// through a coordinator.
#[must_use]
pub fn resolved_state(session_id: &str, snapshot: &RemoteSnapshot) -> Option<SessionState> {
    match resolve(snapshot) {
        Resolution::Resume(event) => {
            let base = SessionState::new(session_id);
            Some(crate::machine::transition(&base, &event).state)
        }
        Resolution::Unknown { .. } => None,
    }
}
