//! The transition function.

use super::StageEvent;
use crate::core::{PipelineStage, SessionState, StageStatus};

/// A side effect requested by a transition.
///
/// Effects describe what happened so the coordinator can react (start or
/// cancel watches, notify subscribers) without the machine performing any
/// IO itself.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionEffect {
    /// Generation began for the stage.
    Started(PipelineStage),
    /// The stage's payload arrived and awaits confirmation.
    Ready(PipelineStage),
    /// The stage failed.
    Failed(PipelineStage),
    /// The stage was confirmed by the user.
    Confirmed(PipelineStage),
    /// The pipeline advanced to a new active stage.
    Advanced(PipelineStage),
    /// The final stage was confirmed; the pipeline is complete.
    Completed,
    /// The whole session state was replaced from a snapshot.
    Replaced,
    /// The event was illegal in the current state and was ignored.
    Rejected {
        /// Why the event was rejected.
        reason: String,
    },
}

/// The result of applying an event to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The resulting session state.
    pub state: SessionState,
    /// Effects describing what changed.
    pub effects: Vec<TransitionEffect>,
}

impl Transition {
    fn unchanged(state: &SessionState, reason: impl Into<String>) -> Self {
        Self {
            state: state.clone(),
            effects: vec![TransitionEffect::Rejected {
                reason: reason.into(),
            }],
        }
    }

    /// Returns true if the event was applied (not rejected).
    #[must_use]
    pub fn accepted(&self) -> bool {
        !self
            .effects
            .iter()
            .any(|e| matches!(e, TransitionEffect::Rejected { .. }))
    }
}

/// Applies an event to a session state, producing the new state and the
/// effects of the transition.
///
/// Pure and total: never panics, never performs IO, and returns the input
/// state unchanged (with a `Rejected` effect) for illegal combinations.
#[must_use]
pub fn transition(state: &SessionState, event: &StageEvent) -> Transition {
    match event {
        StageEvent::StartGeneration { stage } => start_generation(state, *stage),
        StageEvent::GenerationSucceeded { stage, payload } => {
            let stage = *stage;
            if state.status_of(stage) != StageStatus::Generating {
                return Transition::unchanged(
                    state,
                    format!(
                        "generation_succeeded for {stage} but stage is {}",
                        state.status_of(stage)
                    ),
                );
            }
            let mut next = state.clone();
            next.statuses.insert(stage, StageStatus::Ready);
            next.payloads.insert(stage, payload.clone());
            Transition {
                state: next,
                effects: vec![TransitionEffect::Ready(stage)],
            }
        }
        StageEvent::GenerationFailed { stage, error } => {
            let stage = *stage;
            if state.status_of(stage) != StageStatus::Generating {
                return Transition::unchanged(
                    state,
                    format!(
                        "generation_failed for {stage} but stage is {}",
                        state.status_of(stage)
                    ),
                );
            }
            let mut next = state.clone();
            next.statuses.insert(stage, StageStatus::Failed);
            next.last_error = Some(error.clone());
            Transition {
                state: next,
                effects: vec![TransitionEffect::Failed(stage)],
            }
        }
        StageEvent::UserConfirmed { stage } => user_confirmed(state, *stage),
        StageEvent::ResumeTo {
            active_stage,
            statuses,
            payloads,
            last_error,
        } => {
            let mut next = SessionState::new(state.session_id.clone());
            next.active_stage = *active_stage;
            for stage in PipelineStage::ALL {
                next.statuses.insert(
                    stage,
                    statuses.get(&stage).copied().unwrap_or_default(),
                );
            }
            next.payloads = payloads.clone();
            next.last_error = last_error.clone();
            next.completed = *active_stage == PipelineStage::Artifact
                && next.status_of(PipelineStage::Artifact) == StageStatus::Confirmed;
            Transition {
                state: next,
                effects: vec![TransitionEffect::Replaced],
            }
        }
    }
}

fn start_generation(state: &SessionState, stage: PipelineStage) -> Transition {
    if state.completed {
        return Transition::unchanged(state, "pipeline already complete");
    }
    if stage != state.active_stage {
        return Transition::unchanged(
            state,
            format!(
                "start_generation for {stage} but active stage is {}",
                state.active_stage
            ),
        );
    }
    match state.status_of(stage) {
        StageStatus::NotStarted => {
            let mut next = state.clone();
            next.statuses.insert(stage, StageStatus::Generating);
            Transition {
                state: next,
                effects: vec![TransitionEffect::Started(stage)],
            }
        }
        // Explicit retry intent: a failed active stage may be restarted,
        // clearing the recorded error.
        StageStatus::Failed => {
            let mut next = state.clone();
            next.statuses.insert(stage, StageStatus::Generating);
            next.last_error = None;
            Transition {
                state: next,
                effects: vec![TransitionEffect::Started(stage)],
            }
        }
        other => Transition::unchanged(
            state,
            format!("start_generation for {stage} but stage is {other}"),
        ),
    }
}

fn user_confirmed(state: &SessionState, stage: PipelineStage) -> Transition {
    if state.status_of(stage) != StageStatus::Ready {
        return Transition::unchanged(
            state,
            format!(
                "user_confirmed for {stage} but stage is {}",
                state.status_of(stage)
            ),
        );
    }
    let mut next = state.clone();
    next.statuses.insert(stage, StageStatus::Confirmed);
    let mut effects = vec![TransitionEffect::Confirmed(stage)];
    match stage.next() {
        Some(following) => {
            next.active_stage = following;
            effects.push(TransitionEffect::Advanced(following));
        }
        None => {
            next.completed = true;
            effects.push(TransitionEffect::Completed);
        }
    }
    Transition {
        state: next,
        effects,
    }
}
