//! The per-session aggregate state.

use super::{PipelineStage, StageStatus};
use crate::errors::ErrorClass;
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque per-stage content.
///
/// The engine does not interpret payload contents beyond presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    /// The stage content as reported by the remote generator.
    pub content: serde_json::Value,
    /// When the payload was observed (ISO 8601). `None` for payloads
    /// carried over from a resumption snapshot, which has no local clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
}

impl StagePayload {
    /// Creates a payload observed now.
    #[must_use]
    pub fn new(content: serde_json::Value) -> Self {
        Self {
            content,
            received_at: Some(iso_timestamp()),
        }
    }

    /// Creates a payload carried over from a snapshot, with no timestamp.
    #[must_use]
    pub fn from_snapshot(content: serde_json::Value) -> Self {
        Self {
            content,
            received_at: None,
        }
    }
}

/// Information about the most recent error affecting a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// The error classification.
    pub class: ErrorClass,
    /// The user-visible error message.
    pub message: String,
    /// The stage affected, if the error is stage-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
    /// When the error was observed (ISO 8601). `None` for errors
    /// reconstructed from a resumption snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

impl ErrorInfo {
    /// Creates an unstamped error record.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            stage: None,
            at: None,
        }
    }

    /// Sets the affected stage.
    #[must_use]
    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Stamps the record with the current time.
    #[must_use]
    pub fn stamped(mut self) -> Self {
        self.at = Some(iso_timestamp());
        self
    }
}

/// The aggregate state of one pipeline session.
///
/// Owned exclusively by the workflow coordinator and mutated only through
/// state-machine transitions, never assigned ad hoc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// The session identifier.
    pub session_id: String,
    /// The stage the pipeline is currently working through.
    pub active_stage: PipelineStage,
    /// Per-stage statuses.
    pub statuses: HashMap<PipelineStage, StageStatus>,
    /// Per-stage payloads, present once a stage has produced content.
    pub payloads: HashMap<PipelineStage, StagePayload>,
    /// The most recent error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
    /// True once the final stage has been confirmed.
    #[serde(default)]
    pub completed: bool,
}

impl SessionState {
    /// Creates a fresh session with every stage `NotStarted`.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            active_stage: PipelineStage::Input,
            statuses: PipelineStage::ALL
                .into_iter()
                .map(|s| (s, StageStatus::NotStarted))
                .collect(),
            payloads: HashMap::new(),
            last_error: None,
            completed: false,
        }
    }

    /// Creates a session seeded with user input, positioned at the first
    /// generated stage.
    ///
    /// The seed is stored as the `Input` payload and `Input` is confirmed,
    /// so a resumed or inspected session always shows its originating
    /// concept.
    #[must_use]
    pub fn with_seed(session_id: impl Into<String>, seed: serde_json::Value) -> Self {
        let mut state = Self::new(session_id);
        state.statuses.insert(PipelineStage::Input, StageStatus::Confirmed);
        state.payloads.insert(PipelineStage::Input, StagePayload::new(seed));
        state.active_stage = PipelineStage::Outline;
        state
    }

    /// Returns the status of a stage.
    #[must_use]
    pub fn status_of(&self, stage: PipelineStage) -> StageStatus {
        self.statuses.get(&stage).copied().unwrap_or_default()
    }

    /// Returns the payload of a stage, if present.
    #[must_use]
    pub fn payload_of(&self, stage: PipelineStage) -> Option<&StagePayload> {
        self.payloads.get(&stage)
    }

    /// Returns the status of the active stage.
    #[must_use]
    pub fn active_status(&self) -> StageStatus {
        self.status_of(self.active_stage)
    }

    /// Checks the structural invariants of the session.
    ///
    /// - at most one stage is `Generating`;
    /// - every stage strictly before the active one is `Confirmed`;
    /// - every stage strictly after the active one is `NotStarted`;
    /// - `completed` implies the final stage is confirmed.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        let generating = PipelineStage::ALL
            .into_iter()
            .filter(|s| self.status_of(*s) == StageStatus::Generating)
            .count();
        if generating > 1 {
            return Err(format!("{generating} stages are generating at once"));
        }

        for stage in PipelineStage::ALL {
            let status = self.status_of(stage);
            if stage < self.active_stage && status != StageStatus::Confirmed {
                return Err(format!(
                    "stage {stage} precedes active {} but is {status}",
                    self.active_stage
                ));
            }
            if stage > self.active_stage && status != StageStatus::NotStarted {
                return Err(format!(
                    "stage {stage} follows active {} but is {status}",
                    self.active_stage
                ));
            }
        }

        if self.completed
            && (self.active_stage != PipelineStage::Artifact
                || self.status_of(PipelineStage::Artifact) != StageStatus::Confirmed)
        {
            return Err("session marked complete before final confirmation".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_session_defaults() {
        let state = SessionState::new("s1");
        assert_eq!(state.session_id, "s1");
        assert_eq!(state.active_stage, PipelineStage::Input);
        for stage in PipelineStage::ALL {
            assert_eq!(state.status_of(stage), StageStatus::NotStarted);
        }
        assert!(!state.completed);
        assert!(state.last_error.is_none());
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_with_seed_positions_at_outline() {
        let state = SessionState::with_seed("s1", serde_json::json!("a sunset scene"));
        assert_eq!(state.active_stage, PipelineStage::Outline);
        assert_eq!(state.status_of(PipelineStage::Input), StageStatus::Confirmed);
        assert_eq!(
            state.payload_of(PipelineStage::Input).unwrap().content,
            serde_json::json!("a sunset scene")
        );
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_invariant_rejects_double_generating() {
        let mut state = SessionState::with_seed("s1", serde_json::json!("seed"));
        state.statuses.insert(PipelineStage::Outline, StageStatus::Generating);
        state.statuses.insert(PipelineStage::Scenes, StageStatus::Generating);
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_invariant_rejects_unconfirmed_predecessor() {
        let mut state = SessionState::new("s1");
        state.active_stage = PipelineStage::Scenes;
        state.statuses.insert(PipelineStage::Input, StageStatus::Confirmed);
        state.statuses.insert(PipelineStage::Outline, StageStatus::Ready);
        state.statuses.insert(PipelineStage::Characters, StageStatus::Confirmed);
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_invariant_rejects_started_successor() {
        let mut state = SessionState::with_seed("s1", serde_json::json!("seed"));
        state.statuses.insert(PipelineStage::Scenes, StageStatus::Ready);
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_error_info_builder() {
        let info = ErrorInfo::new(ErrorClass::TransientTransport, "timed out")
            .with_stage(PipelineStage::Outline)
            .stamped();
        assert_eq!(info.class, ErrorClass::TransientTransport);
        assert_eq!(info.stage, Some(PipelineStage::Outline));
        assert!(info.at.is_some());
    }

    #[test]
    fn test_payload_from_snapshot_is_unstamped() {
        let payload = StagePayload::from_snapshot(serde_json::json!({"a": 1}));
        assert!(payload.received_at.is_none());
        let fresh = StagePayload::new(serde_json::json!({"a": 1}));
        assert!(fresh.received_at.is_some());
    }

    #[test]
    fn test_session_state_round_trip() {
        let state = SessionState::with_seed("s1", serde_json::json!("seed"));
        let json = serde_json::to_string(&state).unwrap();
        let parsed: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
