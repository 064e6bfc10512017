//! The remote snapshot shape.

use crate::core::{PipelineStage, StagePayload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A point-in-time report of a session's remote status.
///
/// The same shape serves the polling status query and the one-shot fetch
/// performed at resumption time. Reads of this snapshot are idempotent on
/// the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// The opaque status token.
    pub status_token: String,
    /// Payloads the remote reports as present, keyed by stage.
    #[serde(default)]
    pub payloads: HashMap<PipelineStage, StagePayload>,
    /// Detail accompanying a failure token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl RemoteSnapshot {
    /// Creates a snapshot with just a status token.
    #[must_use]
    pub fn new(status_token: impl Into<String>) -> Self {
        Self {
            status_token: status_token.into(),
            payloads: HashMap::new(),
            error_detail: None,
        }
    }

    /// Adds a stage payload.
    #[must_use]
    pub fn with_payload(mut self, stage: PipelineStage, content: serde_json::Value) -> Self {
        self.payloads
            .insert(stage, StagePayload::from_snapshot(content));
        self
    }

    /// Sets the failure detail.
    #[must_use]
    pub fn with_error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}
