//! Per-stage status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a single pipeline stage within a session.
///
/// At most one stage is `Generating` at a time; all stages strictly before
/// the active one are `Confirmed`, all stages strictly after are
/// `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage has not begun.
    NotStarted,
    /// The remote generator is working on the stage.
    Generating,
    /// A payload exists and awaits user confirmation.
    Ready,
    /// The user confirmed the payload; the pipeline moved past this stage.
    Confirmed,
    /// Generation failed; requires explicit retry intent.
    Failed,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Generating => write!(f, "generating"),
            Self::Ready => write!(f, "ready"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true if no further automatic transition occurs from here.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    /// Position in the forward progression order.
    ///
    /// `Failed` sits outside the order and has no rank. The rank is used by
    /// the resumption repair rule, which raises statuses but never demotes
    /// them.
    #[must_use]
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::NotStarted => Some(0),
            Self::Generating => Some(1),
            Self::Ready => Some(2),
            Self::Confirmed => Some(3),
            Self::Failed => None,
        }
    }

    /// Returns true if `self` is at least as far along as `other`.
    ///
    /// Returns false whenever either side is `Failed`.
    #[must_use]
    pub fn at_least(&self, other: Self) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }
}
