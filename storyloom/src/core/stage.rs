//! The ordered pipeline stage enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One ordered phase of the generation pipeline.
///
/// The derived `Ord` defines legal forward progression: no stage may be
/// entered before its predecessor's payload exists, except via explicit
/// resumption.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// The user-provided seed concept. Never remotely generated.
    Input,
    /// The story outline.
    Outline,
    /// The character set.
    Characters,
    /// The scene set.
    Scenes,
    /// The storyboard shot list.
    Storyboard,
    /// The final rendered artifact.
    Artifact,
}

impl PipelineStage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 6] = [
        Self::Input,
        Self::Outline,
        Self::Characters,
        Self::Scenes,
        Self::Storyboard,
        Self::Artifact,
    ];

    /// Returns the next stage in the total order, or `None` at the end.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Input => Some(Self::Outline),
            Self::Outline => Some(Self::Characters),
            Self::Characters => Some(Self::Scenes),
            Self::Scenes => Some(Self::Storyboard),
            Self::Storyboard => Some(Self::Artifact),
            Self::Artifact => None,
        }
    }

    /// Returns the previous stage in the total order, or `None` at the start.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self {
            Self::Input => None,
            Self::Outline => Some(Self::Input),
            Self::Characters => Some(Self::Outline),
            Self::Scenes => Some(Self::Characters),
            Self::Storyboard => Some(Self::Scenes),
            Self::Artifact => Some(Self::Storyboard),
        }
    }

    /// Returns true if this is the last stage of the pipeline.
    #[must_use]
    pub const fn is_last(self) -> bool {
        matches!(self, Self::Artifact)
    }

    /// Returns true if this stage is produced by the remote generator.
    ///
    /// `Input` holds the user seed and is never remotely generated.
    #[must_use]
    pub const fn is_generated(self) -> bool {
        !matches!(self, Self::Input)
    }

    /// The stage name as it appears inside remote status tokens.
    #[must_use]
    pub const fn token_name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Outline => "outline",
            Self::Characters => "characters",
            Self::Scenes => "scenes",
            Self::Storyboard => "storyboard",
            Self::Artifact => "artifact",
        }
    }

    /// Parses a stage from its token name.
    #[must_use]
    pub fn from_token_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.token_name() == name)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token_name())
    }
}
