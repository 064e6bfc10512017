//! Error types for the storyloom engine.
//!
//! The taxonomy separates errors the engine retries automatically from
//! errors that halt a stage until the user intervenes. Subsystems classify
//! transport-level failures internally; only classified errors (and the
//! state-machine events derived from them) ever reach the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The serializable classification of an error, stored in session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or timeout failure, retried per the retry policy.
    TransientTransport,
    /// The remote explicitly reported a generation failure.
    RemotePermanentFailure,
    /// Malformed snapshot or message; logged and treated as a no-op.
    ProtocolViolation,
    /// The bounded retry budget was consumed.
    ExhaustedRetries,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientTransport => write!(f, "transient_transport"),
            Self::RemotePermanentFailure => write!(f, "remote_permanent_failure"),
            Self::ProtocolViolation => write!(f, "protocol_violation"),
            Self::ExhaustedRetries => write!(f, "exhausted_retries"),
        }
    }
}

/// The main error type for synchronization operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A network or timeout failure occurred talking to the remote.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// The remote explicitly reported that generation failed.
    #[error("remote reported permanent failure: {0}")]
    RemotePermanentFailure(String),

    /// A snapshot or message violated the wire protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The bounded retry budget was consumed without success.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        /// Number of attempts made before giving up.
        attempts: usize,
        /// Description of the last error observed.
        last: String,
    },

    /// An intent was rejected because the session is not in a legal state
    /// for it (e.g. confirming a stage that is not ready).
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// An internal channel or task was torn down while in use.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Maps the error onto its classification.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientTransport(_) | Self::ChannelClosed(_) => {
                ErrorClass::TransientTransport
            }
            Self::RemotePermanentFailure(_) => ErrorClass::RemotePermanentFailure,
            Self::ProtocolViolation(_)
            | Self::IllegalTransition(_)
            | Self::Serialization(_) => ErrorClass::ProtocolViolation,
            Self::ExhaustedRetries { .. } => ErrorClass::ExhaustedRetries,
        }
    }

    /// Creates a transient transport error from a display-able source.
    pub fn transport(source: impl fmt::Display) -> Self {
        Self::TransientTransport(source.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class_display() {
        assert_eq!(
            ErrorClass::TransientTransport.to_string(),
            "transient_transport"
        );
        assert_eq!(
            ErrorClass::ExhaustedRetries.to_string(),
            "exhausted_retries"
        );
    }

    #[test]
    fn test_error_class_serialize() {
        let json = serde_json::to_string(&ErrorClass::RemotePermanentFailure).unwrap();
        assert_eq!(json, r#""remote_permanent_failure""#);
    }

    #[test]
    fn test_sync_error_classification() {
        assert_eq!(
            SyncError::TransientTransport("timeout".into()).class(),
            ErrorClass::TransientTransport
        );
        assert_eq!(
            SyncError::ChannelClosed("actor gone".into()).class(),
            ErrorClass::TransientTransport
        );
        assert_eq!(
            SyncError::RemotePermanentFailure("bad prompt".into()).class(),
            ErrorClass::RemotePermanentFailure
        );
        assert_eq!(
            SyncError::ProtocolViolation("bad token".into()).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            SyncError::ExhaustedRetries {
                attempts: 3,
                last: "timeout".into()
            }
            .class(),
            ErrorClass::ExhaustedRetries
        );
    }

    #[test]
    fn test_sync_error_messages() {
        let err = SyncError::ExhaustedRetries {
            attempts: 3,
            last: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "retries exhausted after 3 attempts: connection refused"
        );
    }

    #[test]
    fn test_from_serde_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: SyncError = parse_err.into();
        assert_eq!(err.class(), ErrorClass::ProtocolViolation);
    }
}
