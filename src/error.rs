use thiserror::Error;

use crate::room::{ParticipantId, RoomId};

/// Failures of the local media capability (camera / microphone).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("camera/mic is in use by another application")]
    NotReadable,

    #[error("please allow camera/microphone access")]
    NotAllowed,

    #[error("no camera/microphone found")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("not authorized: {0}")]
    NotAuthorized(&'static str),

    #[error("invalid signaling target: {0}")]
    InvalidTarget(ParticipantId),

    #[error("{event} is not valid while the link is {state}")]
    NegotiationConflict {
        state: &'static str,
        event: &'static str,
    },

    #[error("connectivity lost with {0}")]
    ConnectivityLost(ParticipantId),

    #[error("media access failed: {0}")]
    MediaUnavailable(#[from] MediaError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl SignalError {
    /// Stable code sent to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            SignalError::NotAuthorized(_) => "NOT_AUTHORIZED",
            SignalError::InvalidTarget(_) => "INVALID_TARGET",
            SignalError::NegotiationConflict { .. } => "NEGOTIATION_CONFLICT",
            SignalError::ConnectivityLost(_) => "CONNECTIVITY_LOST",
            SignalError::MediaUnavailable(_) => "MEDIA_UNAVAILABLE",
            SignalError::InvalidMessage(_) => "INVALID_MESSAGE",
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_error_converts_and_keeps_reason() {
        let err: SignalError = MediaError::NotAllowed.into();
        assert_eq!(err.code(), "MEDIA_UNAVAILABLE");
        assert_eq!(
            err.to_string(),
            "media access failed: please allow camera/microphone access"
        );
    }

    #[test]
    fn conflict_names_state_and_event() {
        let err = SignalError::NegotiationConflict {
            state: "Idle",
            event: "answer",
        };
        assert_eq!(err.to_string(), "answer is not valid while the link is Idle");
    }
}
