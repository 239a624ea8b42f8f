use std::time::Duration;

use shared::domain::ConversationId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("audio capture unsupported: {0}")]
    Unsupported(String),
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("no recording in progress")]
    NotRecording,
    #[error("recording too short: {0:?}")]
    TooShort(Duration),
    #[error("recording captured no audio")]
    Empty,
    #[error("playback rejected: {0}")]
    PlaybackRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error("message for conversation {found} applied to timeline of conversation {expected}")]
    ConversationMismatch {
        expected: ConversationId,
        found: ConversationId,
    },
}
