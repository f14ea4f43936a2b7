//! Error types for the conversation pipeline.

use uuid::Uuid;

use intake_core::error::IntakeError;
use intake_core::types::ResponseId;

use crate::replies::ScriptedReply;

/// Errors from identification, migration, orchestration and completion.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("pin not found")]
    PinNotFound,
    #[error("pin expired")]
    PinExpired,
    #[error("conflicting identity: {0}")]
    ConflictingIdentity(String),
    #[error("response not found: {0}")]
    ResponseNotFound(ResponseId),
    #[error("no interview session for response {0}")]
    SessionNotFound(ResponseId),
    #[error("conversation not found: {0}")]
    ConversationNotFound(Uuid),
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(String, String),
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("rate limited, retry after {0} seconds")]
    RateLimited(u64),
    #[error("job bus error: {0}")]
    JobBus(String),
    #[error("responder error: {0}")]
    Responder(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    /// Whether this error is an identification failure.
    ///
    /// All of these collapse to the same participant-facing reply so the
    /// reply does not reveal which pins exist.
    pub fn is_identity_failure(&self) -> bool {
        matches!(
            self,
            ChatError::PinNotFound
                | ChatError::PinExpired
                | ChatError::ConflictingIdentity(_)
                | ChatError::ResponseNotFound(_)
        )
    }

    /// The canned reply a participant sees for this error.
    pub fn scripted_reply(&self) -> ScriptedReply {
        match self {
            e if e.is_identity_failure() => ScriptedReply::NotRecognized,
            ChatError::InvalidTransition(..) | ChatError::SessionNotFound(_) => {
                ScriptedReply::ConversationClosed
            }
            ChatError::EmptyMessage => ScriptedReply::ResendAsText,
            ChatError::MessageTooLong(_) => ScriptedReply::MessageTooLong,
            ChatError::RateLimited(_) => ScriptedReply::SlowDown,
            _ => ScriptedReply::TemporarilyUnavailable,
        }
    }
}

impl From<IntakeError> for ChatError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::JobBus(msg) => ChatError::JobBus(msg),
            other => ChatError::Storage(other.to_string()),
        }
    }
}
