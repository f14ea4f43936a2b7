//! Conversation and interview state machines with validated transitions.
//!
//! Both lifecycles share one shape:
//! Active -> Active (message appended)
//! Active -> Completed
//! Active -> Cancelled
//!
//! Completed and Cancelled are terminal and reject every transition.

use intake_core::types::{ConversationStatus, InterviewStatus};

use crate::error::ChatError;

/// Validate a conversation status transition.
pub fn validate_transition(
    from: ConversationStatus,
    to: ConversationStatus,
) -> Result<(), ChatError> {
    let valid = matches!(
        (from, to),
        (ConversationStatus::Active, ConversationStatus::Active)
            | (ConversationStatus::Active, ConversationStatus::Completed)
            | (ConversationStatus::Active, ConversationStatus::Cancelled)
    );

    if valid {
        Ok(())
    } else {
        Err(ChatError::InvalidTransition(
            from.as_str().to_string(),
            to.as_str().to_string(),
        ))
    }
}

/// Validate an interview status transition. Interviews never re-enter
/// Active, so `Active -> Active` is rejected here.
pub fn validate_interview_transition(
    from: InterviewStatus,
    to: InterviewStatus,
) -> Result<(), ChatError> {
    let valid = matches!(
        (from, to),
        (InterviewStatus::Active, InterviewStatus::Completed)
            | (InterviewStatus::Active, InterviewStatus::Cancelled)
    );

    if valid {
        Ok(())
    } else {
        Err(ChatError::InvalidTransition(
            from.as_str().to_string(),
            to.as_str().to_string(),
        ))
    }
}

/// The conversation status that mirrors a terminal interview status.
pub fn conversation_status_for(status: InterviewStatus) -> ConversationStatus {
    match status {
        InterviewStatus::Active => ConversationStatus::Active,
        InterviewStatus::Completed => ConversationStatus::Completed,
        InterviewStatus::Cancelled => ConversationStatus::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =====================================================================
    // Valid transitions
    // =====================================================================

    #[test]
    fn test_active_to_active() {
        assert!(validate_transition(ConversationStatus::Active, ConversationStatus::Active).is_ok());
    }

    #[test]
    fn test_active_to_completed() {
        assert!(
            validate_transition(ConversationStatus::Active, ConversationStatus::Completed).is_ok()
        );
        assert!(
            validate_interview_transition(InterviewStatus::Active, InterviewStatus::Completed)
                .is_ok()
        );
    }

    #[test]
    fn test_active_to_cancelled() {
        assert!(
            validate_transition(ConversationStatus::Active, ConversationStatus::Cancelled).is_ok()
        );
        assert!(
            validate_interview_transition(InterviewStatus::Active, InterviewStatus::Cancelled)
                .is_ok()
        );
    }

    // =====================================================================
    // Invalid transitions
    // =====================================================================

    #[test]
    fn test_terminal_states_reject_everything() {
        let all = [
            ConversationStatus::Active,
            ConversationStatus::Completed,
            ConversationStatus::Cancelled,
        ];
        for from in [ConversationStatus::Completed, ConversationStatus::Cancelled] {
            for to in all {
                let err = validate_transition(from, to).unwrap_err();
                assert!(matches!(err, ChatError::InvalidTransition(_, _)));
            }
        }
    }

    #[test]
    fn test_interview_cannot_restart() {
        assert!(
            validate_interview_transition(InterviewStatus::Active, InterviewStatus::Active).is_err()
        );
        assert!(
            validate_interview_transition(InterviewStatus::Completed, InterviewStatus::Cancelled)
                .is_err()
        );
        assert!(
            validate_interview_transition(InterviewStatus::Cancelled, InterviewStatus::Completed)
                .is_err()
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err =
            validate_transition(ConversationStatus::Completed, ConversationStatus::Active).unwrap_err();
        assert_eq!(err.to_string(), "Invalid state transition: completed -> active");
    }

    #[test]
    fn test_conversation_status_mirror() {
        assert_eq!(
            conversation_status_for(InterviewStatus::Cancelled),
            ConversationStatus::Cancelled
        );
        assert_eq!(
            conversation_status_for(InterviewStatus::Completed),
            ConversationStatus::Completed
        );
    }
}
