//! Exactly-once interview completion.
//!
//! Three triggers race to finish an interview: the AI's finish tool call,
//! the candidate ending it, and the timeout watchdog. All of them funnel
//! through [`CompletionCoordinator::complete`], which flips the interview
//! with a compare-and-set and writes the `interview.complete` event to the
//! outbox in the same transaction. Only the winning caller emits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

use intake_core::events::JobEvent;
use intake_core::types::{
    CancelReason, CompletionReason, ConversationMessage, ConversationStatus, InterviewStatus,
    ResponseId, Sender, Timestamp,
};
use intake_storage::{conversations, interviews, Connection, Database, MessageStore, PermanentStore};

use crate::dispatch::enqueue_durable;
use crate::error::ChatError;
use crate::state_machine::{conversation_status_for, validate_interview_transition};

/// What a completion or cancellation call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    /// The interview was already terminal; nothing was written.
    pub already_completed: bool,
    /// Interview status after the call.
    pub status: InterviewStatus,
}

pub struct CompletionCoordinator {
    db: Arc<Database>,
    relay_waker: Option<Arc<Notify>>,
}

impl CompletionCoordinator {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            relay_waker: None,
        }
    }

    /// Nudge the outbox relay after a completion commits instead of
    /// waiting for its next poll.
    pub fn with_relay_waker(mut self, waker: Arc<Notify>) -> Self {
        self.relay_waker = Some(waker);
        self
    }

    /// Complete the interview for a response.
    ///
    /// `transcript` overrides the transcript built from the stored
    /// conversation. Calling this on an already terminal interview is a
    /// no-op that reports `already_completed`.
    pub fn complete(
        &self,
        response_id: &ResponseId,
        reason: CompletionReason,
        transcript: Option<String>,
        now: Timestamp,
    ) -> Result<CompletionOutcome, ChatError> {
        let outcome = self.db.with_tx(|tx| {
            let Some(session) = interviews::latest_interview(tx, response_id)? else {
                return Err(ChatError::SessionNotFound(response_id.clone()));
            };
            if session.status.is_terminal() {
                return Ok(CompletionOutcome {
                    already_completed: true,
                    status: session.status,
                });
            }
            validate_interview_transition(session.status, InterviewStatus::Completed)?;

            if !interviews::finish_interview(
                tx,
                &session.id,
                InterviewStatus::Completed,
                reason.as_str(),
                now,
            )? {
                return Ok(CompletionOutcome {
                    already_completed: true,
                    status: InterviewStatus::Completed,
                });
            }

            let (transcript, question_count) =
                close_conversation(tx, response_id, InterviewStatus::Completed, transcript)?;

            enqueue_durable(
                tx,
                &JobEvent::InterviewComplete {
                    response_id: response_id.clone(),
                    transcript,
                    reason: reason.as_str().to_string(),
                    question_count,
                },
                now,
            )?;

            Ok::<_, ChatError>(CompletionOutcome {
                already_completed: false,
                status: InterviewStatus::Completed,
            })
        })?;

        if outcome.already_completed {
            debug!(response_id = %response_id, reason = reason.as_str(), "Interview already finished");
        } else {
            info!(response_id = %response_id, reason = reason.as_str(), "Interview completed");
            if let Some(waker) = &self.relay_waker {
                waker.notify_one();
            }
        }
        Ok(outcome)
    }

    /// Cancel the interview for a response. No completion event is emitted.
    pub fn cancel(
        &self,
        response_id: &ResponseId,
        reason: CancelReason,
        now: Timestamp,
    ) -> Result<CompletionOutcome, ChatError> {
        let outcome = self.db.with_tx(|tx| {
            let Some(session) = interviews::latest_interview(tx, response_id)? else {
                return Err(ChatError::SessionNotFound(response_id.clone()));
            };
            if session.status.is_terminal() {
                return Ok(CompletionOutcome {
                    already_completed: true,
                    status: session.status,
                });
            }
            validate_interview_transition(session.status, InterviewStatus::Cancelled)?;

            if !interviews::finish_interview(
                tx,
                &session.id,
                InterviewStatus::Cancelled,
                reason.as_str(),
                now,
            )? {
                let current = interviews::latest_interview(tx, response_id)?
                    .map(|s| s.status)
                    .unwrap_or(InterviewStatus::Cancelled);
                return Ok(CompletionOutcome {
                    already_completed: true,
                    status: current,
                });
            }
            close_conversation(tx, response_id, InterviewStatus::Cancelled, None)?;

            Ok::<_, ChatError>(CompletionOutcome {
                already_completed: false,
                status: InterviewStatus::Cancelled,
            })
        })?;

        if !outcome.already_completed {
            info!(response_id = %response_id, reason = reason.as_str(), "Interview cancelled");
        }
        Ok(outcome)
    }
}

/// Mirror the interview's terminal state onto the conversation and
/// collect the transcript and question count for the completion event.
fn close_conversation(
    tx: &Connection,
    response_id: &ResponseId,
    status: InterviewStatus,
    transcript: Option<String>,
) -> Result<(String, u32), ChatError> {
    let Some(conversation) = conversations::find_conversation_by_response(tx, response_id)? else {
        return Ok((transcript.unwrap_or_default(), 0));
    };

    if conversation.status == ConversationStatus::Active {
        conversations::transition_conversation(
            tx,
            &conversation.id,
            ConversationStatus::Active,
            conversation_status_for(status),
        )?;
    }

    let transcript = match transcript {
        Some(t) => t,
        None => format_transcript(&PermanentStore.list(tx, &conversation.id)?),
    };
    let questions = PermanentStore.count_by_sender(tx, &conversation.id, Sender::Bot)?;
    Ok((transcript, u32::try_from(questions).unwrap_or(u32::MAX)))
}

/// Render a conversation as `sender: text` lines.
///
/// Voice notes without a transcript are shown as a placeholder.
pub fn format_transcript(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let text = m.effective_text().unwrap_or("[voice message]");
            format!("{}: {}", m.message.sender.as_str(), text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
