//! Drives the AI interview on an identified conversation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use intake_core::config::{OrchestratorConfig, RateLimitConfig};
use intake_core::events::JobEvent;
use intake_core::types::{
    CompletionReason, ContentType, Conversation, ConversationMessage, ConversationStatus, Message,
    Sender,
};
use intake_storage::{conversations, Database, MessageStore, PermanentStore};

use crate::coalesce::BurstCoalescer;
use crate::completion::CompletionCoordinator;
use crate::dispatch::send_best_effort;
use crate::error::ChatError;
use crate::jobs::JobBus;
use crate::rate_limit::{Decision, RateLimiter};
use crate::replies::ScriptedReply;
use crate::responder::{AiResponder, TurnContext};
use crate::state_machine::validate_transition;

/// What the orchestrator sent back for one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorReply {
    pub conversation_id: Uuid,
    pub text: String,
    /// Stored bot message id. `None` for scripted replies, which are not
    /// part of the interview record.
    pub message_id: Option<Uuid>,
    pub scripted: Option<ScriptedReply>,
    /// The AI finished the interview on this turn.
    pub finished: bool,
}

/// Result of an asynchronous transcription job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TranscriptOutcome {
    Transcribed { text: String },
    Failed { error: String },
}

pub struct ConversationOrchestrator {
    db: Arc<Database>,
    bus: Arc<dyn JobBus>,
    responder: Arc<dyn AiResponder>,
    limiter: Arc<dyn RateLimiter>,
    completion: Arc<CompletionCoordinator>,
    coalescer: BurstCoalescer,
    config: OrchestratorConfig,
    limits: RateLimitConfig,
    store: PermanentStore,
}

impl ConversationOrchestrator {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<dyn JobBus>,
        responder: Arc<dyn AiResponder>,
        limiter: Arc<dyn RateLimiter>,
        completion: Arc<CompletionCoordinator>,
        config: OrchestratorConfig,
        limits: RateLimitConfig,
    ) -> Self {
        let coalescer = BurstCoalescer::new(Duration::from_millis(config.coalesce_window_ms));
        Self {
            db,
            bus,
            responder,
            limiter,
            completion,
            coalescer,
            config,
            limits,
            store: PermanentStore,
        }
    }

    /// Handle a candidate message on an identified conversation.
    ///
    /// The message is always stored first. Returns `None` when nothing is
    /// sent back right away: a duplicate delivery, a voice note waiting on
    /// transcription, or a line folded into a burst led by another call.
    pub async fn handle_message(
        &self,
        conversation_id: &Uuid,
        message: Message,
    ) -> Result<Option<OrchestratorReply>, ChatError> {
        self.validate(&message)?;

        let (conversation, stored) = self.db.with_tx(|tx| {
            let conversation = conversations::find_conversation(tx, conversation_id)?
                .ok_or(ChatError::ConversationNotFound(*conversation_id))?;
            let stored = self
                .store
                .append_live(tx, conversation_id, &message, Utc::now())?;
            Ok::<_, ChatError>((conversation, stored))
        })?;

        let Some(stored) = stored else {
            debug!(conversation_id = %conversation_id, "Duplicate delivery ignored");
            return Ok(None);
        };

        if let Err(e) = validate_transition(conversation.status, ConversationStatus::Active) {
            debug!(conversation_id = %conversation_id, error = %e, "Message on closed conversation kept for audit");
            return Ok(Some(
                self.send_scripted(&conversation, ScriptedReply::ConversationClosed)
                    .await?,
            ));
        }

        match stored.message.content_type {
            ContentType::Voice => {
                send_best_effort(
                    self.bus.as_ref(),
                    JobEvent::VoiceTranscribe {
                        message_id: stored.id,
                        file_id: stored.message.content.clone(),
                    },
                )
                .await;
                Ok(None)
            }
            ContentType::Text => {
                match self
                    .coalescer
                    .submit(conversation.id, stored.message.content.clone())
                    .await
                {
                    Some(burst) => self.run_turn(&conversation, burst).await.map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    /// The candidate asked to stop. The command is kept in the history and
    /// the interview completes with `candidate_ended`.
    pub async fn end_by_candidate(
        &self,
        conversation_id: &Uuid,
        command: Message,
    ) -> Result<Option<OrchestratorReply>, ChatError> {
        let (conversation, stored) = self.db.with_tx(|tx| {
            let conversation = conversations::find_conversation(tx, conversation_id)?
                .ok_or(ChatError::ConversationNotFound(*conversation_id))?;
            let stored = self
                .store
                .append_live(tx, conversation_id, &command, Utc::now())?;
            Ok::<_, ChatError>((conversation, stored))
        })?;
        if stored.is_none() {
            debug!(conversation_id = %conversation_id, "Duplicate end command ignored");
            return Ok(None);
        }

        let outcome = self.completion.complete(
            &conversation.response_id,
            CompletionReason::CandidateEnded,
            None,
            Utc::now(),
        )?;
        let scripted = if outcome.already_completed {
            ScriptedReply::ConversationClosed
        } else {
            info!(conversation_id = %conversation.id, "Candidate ended the interview");
            ScriptedReply::InterviewEnded
        };
        self.send_scripted(&conversation, scripted).await.map(Some)
    }

    /// Apply a transcription result to a stored voice note.
    ///
    /// A transcript runs an AI turn over it; a failure asks the candidate
    /// to resend as text.
    pub async fn apply_transcript(
        &self,
        message_id: Uuid,
        outcome: TranscriptOutcome,
    ) -> Result<Option<OrchestratorReply>, ChatError> {
        let message = self
            .db
            .with_conn(|conn| self.store.find(conn, message_id))?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        let conversation = self.conversation(&message.conversation_id)?;

        match outcome {
            TranscriptOutcome::Failed { error } => {
                warn!(message_id = %message_id, error = %error, "Voice transcription failed");
                if conversation.status.is_terminal() {
                    return Ok(None);
                }
                Ok(Some(
                    self.send_scripted(&conversation, ScriptedReply::ResendAsText)
                        .await?,
                ))
            }
            TranscriptOutcome::Transcribed { text } => {
                self.db
                    .with_conn(|conn| self.store.set_transcript(conn, message_id, &text))?
                    .ok_or(ChatError::MessageNotFound(message_id))?;
                debug!(message_id = %message_id, "Transcript attached");

                if conversation.status.is_terminal() {
                    return Ok(None);
                }
                self.run_turn(&conversation, text).await.map(Some)
            }
        }
    }

    /// Full ordered history of a conversation.
    pub fn history(&self, conversation_id: &Uuid) -> Result<Vec<ConversationMessage>, ChatError> {
        self.conversation(conversation_id)?;
        Ok(self
            .db
            .with_conn(|conn| self.store.list(conn, conversation_id))?)
    }

    pub fn conversation(&self, conversation_id: &Uuid) -> Result<Conversation, ChatError> {
        self.db
            .with_conn(|conn| conversations::find_conversation(conn, conversation_id))?
            .ok_or(ChatError::ConversationNotFound(*conversation_id))
    }

    fn validate(&self, message: &Message) -> Result<(), ChatError> {
        if message.content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if message.content_type == ContentType::Text
            && message.content.chars().count() > self.config.max_message_length
        {
            return Err(ChatError::MessageTooLong(self.config.max_message_length));
        }
        Ok(())
    }

    async fn run_turn(
        &self,
        conversation: &Conversation,
        input: String,
    ) -> Result<OrchestratorReply, ChatError> {
        let key = conversation.id.to_string();
        if let Decision::Denied { retry_after } = self.limiter.check(
            &key,
            self.limits.ai_turns_per_window,
            Duration::from_secs(self.limits.ai_window_secs),
        ) {
            warn!(
                conversation_id = %conversation.id,
                retry_after_secs = retry_after.as_secs(),
                "AI turn rate limited"
            );
            return self.send_scripted(conversation, ScriptedReply::SlowDown).await;
        }

        let (history, bot_turns) = self.db.with_conn(|conn| {
            let history = self
                .store
                .recent(conn, &conversation.id, self.config.history_turns)?;
            let bot_turns = self
                .store
                .count_by_sender(conn, &conversation.id, Sender::Bot)?;
            Ok::<_, ChatError>((history, bot_turns))
        })?;

        let ctx = TurnContext {
            conversation_id: conversation.id,
            response_id: conversation.response_id.clone(),
            history,
            input,
            bot_turns,
        };
        let turn = match self.responder.respond(&ctx).await {
            Ok(turn) => turn,
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "AI responder failed");
                return self
                    .send_scripted(conversation, ScriptedReply::TemporarilyUnavailable)
                    .await;
            }
        };

        let mut reply = OrchestratorReply {
            conversation_id: conversation.id,
            text: String::new(),
            message_id: None,
            scripted: None,
            finished: turn.finish,
        };

        if let Some(text) = turn.reply {
            let stored = self.db.with_tx(|tx| {
                let now = Utc::now();
                self.store
                    .append_live(tx, &conversation.id, &Message::bot_text(text.clone(), now), now)
            })?;
            if let Some(stored) = stored {
                self.deliver(conversation, stored.id, &text).await?;
                reply.message_id = Some(stored.id);
            }
            reply.text = text;
        }

        if turn.finish {
            let outcome = self.completion.complete(
                &conversation.response_id,
                CompletionReason::ToolCall,
                None,
                Utc::now(),
            )?;
            info!(
                conversation_id = %conversation.id,
                already_completed = outcome.already_completed,
                "Interviewer finished the interview"
            );
        }
        Ok(reply)
    }

    async fn send_scripted(
        &self,
        conversation: &Conversation,
        scripted: ScriptedReply,
    ) -> Result<OrchestratorReply, ChatError> {
        let message_id = Uuid::new_v4();
        self.deliver(conversation, message_id, scripted.text()).await?;
        Ok(OrchestratorReply {
            conversation_id: conversation.id,
            text: scripted.text().to_string(),
            message_id: None,
            scripted: Some(scripted),
            finished: false,
        })
    }

    /// Push a reply to every channel bound to the conversation's response.
    async fn deliver(
        &self,
        conversation: &Conversation,
        message_id: Uuid,
        text: &str,
    ) -> Result<(), ChatError> {
        let bindings = self
            .db
            .with_conn(|conn| conversations::bindings_for_response(conn, &conversation.response_id))?;
        if bindings.is_empty() {
            debug!(conversation_id = %conversation.id, "No bound channel, reply not pushed");
        }
        for binding in bindings {
            send_best_effort(
                self.bus.as_ref(),
                JobEvent::MessageSend {
                    message_id,
                    channel_id: binding.channel,
                    content: text.to_string(),
                },
            )
            .await;
        }
        Ok(())
    }
}
