//! Single entry point for every inbound channel message.
//!
//! Bound channels go straight to the orchestrator. Unbound channels are
//! buffered until the participant sends a pin, at which point the buffer
//! is migrated into the resolved conversation.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use intake_core::events::JobEvent;
use intake_core::types::{
    ChannelBinding, ChannelIdentifier, ContentType, ConversationMessage, IncomingMessage,
    TempSessionId,
};
use intake_storage::{conversations, Database};

use crate::dispatch::send_best_effort;
use crate::error::ChatError;
use crate::identity::{looks_like_pin, IdentityResolver};
use crate::jobs::JobBus;
use crate::migrator::MessageMigrator;
use crate::orchestrator::{ConversationOrchestrator, OrchestratorReply};
use crate::replies::ScriptedReply;
use crate::unidentified::UnidentifiedSessionStore;

/// How an inbound message was handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GatewayOutcome {
    /// Held for an unidentified participant.
    Buffered {
        temp_session_id: TempSessionId,
        prompted: bool,
    },
    /// The pin resolved and buffered history moved to the conversation.
    Identified {
        conversation_id: Uuid,
        migrated: usize,
    },
    /// Handed to the orchestrator of a bound conversation. `reply` is
    /// `None` when nothing was sent back right away.
    Forwarded {
        conversation_id: Uuid,
        reply: Option<OrchestratorReply>,
    },
    /// The candidate asked to end the interview.
    Ended {
        conversation_id: Uuid,
        reply: Option<OrchestratorReply>,
    },
    /// Answered with a canned reply and not processed further.
    Rejected { reply: ScriptedReply },
    /// A redelivery of an already-buffered provider message.
    Duplicate,
}

/// `/end` or `/stop`, optionally addressed to a bot as Telegram does in
/// groups (`/end@intake_bot`).
pub fn is_end_command(text: &str) -> bool {
    let command = text.trim().split('@').next().unwrap_or_default();
    command.eq_ignore_ascii_case("/end") || command.eq_ignore_ascii_case("/stop")
}

pub struct ChannelGateway {
    db: Arc<Database>,
    bus: Arc<dyn JobBus>,
    sessions: Arc<UnidentifiedSessionStore>,
    identity: Arc<IdentityResolver>,
    migrator: Arc<MessageMigrator>,
    orchestrator: Arc<ConversationOrchestrator>,
}

impl ChannelGateway {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<dyn JobBus>,
        sessions: Arc<UnidentifiedSessionStore>,
        identity: Arc<IdentityResolver>,
        migrator: Arc<MessageMigrator>,
        orchestrator: Arc<ConversationOrchestrator>,
    ) -> Self {
        Self {
            db,
            bus,
            sessions,
            identity,
            migrator,
            orchestrator,
        }
    }

    /// The binding for a channel, if it has been identified.
    pub fn binding(&self, channel: &ChannelIdentifier) -> Result<Option<ChannelBinding>, ChatError> {
        Ok(self
            .db
            .with_conn(|conn| conversations::find_binding(conn, channel))?)
    }

    /// Route one inbound message.
    ///
    /// Participant-facing failures are answered with a scripted reply and
    /// reported as `Rejected`. Only storage and bus failures surface as
    /// errors, so a provider redelivery can retry them.
    pub async fn route(&self, incoming: IncomingMessage) -> Result<GatewayOutcome, ChatError> {
        let channel = incoming.channel.clone();

        if let Some(binding) = self.binding(&channel)? {
            return self.forward(&binding, incoming).await;
        }

        if incoming.content_type == ContentType::Text {
            if let Some(pin) = looks_like_pin(&incoming.content) {
                return self.identify(&channel, pin).await;
            }
        }

        self.buffer(&channel, incoming).await
    }

    /// Hold a message from a channel that had no binding when it arrived.
    async fn buffer(
        &self,
        channel: &ChannelIdentifier,
        incoming: IncomingMessage,
    ) -> Result<GatewayOutcome, ChatError> {
        let buffered = self
            .sessions
            .append_message(channel, &incoming.to_message())?;
        if buffered.stored.is_none() {
            return Ok(GatewayOutcome::Duplicate);
        }

        let mut prompted = false;
        if buffered.session_created {
            // Identification may have committed after the binding check and
            // already migrated the previous buffer.
            match self.binding(channel)? {
                Some(binding) => {
                    self.migrate_buffer(&buffered.temp_session_id, &binding.conversation_id)
                        .await?;
                }
                None => {
                    self.reply(channel, ScriptedReply::AskForPin).await;
                    prompted = true;
                }
            }
        }
        Ok(GatewayOutcome::Buffered {
            temp_session_id: buffered.temp_session_id,
            prompted,
        })
    }

    async fn forward(
        &self,
        binding: &ChannelBinding,
        incoming: IncomingMessage,
    ) -> Result<GatewayOutcome, ChatError> {
        // A failed migration leaves the buffer behind; pick it up here.
        if self.sessions.exists(&binding.channel)? {
            let temp = TempSessionId::for_channel(&binding.channel);
            self.migrate_buffer(&temp, &binding.conversation_id).await?;
        }

        let result = if incoming.content_type == ContentType::Text
            && is_end_command(&incoming.content)
        {
            self.orchestrator
                .end_by_candidate(&binding.conversation_id, incoming.to_message())
                .await
                .map(|reply| GatewayOutcome::Ended {
                    conversation_id: binding.conversation_id,
                    reply,
                })
        } else {
            self.orchestrator
                .handle_message(&binding.conversation_id, incoming.to_message())
                .await
                .map(|reply| GatewayOutcome::Forwarded {
                    conversation_id: binding.conversation_id,
                    reply,
                })
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e @ ChatError::Storage(_)) => Err(e),
            Err(e) => {
                debug!(channel = %binding.channel, error = %e, "Inbound message rejected");
                let reply = e.scripted_reply();
                self.reply(&binding.channel, reply).await;
                Ok(GatewayOutcome::Rejected { reply })
            }
        }
    }

    async fn identify(
        &self,
        channel: &ChannelIdentifier,
        pin: &str,
    ) -> Result<GatewayOutcome, ChatError> {
        let now = Utc::now();
        let temp = self.sessions.open(channel, now)?;

        let conversation = match self.identity.resolve(&temp, pin, now) {
            Ok(conversation) => conversation,
            Err(e) if e.is_identity_failure() => {
                self.reply(channel, ScriptedReply::NotRecognized).await;
                return Ok(GatewayOutcome::Rejected {
                    reply: ScriptedReply::NotRecognized,
                });
            }
            Err(e) => return Err(e),
        };

        let migrated = match self.migrate_buffer(&temp, &conversation.id).await {
            Ok(records) => records.len(),
            Err(e) => {
                // The binding is committed. The buffer is retried on the
                // next inbound message from this channel.
                error!(temp_session_id = %temp, error = %e, "History migration failed");
                0
            }
        };

        info!(
            conversation_id = %conversation.id,
            channel_kind = %channel.kind(),
            migrated,
            "Participant identified"
        );
        self.reply(channel, ScriptedReply::Identified).await;
        Ok(GatewayOutcome::Identified {
            conversation_id: conversation.id,
            migrated,
        })
    }

    /// Migrate a buffer and queue transcription for the voice notes that
    /// arrived before identification.
    async fn migrate_buffer(
        &self,
        temp: &TempSessionId,
        conversation_id: &Uuid,
    ) -> Result<Vec<ConversationMessage>, ChatError> {
        let migrated = self.migrator.migrate(temp, conversation_id)?;
        for record in migrated
            .iter()
            .filter(|m| m.message.content_type == ContentType::Voice)
        {
            send_best_effort(
                self.bus.as_ref(),
                JobEvent::VoiceTranscribe {
                    message_id: record.id,
                    file_id: record.message.content.clone(),
                },
            )
            .await;
        }
        Ok(migrated)
    }

    async fn reply(&self, channel: &ChannelIdentifier, reply: ScriptedReply) {
        send_best_effort(
            self.bus.as_ref(),
            JobEvent::MessageSend {
                message_id: Uuid::new_v4(),
                channel_id: channel.clone(),
                content: reply.text().to_string(),
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionCoordinator;
    use crate::jobs::testing::RecordingBus;
    use crate::rate_limit::Unlimited;
    use crate::responder::ScriptedResponder;
    use intake_core::config::{IdentityConfig, OrchestratorConfig, RateLimitConfig};
    use intake_core::types::{
        CandidateResponse, IdentificationPin, InterviewStatus, ResponseId, Sender,
    };
    use intake_core::IntakeError;
    use intake_storage::{interviews, outbox, responses, MessageStore, PermanentStore};

    struct Harness {
        db: Arc<Database>,
        bus: Arc<RecordingBus>,
        sessions: Arc<UnidentifiedSessionStore>,
        gateway: ChannelGateway,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::in_memory().unwrap());
        let bus = Arc::new(RecordingBus::new());
        let sessions = Arc::new(UnidentifiedSessionStore::new(Arc::clone(&db)));
        let identity = Arc::new(IdentityResolver::new(Arc::clone(&db), IdentityConfig::default()));
        let migrator = Arc::new(MessageMigrator::new(Arc::clone(&db)));
        let orchestrator = Arc::new(ConversationOrchestrator::new(
            Arc::clone(&db),
            bus.clone(),
            Arc::new(ScriptedResponder::new(vec!["Q1".into(), "Q2".into()], "Bye")),
            Arc::new(Unlimited),
            Arc::new(CompletionCoordinator::new(Arc::clone(&db))),
            OrchestratorConfig {
                coalesce_window_ms: 0,
                ..OrchestratorConfig::default()
            },
            RateLimitConfig::default(),
        ));
        let gateway = ChannelGateway::new(
            Arc::clone(&db),
            bus.clone(),
            Arc::clone(&sessions),
            identity,
            migrator,
            orchestrator,
        );
        Harness {
            db,
            bus,
            sessions,
            gateway,
        }
    }

    fn seed_pin(db: &Database, response: &str, pin: &str) {
        db.with_tx(|tx| {
            let id = ResponseId::new(response);
            responses::insert_response(
                tx,
                &CandidateResponse {
                    id: id.clone(),
                    candidate_name: "Ada".into(),
                    vacancy_title: "Engineer".into(),
                    created_at: Utc::now(),
                },
            )?;
            responses::insert_pin(
                tx,
                &IdentificationPin {
                    pin: pin.into(),
                    response_id: id,
                    expires_at: Utc::now() + chrono::Duration::days(1),
                    consumed_by: None,
                    consumed_at: None,
                },
                Utc::now(),
            )?;
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }

    fn sent_texts(bus: &RecordingBus) -> Vec<String> {
        bus.events()
            .into_iter()
            .filter_map(|e| match e.event {
                JobEvent::MessageSend { content, .. } => Some(content),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_buffer_then_identify() {
        let h = harness();
        seed_pin(&h.db, "r_42", "1234");
        let channel = ChannelIdentifier::TelegramChatId(555);

        let first = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), "hi"))
            .await
            .unwrap();
        assert!(matches!(first, GatewayOutcome::Buffered { prompted: true, .. }));
        let second = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), "need job"))
            .await
            .unwrap();
        assert!(matches!(second, GatewayOutcome::Buffered { prompted: false, .. }));

        let temp = TempSessionId::for_channel(&channel);
        assert_eq!(h.sessions.buffered(&temp).unwrap().len(), 2);

        let identified = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), "1234"))
            .await
            .unwrap();
        let GatewayOutcome::Identified {
            conversation_id,
            migrated,
        } = identified
        else {
            panic!("expected identification, got {:?}", identified);
        };
        assert_eq!(migrated, 2);
        assert!(!h.sessions.exists(&channel).unwrap());

        let binding = h.gateway.binding(&channel).unwrap().unwrap();
        assert_eq!(binding.response_id, ResponseId::new("r_42"));
        assert_eq!(binding.conversation_id, conversation_id);

        let history = h
            .db
            .with_conn(|conn| PermanentStore.list(conn, &conversation_id))
            .unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(texts, vec!["hi", "need job"]);

        assert_eq!(
            sent_texts(&h.bus),
            vec![
                ScriptedReply::AskForPin.text().to_string(),
                ScriptedReply::Identified.text().to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_bound_channel_goes_to_orchestrator() {
        let h = harness();
        seed_pin(&h.db, "r_1", "5678");
        let channel = ChannelIdentifier::WebSessionToken("tok".into());
        h.gateway
            .route(IncomingMessage::text(channel.clone(), "5678"))
            .await
            .unwrap();

        let outcome = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), "hello there"))
            .await
            .unwrap();
        match outcome {
            GatewayOutcome::Forwarded { reply, .. } => {
                assert_eq!(reply.unwrap().text, "Q1");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_pin_not_recognized() {
        let h = harness();
        seed_pin(&h.db, "r_1", "5678");
        let channel = ChannelIdentifier::TelegramChatId(9);

        let outcome = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), "0000"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Rejected {
                reply: ScriptedReply::NotRecognized
            }
        );
        assert!(h.gateway.binding(&channel).unwrap().is_none());
        assert_eq!(
            sent_texts(&h.bus),
            vec![ScriptedReply::NotRecognized.text().to_string()]
        );
    }

    #[tokio::test]
    async fn test_pin_used_by_other_chat_not_recognized() {
        let h = harness();
        seed_pin(&h.db, "r_1", "5678");
        h.gateway
            .route(IncomingMessage::text(ChannelIdentifier::TelegramChatId(1), "5678"))
            .await
            .unwrap();

        let outcome = h
            .gateway
            .route(IncomingMessage::text(ChannelIdentifier::TelegramChatId(2), "5678"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Rejected {
                reply: ScriptedReply::NotRecognized
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_buffered_delivery() {
        let h = harness();
        let channel = ChannelIdentifier::TelegramChatId(3);
        let msg = IncomingMessage::text(channel, "hello").with_external_id("tg-77");
        h.gateway.route(msg.clone()).await.unwrap();
        assert_eq!(h.gateway.route(msg).await.unwrap(), GatewayOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_invalid_message_on_bound_channel_is_rejected() {
        let h = harness();
        seed_pin(&h.db, "r_1", "5678");
        let channel = ChannelIdentifier::TelegramChatId(4);
        h.gateway
            .route(IncomingMessage::text(channel.clone(), "5678"))
            .await
            .unwrap();

        let outcome = h
            .gateway
            .route(IncomingMessage::text(channel, "   "))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            GatewayOutcome::Rejected {
                reply: ScriptedReply::ResendAsText
            }
        );
    }

    #[tokio::test]
    async fn test_voice_before_identification_is_buffered() {
        let h = harness();
        let channel = ChannelIdentifier::TelegramChatId(6);
        let outcome = h
            .gateway
            .route(IncomingMessage::voice(channel.clone(), "file-1"))
            .await
            .unwrap();
        assert!(matches!(outcome, GatewayOutcome::Buffered { .. }));
        let buffered = h
            .sessions
            .buffered(&TempSessionId::for_channel(&channel))
            .unwrap();
        assert_eq!(buffered[0].message.sender, Sender::Candidate);
        assert_eq!(buffered[0].message.content_type, ContentType::Voice);
    }

    #[tokio::test]
    async fn test_voice_buffered_before_pin_is_transcribed_after_migration() {
        let h = harness();
        seed_pin(&h.db, "r_42", "1234");
        let channel = ChannelIdentifier::TelegramChatId(6);
        h.gateway
            .route(IncomingMessage::voice(channel.clone(), "file-1"))
            .await
            .unwrap();
        let identified = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), "1234"))
            .await
            .unwrap();
        let GatewayOutcome::Identified { conversation_id, .. } = identified else {
            panic!("expected identification, got {:?}", identified);
        };

        let names: Vec<&str> = h.bus.events().iter().map(|e| e.event.name()).collect();
        assert_eq!(names, vec!["message.send", "voice.transcribe", "message.send"]);

        let stored = h
            .db
            .with_conn(|conn| PermanentStore.list(conn, &conversation_id))
            .unwrap();
        let transcribe = h
            .bus
            .events()
            .into_iter()
            .find_map(|e| match e.event {
                JobEvent::VoiceTranscribe { message_id, file_id } => Some((message_id, file_id)),
                _ => None,
            })
            .unwrap();
        assert_eq!(transcribe, (stored[0].id, "file-1".to_string()));
    }

    #[tokio::test]
    async fn test_end_command_completes_interview() {
        let h = harness();
        seed_pin(&h.db, "r_42", "1234");
        let channel = ChannelIdentifier::TelegramChatId(8);
        h.gateway
            .route(IncomingMessage::text(channel.clone(), "1234"))
            .await
            .unwrap();
        h.gateway
            .route(IncomingMessage::text(channel.clone(), "hello"))
            .await
            .unwrap();

        let outcome = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), " /END "))
            .await
            .unwrap();
        let GatewayOutcome::Ended { reply, .. } = outcome else {
            panic!("expected end, got {:?}", outcome);
        };
        assert_eq!(reply.unwrap().scripted, Some(ScriptedReply::InterviewEnded));

        let session = h
            .db
            .with_conn(|conn| interviews::latest_interview(conn, &ResponseId::new("r_42")))
            .unwrap()
            .unwrap();
        assert_eq!(session.status, InterviewStatus::Completed);
        assert_eq!(session.finish_reason.as_deref(), Some("candidate_ended"));
        assert!(h
            .db
            .with_conn(|conn| outbox::find_by_key(conn, "interview.complete:r_42"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_end_command_matching() {
        assert!(is_end_command("/end"));
        assert!(is_end_command("/stop@intake_bot"));
        assert!(!is_end_command("I want to end this"));
        assert!(!is_end_command("/ending"));
    }

    #[tokio::test]
    async fn test_message_racing_identification_is_not_prompted() {
        let h = harness();
        seed_pin(&h.db, "r_42", "1234");
        let channel = ChannelIdentifier::TelegramChatId(10);
        h.gateway
            .route(IncomingMessage::text(channel.clone(), "hi"))
            .await
            .unwrap();
        let identified = h
            .gateway
            .route(IncomingMessage::text(channel.clone(), "1234"))
            .await
            .unwrap();
        let GatewayOutcome::Identified { conversation_id, .. } = identified else {
            panic!("expected identification, got {:?}", identified);
        };

        // Passed the binding check before identification committed.
        let outcome = h
            .gateway
            .buffer(&channel, IncomingMessage::text(channel.clone(), "late line"))
            .await
            .unwrap();
        assert!(matches!(outcome, GatewayOutcome::Buffered { prompted: false, .. }));
        assert!(!h.sessions.exists(&channel).unwrap());

        let history = h
            .db
            .with_conn(|conn| PermanentStore.list(conn, &conversation_id))
            .unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(texts, vec!["hi", "late line"]);
        assert_eq!(
            sent_texts(&h.bus),
            vec![
                ScriptedReply::AskForPin.text().to_string(),
                ScriptedReply::Identified.text().to_string(),
            ]
        );
    }
}
