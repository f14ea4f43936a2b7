//! The AI interviewer seam.
//!
//! The orchestrator hands the responder the ordered history plus the new
//! candidate input and gets back an optional reply and whether the
//! interviewer called its finish tool.

use async_trait::async_trait;
use uuid::Uuid;

use intake_core::types::{ConversationMessage, ResponseId, Sender};

use crate::error::ChatError;

/// Everything the responder sees for one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: Uuid,
    pub response_id: ResponseId,
    /// Recent history, oldest first, including the new candidate input.
    pub history: Vec<ConversationMessage>,
    /// The candidate text this turn answers (a coalesced burst or a
    /// voice transcript).
    pub input: String,
    /// Bot messages sent so far in the whole conversation.
    pub bot_turns: usize,
}

/// Result of one AI turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiTurn {
    pub reply: Option<String>,
    /// The interviewer called `finish_interview`.
    pub finish: bool,
}

impl AiTurn {
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            reply: Some(text.into()),
            finish: false,
        }
    }

    pub fn finish_with(text: impl Into<String>) -> Self {
        Self {
            reply: Some(text.into()),
            finish: true,
        }
    }
}

#[async_trait]
pub trait AiResponder: Send + Sync {
    async fn respond(&self, ctx: &TurnContext) -> Result<AiTurn, ChatError>;
}

/// Fixed-question interviewer.
///
/// Asks each question in order and finishes once all have been answered.
/// Used for local runs and tests in place of a language model.
pub struct ScriptedResponder {
    questions: Vec<String>,
    closing: String,
}

impl ScriptedResponder {
    pub fn new(questions: Vec<String>, closing: impl Into<String>) -> Self {
        Self {
            questions,
            closing: closing.into(),
        }
    }
}

impl Default for ScriptedResponder {
    fn default() -> Self {
        Self::new(
            vec![
                "Thanks for your interest! Could you tell me a bit about your recent experience?"
                    .to_string(),
                "What interests you about this role?".to_string(),
                "When would you be available to start?".to_string(),
            ],
            "Thank you, that's everything for now. We'll be in touch soon!",
        )
    }
}

#[async_trait]
impl AiResponder for ScriptedResponder {
    async fn respond(&self, ctx: &TurnContext) -> Result<AiTurn, ChatError> {
        let asked = ctx
            .history
            .iter()
            .filter(|m| m.message.sender == Sender::Bot)
            .count()
            .max(ctx.bot_turns);

        match self.questions.get(asked) {
            Some(question) => Ok(AiTurn::say(question.clone())),
            None => Ok(AiTurn::finish_with(self.closing.clone())),
        }
    }
}
