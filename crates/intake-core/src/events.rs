use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ChannelIdentifier, ResponseId};

/// Events handed to the asynchronous job bus.
///
/// Serialized with the wire name in a `name` tag and camelCase payload
/// fields, which is the shape the scoring, transcription and delivery
/// workers consume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum JobEvent {
    /// The interview reached its terminal COMPLETED state; triggers scoring.
    #[serde(rename = "interview.complete", rename_all = "camelCase")]
    InterviewComplete {
        response_id: ResponseId,
        transcript: String,
        reason: String,
        question_count: u32,
    },

    /// A voice note needs a transcript.
    #[serde(rename = "voice.transcribe", rename_all = "camelCase")]
    VoiceTranscribe { message_id: Uuid, file_id: String },

    /// A bot reply must be pushed back through a channel adapter.
    #[serde(rename = "message.send", rename_all = "camelCase")]
    MessageSend {
        message_id: Uuid,
        channel_id: ChannelIdentifier,
        content: String,
    },
}

impl JobEvent {
    pub const INTERVIEW_COMPLETE: &'static str = "interview.complete";
    pub const VOICE_TRANSCRIBE: &'static str = "voice.transcribe";
    pub const MESSAGE_SEND: &'static str = "message.send";

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::InterviewComplete { .. } => Self::INTERVIEW_COMPLETE,
            JobEvent::VoiceTranscribe { .. } => Self::VOICE_TRANSCRIBE,
            JobEvent::MessageSend { .. } => Self::MESSAGE_SEND,
        }
    }

    /// Deduplication key. Consumers use it to drop redeliveries.
    pub fn key(&self) -> String {
        match self {
            JobEvent::InterviewComplete { response_id, .. } => {
                format!("interview.complete:{}", response_id)
            }
            JobEvent::VoiceTranscribe { message_id, .. } => {
                format!("voice.transcribe:{}", message_id)
            }
            JobEvent::MessageSend { message_id, .. } => format!("message.send:{}", message_id),
        }
    }
}

/// An event as delivered by the bus, carrying its dedup key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub key: String,
    pub attempt: u32,
    pub event: JobEvent,
}

impl JobEnvelope {
    pub fn first_attempt(event: JobEvent) -> Self {
        Self {
            key: event.key(),
            attempt: 1,
            event,
        }
    }
}
