//! Fixed texts sent to participants.
//!
//! Participants only ever see one of these; identifiers and internal
//! error messages never leave the service.

use serde::{Deserialize, Serialize};

/// A canned reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedReply {
    /// Sent for every identification failure, whatever the cause.
    NotRecognized,
    /// First contact from an unidentified participant.
    AskForPin,
    /// Identification succeeded.
    Identified,
    /// The interview is over; further messages are kept but not answered.
    ConversationClosed,
    /// The candidate ended the interview themselves.
    InterviewEnded,
    /// Voice could not be transcribed or the message was unreadable.
    ResendAsText,
    /// The message is longer than allowed.
    MessageTooLong,
    /// A transient failure on our side.
    TemporarilyUnavailable,
    /// The participant is sending faster than the AI turn budget allows.
    SlowDown,
}

impl ScriptedReply {
    pub fn text(&self) -> &'static str {
        match self {
            ScriptedReply::NotRecognized => {
                "Sorry, we couldn't recognise that code. Please check it and try again."
            }
            ScriptedReply::AskForPin => {
                "Hello! To continue, please send the access code you received with your invitation."
            }
            ScriptedReply::Identified => "Thank you, you're all set. Let's continue.",
            ScriptedReply::ConversationClosed => {
                "This interview has already finished. Thank you for your time!"
            }
            ScriptedReply::InterviewEnded => {
                "Understood, the interview is now finished. Thank you for your time!"
            }
            ScriptedReply::ResendAsText => {
                "Sorry, we couldn't process your voice message. Could you send it as text?"
            }
            ScriptedReply::MessageTooLong => {
                "That message is too long. Please split it into shorter messages."
            }
            ScriptedReply::TemporarilyUnavailable => {
                "Something went wrong on our side. Please try again in a moment."
            }
            ScriptedReply::SlowDown => "Please give me a moment to catch up before sending more.",
        }
    }
}
