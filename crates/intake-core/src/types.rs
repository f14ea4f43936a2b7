use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IntakeError;

/// UTC timestamp used throughout the domain.
pub type Timestamp = DateTime<Utc>;

// =============================================================================
// Channel identity
// =============================================================================

/// The transport a candidate is talking through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Telegram bot chat.
    Telegram,
    /// Embedded web chat widget.
    Web,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Web => "web",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(ChannelKind::Telegram),
            "web" => Ok(ChannelKind::Web),
            other => Err(IntakeError::InvalidIdentifier(format!(
                "unknown channel kind: {}",
                other
            ))),
        }
    }
}

/// Transport-scoped participant identity.
///
/// Serialized as its canonical key (`tg:<chat id>` or `web:<token>`), which
/// is also the form stored in the ephemeral tables and bindings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelIdentifier {
    TelegramChatId(i64),
    WebSessionToken(String),
}

impl ChannelIdentifier {
    const TELEGRAM_PREFIX: &'static str = "tg:";
    const WEB_PREFIX: &'static str = "web:";

    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelIdentifier::TelegramChatId(_) => ChannelKind::Telegram,
            ChannelIdentifier::WebSessionToken(_) => ChannelKind::Web,
        }
    }

    /// Canonical string key for storage and logs.
    pub fn key(&self) -> String {
        match self {
            ChannelIdentifier::TelegramChatId(id) => format!("{}{}", Self::TELEGRAM_PREFIX, id),
            ChannelIdentifier::WebSessionToken(token) => {
                format!("{}{}", Self::WEB_PREFIX, token)
            }
        }
    }

    /// Parse a canonical key produced by [`ChannelIdentifier::key`].
    pub fn parse(key: &str) -> Result<Self, IntakeError> {
        if let Some(raw) = key.strip_prefix(Self::TELEGRAM_PREFIX) {
            return raw
                .parse::<i64>()
                .map(ChannelIdentifier::TelegramChatId)
                .map_err(|_| IntakeError::InvalidIdentifier(key.to_string()));
        }
        if let Some(token) = key.strip_prefix(Self::WEB_PREFIX) {
            if token.is_empty() || token.chars().any(char::is_whitespace) {
                return Err(IntakeError::InvalidIdentifier(key.to_string()));
            }
            return Ok(ChannelIdentifier::WebSessionToken(token.to_string()));
        }
        Err(IntakeError::InvalidIdentifier(key.to_string()))
    }
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl TryFrom<String> for ChannelIdentifier {
    type Error = IntakeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChannelIdentifier::parse(&value)
    }
}

impl From<ChannelIdentifier> for String {
    fn from(value: ChannelIdentifier) -> Self {
        value.key()
    }
}

/// Identifier of an unidentified (pre-pin) session.
///
/// Derived deterministically from the channel so concurrent first messages
/// from one channel land in the same session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempSessionId(String);

impl TempSessionId {
    const PREFIX: &'static str = "temp_";

    pub fn for_channel(channel: &ChannelIdentifier) -> Self {
        Self(format!("{}{}", Self::PREFIX, channel.key()))
    }

    /// Accept a raw id from storage or the wire, validating its shape.
    pub fn parse(raw: &str) -> Result<Self, IntakeError> {
        let id = Self(raw.to_string());
        id.channel()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the channel this session belongs to.
    pub fn channel(&self) -> Result<ChannelIdentifier, IntakeError> {
        let key = self
            .0
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| IntakeError::InvalidIdentifier(self.0.clone()))?;
        ChannelIdentifier::parse(key)
    }
}

impl fmt::Display for TempSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a candidate response (the permanent identity).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(String);

impl ResponseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResponseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// =============================================================================
// Message values
// =============================================================================

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Candidate,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Candidate => "candidate",
            Sender::Bot => "bot",
        }
    }
}

impl FromStr for Sender {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "candidate" => Ok(Sender::Candidate),
            "bot" => Ok(Sender::Bot),
            other => Err(IntakeError::Serialization(format!("unknown sender: {}", other))),
        }
    }
}

/// Payload kind of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    /// Voice note; `content` holds the provider file id.
    Voice,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Voice => "voice",
        }
    }
}

impl FromStr for ContentType {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentType::Text),
            "voice" => Ok(ContentType::Voice),
            other => Err(IntakeError::Serialization(format!(
                "unknown content type: {}",
                other
            ))),
        }
    }
}

/// Message value shared by the ephemeral and permanent stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub content_type: ContentType,
    pub content: String,
    pub external_message_id: Option<String>,
    pub timestamp: Timestamp,
}

impl Message {
    pub fn candidate_text(content: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            sender: Sender::Candidate,
            content_type: ContentType::Text,
            content: content.into(),
            external_message_id: None,
            timestamp,
        }
    }

    pub fn bot_text(content: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            sender: Sender::Bot,
            content_type: ContentType::Text,
            content: content.into(),
            external_message_id: None,
            timestamp,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_message_id = Some(external_id.into());
        self
    }
}

/// Canonical inbound message produced by a channel adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub channel: ChannelIdentifier,
    pub content_type: ContentType,
    /// Text body, or the provider file id for voice notes.
    pub content: String,
    pub external_message_id: Option<String>,
    pub received_at: Timestamp,
}

impl IncomingMessage {
    pub fn text(channel: ChannelIdentifier, content: impl Into<String>) -> Self {
        Self {
            channel,
            content_type: ContentType::Text,
            content: content.into(),
            external_message_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn voice(channel: ChannelIdentifier, file_id: impl Into<String>) -> Self {
        Self {
            channel,
            content_type: ContentType::Voice,
            content: file_id.into(),
            external_message_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_message_id = Some(external_id.into());
        self
    }

    pub fn at(mut self, received_at: Timestamp) -> Self {
        self.received_at = received_at;
        self
    }

    /// Candidate-authored message value for storage.
    pub fn to_message(&self) -> Message {
        Message {
            sender: Sender::Candidate,
            content_type: self.content_type,
            content: self.content.clone(),
            external_message_id: self.external_message_id.clone(),
            timestamp: self.received_at,
        }
    }
}

// =============================================================================
// Lifecycle states
// =============================================================================

/// Permanent conversation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Completed,
    Cancelled,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConversationStatus::Active)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "completed" => Ok(ConversationStatus::Completed),
            "cancelled" => Ok(ConversationStatus::Cancelled),
            other => Err(IntakeError::Serialization(format!(
                "unknown conversation status: {}",
                other
            ))),
        }
    }
}

/// Interview lifecycle overlay state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStatus {
    Active,
    Completed,
    Cancelled,
}

impl InterviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterviewStatus::Active => "active",
            InterviewStatus::Completed => "completed",
            InterviewStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InterviewStatus::Active)
    }
}

impl fmt::Display for InterviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterviewStatus {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InterviewStatus::Active),
            "completed" => Ok(InterviewStatus::Completed),
            "cancelled" => Ok(InterviewStatus::Cancelled),
            other => Err(IntakeError::Serialization(format!(
                "unknown interview status: {}",
                other
            ))),
        }
    }
}

/// Why an interview was completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// The AI interviewer called its finish tool.
    ToolCall,
    /// The candidate explicitly ended the interview.
    CandidateEnded,
    /// The timeout watchdog fired.
    Timeout,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::ToolCall => "tool_call",
            CompletionReason::CandidateEnded => "candidate_ended",
            CompletionReason::Timeout => "timeout",
        }
    }
}

/// Why an interview was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Candidate,
    Operator,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Candidate => "candidate",
            CancelReason::Operator => "operator",
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Ephemeral holding area for an unidentified participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnidentifiedSession {
    pub temp_session_id: TempSessionId,
    pub channel: ChannelIdentifier,
    pub created_at: Timestamp,
    pub awaiting_pin: bool,
}

impl UnidentifiedSession {
    pub fn channel_kind(&self) -> ChannelKind {
        self.channel.kind()
    }
}

/// A message buffered before identification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub id: Uuid,
    pub temp_session_id: TempSessionId,
    /// Database-assigned insertion sequence; breaks timestamp ties.
    pub seq: i64,
    pub message: Message,
}

/// Permanent, identity-bound conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub response_id: ResponseId,
    pub channel_kind: ChannelKind,
    pub status: ConversationStatus,
    pub created_at: Timestamp,
}

/// A message in a permanent conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    pub message: Message,
    /// Transcript for voice notes, once the transcription result arrived.
    pub transcript: Option<String>,
}

impl ConversationMessage {
    /// Text the AI and the scorer should see for this message.
    pub fn effective_text(&self) -> Option<&str> {
        match self.message.content_type {
            ContentType::Text => Some(self.message.content.as_str()),
            ContentType::Voice => self.transcript.as_deref(),
        }
    }
}

/// Lifecycle overlay tracking whether an interview is still running.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterviewSession {
    pub id: Uuid,
    pub response_id: ResponseId,
    pub status: InterviewStatus,
    pub metadata: serde_json::Value,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub finish_reason: Option<String>,
}

/// Candidate response record owned by the recruiting side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateResponse {
    pub id: ResponseId,
    pub candidate_name: String,
    pub vacancy_title: String,
    pub created_at: Timestamp,
}

/// Single-use identification pin bound to a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentificationPin {
    pub pin: String,
    pub response_id: ResponseId,
    pub expires_at: Timestamp,
    pub consumed_by: Option<TempSessionId>,
    pub consumed_at: Option<Timestamp>,
}

impl IdentificationPin {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Binding of a transport identity to a candidate response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel: ChannelIdentifier,
    pub response_id: ResponseId,
    pub conversation_id: Uuid,
    pub bound_at: Timestamp,
}
