//! Telegram Bot API adapter.
//!
//! Inbound: webhook `Update` payloads are normalised into
//! [`IncomingMessage`]s. Outbound: replies go through `sendMessage`, split
//! at line boundaries to stay under Telegram's message size limit.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use intake_core::config::TelegramConfig;
use intake_core::types::{ChannelIdentifier, ChannelKind, IncomingMessage};

use crate::adapter::ChannelAdapter;
use crate::error::ChannelError;

/// Telegram rejects messages longer than 4096 characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Header Telegram sets on webhook calls when a secret was registered.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

// =============================================================================
// Webhook payload
// =============================================================================

/// The subset of a Telegram `Update` the pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: Chat,
    /// Unix seconds.
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice: Option<Voice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    pub file_id: String,
    #[serde(default)]
    pub duration: u32,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Normalise a webhook update.
///
/// Returns `None` for updates the pipeline ignores: edits, service
/// messages, stickers and other non-text, non-voice content.
pub fn parse_update(update: &Update) -> Option<IncomingMessage> {
    let message = update.message.as_ref()?;
    let channel = ChannelIdentifier::TelegramChatId(message.chat.id);
    let received_at = Utc
        .timestamp_opt(message.date, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let external_id = format!("{}:{}", message.chat.id, message.message_id);

    let incoming = if let Some(text) = &message.text {
        IncomingMessage::text(channel, text.clone())
    } else if let Some(voice) = &message.voice {
        IncomingMessage::voice(channel, voice.file_id.clone())
    } else {
        debug!(update_id = update.update_id, "Ignoring unsupported Telegram message");
        return None;
    };
    Some(incoming.with_external_id(external_id).at(received_at))
}

/// Split long messages at line boundaries to respect platform limits.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count();
        if current_len + line_len + 1 > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if line_len > max_chars {
                let chars: Vec<char> = line.chars().collect();
                for piece in chars.chunks(max_chars) {
                    chunks.push(piece.iter().collect());
                }
                continue;
            }
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// =============================================================================
// Adapter
// =============================================================================

pub struct TelegramAdapter {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramAdapter {
    pub fn new(config: TelegramConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.bot_token.is_empty()
    }

    /// Check the webhook secret header. An empty configured secret accepts
    /// every request.
    pub fn verify_secret(&self, header: Option<&str>) -> bool {
        if self.config.webhook_secret.is_empty() {
            return true;
        }
        header == Some(self.config.webhook_secret.as_str())
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    async fn send_chunk(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(self.send_message_url())
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?;

        let status = response.status();
        let body: ApiResponse = response.json().await.unwrap_or(ApiResponse {
            ok: false,
            description: None,
        });
        if status.is_success() && body.ok {
            return Ok(());
        }
        Err(ChannelError::Provider(format!(
            "Telegram returned HTTP {}: {}",
            status.as_u16(),
            body.description.unwrap_or_default()
        )))
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn deliver(
        &self,
        channel: &ChannelIdentifier,
        message_id: Uuid,
        text: &str,
    ) -> Result<(), ChannelError> {
        let ChannelIdentifier::TelegramChatId(chat_id) = channel else {
            return Err(ChannelError::WrongChannel {
                adapter: ChannelKind::Telegram,
                target: channel.key(),
            });
        };
        if !self.is_enabled() {
            return Err(ChannelError::NotConfigured(ChannelKind::Telegram));
        }

        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            if let Err(e) = self.send_chunk(*chat_id, &chunk).await {
                warn!(chat_id, message_id = %message_id, error = %e, "Telegram delivery failed");
                return Err(e);
            }
        }
        debug!(chat_id, message_id = %message_id, "Telegram reply delivered");
        Ok(())
    }
}
