//! Web chat widget adapter.
//!
//! Each widget session is identified by an opaque token. Inbound requests
//! become [`IncomingMessage`]s; outbound replies are fanned out to the
//! session's SSE subscribers through a per-token broadcast channel.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use intake_core::config::WebConfig;
use intake_core::types::{ChannelIdentifier, ChannelKind, IncomingMessage};

use crate::adapter::ChannelAdapter;
use crate::error::ChannelError;

/// A reply pushed to a widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebReply {
    pub message_id: Uuid,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Widget request body, already decoded by the HTTP layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebInbound {
    pub session_token: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice_file_id: Option<String>,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

pub struct WebAdapter {
    sessions: Mutex<HashMap<String, broadcast::Sender<WebReply>>>,
    buffer: usize,
}

impl WebAdapter {
    pub fn new(config: &WebConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            buffer: config.stream_buffer.max(1),
        }
    }

    /// Register a freshly issued session token.
    pub fn register(&self, token: &str) -> ChannelIdentifier {
        let mut sessions = self.lock();
        sessions
            .entry(token.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0);
        ChannelIdentifier::WebSessionToken(token.to_string())
    }

    pub fn is_registered(&self, token: &str) -> bool {
        self.lock().contains_key(token)
    }

    /// Subscribe to the replies for a session.
    pub fn subscribe(&self, token: &str) -> Result<broadcast::Receiver<WebReply>, ChannelError> {
        self.lock()
            .get(token)
            .map(|tx| tx.subscribe())
            .ok_or(ChannelError::UnknownSession)
    }

    /// Forget a session. Open streams end once their sender is dropped.
    pub fn close(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Normalise a widget request.
    ///
    /// Exactly one of `text` or `voice_file_id` must be present.
    pub fn to_incoming(&self, inbound: WebInbound) -> Result<IncomingMessage, ChannelError> {
        if !self.is_registered(&inbound.session_token) {
            return Err(ChannelError::UnknownSession);
        }
        let channel = ChannelIdentifier::WebSessionToken(inbound.session_token);

        let incoming = match (inbound.text, inbound.voice_file_id) {
            (Some(text), None) => IncomingMessage::text(channel, text),
            (None, Some(file_id)) => IncomingMessage::voice(channel, file_id),
            (Some(_), Some(_)) => {
                return Err(ChannelError::Malformed(
                    "send either text or voiceFileId, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(ChannelError::Malformed(
                    "text or voiceFileId is required".to_string(),
                ))
            }
        };

        Ok(match inbound.client_message_id {
            Some(id) => incoming.with_external_id(id),
            None => incoming,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<WebReply>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Web
    }

    async fn deliver(
        &self,
        channel: &ChannelIdentifier,
        message_id: Uuid,
        text: &str,
    ) -> Result<(), ChannelError> {
        let ChannelIdentifier::WebSessionToken(token) = channel else {
            return Err(ChannelError::WrongChannel {
                adapter: ChannelKind::Web,
                target: channel.key(),
            });
        };
        let tx = self
            .lock()
            .get(token)
            .cloned()
            .ok_or(ChannelError::UnknownSession)?;

        let reply = WebReply {
            message_id,
            content: text.to_string(),
            sent_at: Utc::now(),
        };
        // No open stream is fine: the widget reloads history on reconnect.
        match tx.send(reply) {
            Ok(receivers) => debug!(receivers, message_id = %message_id, "Web reply pushed"),
            Err(_) => debug!(message_id = %message_id, "No open widget stream"),
        }
        Ok(())
    }
}
