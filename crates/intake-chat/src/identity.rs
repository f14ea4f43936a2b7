//! Pin-based identity resolution.
//!
//! A candidate receives a short numeric pin with their invitation. Sending
//! it from a chat binds that chat to the candidate response and opens (or
//! reuses) the permanent conversation.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use intake_core::config::IdentityConfig;
use intake_core::types::{
    Conversation, IdentificationPin, ResponseId, TempSessionId, Timestamp,
};
use intake_storage::{conversations, interviews, responses, Connection, Database};

use crate::error::ChatError;

/// Attempts at drawing an unused pin before giving up.
const MAX_PIN_DRAWS: usize = 32;

static PIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/start\s+)?(\d{4,8})$").expect("Invalid pin regex")
});

/// A freshly issued pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedPin {
    pub pin: String,
    pub response_id: ResponseId,
    pub expires_at: DateTime<Utc>,
}

/// Extract a pin from a participant message.
///
/// Accepts a bare 4-8 digit code or a Telegram deep link `/start <code>`.
pub fn looks_like_pin(text: &str) -> Option<&str> {
    PIN_PATTERN
        .captures(text.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub struct IdentityResolver {
    db: Arc<Database>,
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(db: Arc<Database>, config: IdentityConfig) -> Self {
        Self { db, config }
    }

    /// Resolve a pin sent from an unidentified session.
    ///
    /// Runs in one transaction. Retrying with the same session and pin
    /// returns the same conversation without further writes. A fresh pin
    /// for a response that is bound elsewhere rebinds it to this channel,
    /// which is how a candidate reconnects from a new web session or chat.
    pub fn resolve(
        &self,
        temp: &TempSessionId,
        pin: &str,
        now: Timestamp,
    ) -> Result<Conversation, ChatError> {
        let result = self.db.with_tx(|tx| resolve_in(tx, temp, pin, now));
        match &result {
            Ok(conversation) => info!(
                temp_session_id = %temp,
                response_id = %conversation.response_id,
                conversation_id = %conversation.id,
                "Identity resolved"
            ),
            Err(e) if e.is_identity_failure() => {
                warn!(temp_session_id = %temp, reason = %e, "Identification rejected")
            }
            Err(_) => {}
        }
        result
    }

    /// Issue a new pin for a response.
    pub fn issue_pin(&self, response_id: &ResponseId, now: Timestamp) -> Result<IssuedPin, ChatError> {
        let length = self.config.pin_length;
        let expires_at = now + Duration::minutes(i64::from(self.config.pin_ttl_minutes));

        let issued = self.db.with_tx(|tx| {
            if responses::find_response(tx, response_id)?.is_none() {
                return Err(ChatError::ResponseNotFound(response_id.clone()));
            }
            responses::purge_expired_pins(tx, now)?;

            for _ in 0..MAX_PIN_DRAWS {
                let candidate = IdentificationPin {
                    pin: random_pin(length),
                    response_id: response_id.clone(),
                    expires_at,
                    consumed_by: None,
                    consumed_at: None,
                };
                if responses::insert_pin(tx, &candidate, now)? {
                    return Ok(IssuedPin {
                        pin: candidate.pin,
                        response_id: response_id.clone(),
                        expires_at,
                    });
                }
            }
            Err(ChatError::Storage(format!(
                "could not allocate a unique {}-digit pin",
                length
            )))
        })?;

        info!(response_id = %response_id, expires_at = %issued.expires_at, "Pin issued");
        Ok(issued)
    }
}

fn random_pin(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

fn resolve_in(
    tx: &Connection,
    temp: &TempSessionId,
    pin: &str,
    now: Timestamp,
) -> Result<Conversation, ChatError> {
    let record = responses::find_pin(tx, pin)?.ok_or(ChatError::PinNotFound)?;

    if let Some(consumed_by) = &record.consumed_by {
        if consumed_by != temp {
            return Err(ChatError::ConflictingIdentity(
                "pin already used by another session".into(),
            ));
        }
        let conversation = conversations::find_conversation_by_response(tx, &record.response_id)?
            .ok_or_else(|| ChatError::ConflictingIdentity("consumed pin has no conversation".into()))?;
        if conversation.status.is_terminal() {
            return Err(ChatError::ConflictingIdentity(format!(
                "conversation is {}",
                conversation.status
            )));
        }
        let still_bound = conversations::find_binding(tx, &temp.channel()?)?
            .is_some_and(|b| b.response_id == record.response_id);
        if !still_bound {
            return Err(ChatError::ConflictingIdentity(
                "response moved to another channel".into(),
            ));
        }
        return Ok(conversation);
    }

    if record.is_expired(now) {
        return Err(ChatError::PinExpired);
    }

    let response_id = record.response_id.clone();
    if responses::find_response(tx, &response_id)?.is_none() {
        return Err(ChatError::ResponseNotFound(response_id));
    }

    let channel = temp.channel()?;
    if let Some(binding) = conversations::find_binding(tx, &channel)? {
        if binding.response_id != response_id {
            return Err(ChatError::ConflictingIdentity(
                "channel already bound to another response".into(),
            ));
        }
    }

    let conversation = match conversations::find_conversation_by_response(tx, &response_id)? {
        Some(existing) if existing.status.is_terminal() => {
            return Err(ChatError::ConflictingIdentity(format!(
                "conversation is {}",
                existing.status
            )));
        }
        Some(existing) => existing,
        None => {
            let conversation =
                conversations::insert_conversation(tx, &response_id, channel.kind(), now)?;
            interviews::insert_interview(
                tx,
                &response_id,
                json!({ "channel": channel.kind().as_str() }),
                now,
            )?;
            conversation
        }
    };

    if !responses::consume_pin(tx, pin, temp, now)? {
        return Err(ChatError::ConflictingIdentity(
            "pin consumed concurrently".into(),
        ));
    }
    // A fresh pin moves the conversation to the channel that presented it.
    for released in conversations::release_other_bindings(tx, &response_id, &channel)? {
        info!(response_id = %response_id, channel = %released, "Channel binding released");
    }
    conversations::bind_channel(tx, &channel, &response_id, &conversation.id, now)?;

    Ok(conversation)
}
