//! Holding area for participants whose identity is not yet known.

use std::sync::Arc;

use tracing::{debug, info};

use intake_core::types::{
    BufferedMessage, ChannelIdentifier, Message, TempSessionId, Timestamp, UnidentifiedSession,
};
use intake_storage::{sessions, Database, EphemeralStore, MessageStore};

use crate::error::ChatError;

/// Result of buffering one message.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferOutcome {
    pub temp_session_id: TempSessionId,
    /// This call created the session.
    pub session_created: bool,
    /// The stored row, or `None` for a duplicate provider delivery.
    pub stored: Option<BufferedMessage>,
}

pub struct UnidentifiedSessionStore {
    db: Arc<Database>,
    store: EphemeralStore,
}

impl UnidentifiedSessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            store: EphemeralStore,
        }
    }

    /// Buffer a message for a channel, creating its session on first use.
    ///
    /// Concurrent first messages from one channel converge on the same
    /// session; a redelivered provider message is ignored.
    pub fn append_message(
        &self,
        channel: &ChannelIdentifier,
        message: &Message,
    ) -> Result<BufferOutcome, ChatError> {
        let outcome = self.db.with_tx(|tx| {
            let (temp, created) = sessions::ensure_session(tx, channel, message.timestamp)?;
            let stored = self.store.append(tx, &temp, message)?;
            Ok::<_, ChatError>(BufferOutcome {
                temp_session_id: temp,
                session_created: created,
                stored,
            })
        })?;

        if outcome.session_created {
            info!(temp_session_id = %outcome.temp_session_id, channel_kind = %channel.kind(), "Unidentified session opened");
        }
        if outcome.stored.is_none() {
            debug!(temp_session_id = %outcome.temp_session_id, "Duplicate delivery ignored");
        }
        Ok(outcome)
    }

    /// Make sure a session exists for the channel without buffering anything.
    pub fn open(&self, channel: &ChannelIdentifier, now: Timestamp) -> Result<TempSessionId, ChatError> {
        let (temp, _) = self
            .db
            .with_conn(|conn| sessions::ensure_session(conn, channel, now))?;
        Ok(temp)
    }

    pub fn session(&self, temp: &TempSessionId) -> Result<Option<UnidentifiedSession>, ChatError> {
        Ok(self.db.with_conn(|conn| sessions::find_session(conn, temp))?)
    }

    pub fn exists(&self, channel: &ChannelIdentifier) -> Result<bool, ChatError> {
        Ok(self
            .db
            .with_conn(|conn| sessions::session_exists(conn, channel))?)
    }

    /// Buffered messages in `(timestamp, seq)` order.
    pub fn buffered(&self, temp: &TempSessionId) -> Result<Vec<BufferedMessage>, ChatError> {
        Ok(self.db.with_conn(|conn| self.store.list(conn, temp))?)
    }

    pub fn set_awaiting_pin(&self, temp: &TempSessionId, awaiting: bool) -> Result<(), ChatError> {
        Ok(self
            .db
            .with_conn(|conn| sessions::set_awaiting_pin(conn, temp, awaiting))?)
    }

    /// Delete sessions older than `ttl`, with their buffered messages.
    pub fn expire(&self, ttl: chrono::Duration, now: Timestamp) -> Result<usize, ChatError> {
        let removed = self
            .db
            .with_conn(|conn| sessions::delete_sessions_before(conn, now - ttl))?;
        if removed > 0 {
            info!(removed, "Expired unidentified sessions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn make_store() -> UnidentifiedSessionStore {
        UnidentifiedSessionStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_same_channel_same_session() {
        let store = make_store();
        let channel = ChannelIdentifier::TelegramChatId(555);
        let a = store
            .append_message(&channel, &Message::candidate_text("hi", Utc::now()))
            .unwrap();
        let b = store
            .append_message(&channel, &Message::candidate_text("need job", Utc::now()))
            .unwrap();

        assert_eq!(a.temp_session_id, b.temp_session_id);
        assert!(a.session_created);
        assert!(!b.session_created);
        assert_eq!(store.buffered(&a.temp_session_id).unwrap().len(), 2);

        let session = store.session(&a.temp_session_id).unwrap().unwrap();
        assert!(session.awaiting_pin);
        assert_eq!(session.channel, channel);
    }

    #[test]
    fn test_duplicate_delivery_ignored() {
        let store = make_store();
        let channel = ChannelIdentifier::WebSessionToken("tok".into());
        let msg = Message::candidate_text("hello", Utc::now()).with_external_id("client-1");
        assert!(store.append_message(&channel, &msg).unwrap().stored.is_some());
        let again = store.append_message(&channel, &msg).unwrap();
        assert!(again.stored.is_none());
        assert_eq!(store.buffered(&again.temp_session_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_messages_share_session() {
        let store = Arc::new(make_store());
        let channel = ChannelIdentifier::TelegramChatId(42);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let channel = channel.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                store
                    .append_message(&channel, &Message::candidate_text(format!("m{}", i), Utc::now()))
                    .unwrap()
            }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap().session_created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        let temp = TempSessionId::for_channel(&channel);
        assert_eq!(store.buffered(&temp).unwrap().len(), 8);
    }

    #[test]
    fn test_expire_removes_old_sessions() {
        let store = make_store();
        let now = Utc::now();
        let old = ChannelIdentifier::TelegramChatId(1);
        let fresh = ChannelIdentifier::TelegramChatId(2);
        store
            .append_message(&old, &Message::candidate_text("old", now - Duration::hours(30)))
            .unwrap();
        store
            .append_message(&fresh, &Message::candidate_text("new", now))
            .unwrap();

        assert_eq!(store.expire(Duration::hours(24), now).unwrap(), 1);
        assert!(!store.exists(&old).unwrap());
        assert!(store.exists(&fresh).unwrap());
        assert!(store
            .buffered(&TempSessionId::for_channel(&old))
            .unwrap()
            .is_empty());
    }
}
