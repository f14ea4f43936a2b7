//! Moves buffered pre-identification history into the permanent thread.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use intake_core::types::{ConversationMessage, TempSessionId};
use intake_storage::{
    conversations, copy_messages, sessions, Database, EphemeralStore, PermanentStore,
};

use crate::error::ChatError;

pub struct MessageMigrator {
    db: Arc<Database>,
}

impl MessageMigrator {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Copy every buffered message of `temp` into the conversation, in
    /// `(timestamp, seq)` order, then delete the temp session.
    ///
    /// Returns the permanent records written, in order. One transaction:
    /// on any failure nothing is written and the session is left intact.
    /// A session that no longer exists yields nothing, so the call is safe
    /// to retry.
    pub fn migrate(
        &self,
        temp: &TempSessionId,
        conversation_id: &Uuid,
    ) -> Result<Vec<ConversationMessage>, ChatError> {
        let migrated = self.db.with_tx(|tx| {
            if sessions::find_session(tx, temp)?.is_none() {
                return Ok(Vec::new());
            }
            if conversations::find_conversation(tx, conversation_id)?.is_none() {
                return Err(ChatError::ConversationNotFound(*conversation_id));
            }
            let copied = copy_messages(tx, &EphemeralStore, temp, &PermanentStore, conversation_id)?;
            sessions::delete_session(tx, temp)?;
            Ok::<_, ChatError>(copied)
        })?;

        if !migrated.is_empty() {
            info!(
                temp_session_id = %temp,
                conversation_id = %conversation_id,
                migrated = migrated.len(),
                "Buffered history migrated"
            );
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use intake_core::types::{
        CandidateResponse, ChannelIdentifier, ChannelKind, Message, ResponseId,
    };
    use intake_core::IntakeError;
    use intake_storage::{from_micros, responses, to_micros, MessageStore};

    fn setup() -> (Arc<Database>, Uuid) {
        let db = Arc::new(Database::in_memory().unwrap());
        let id = db
            .with_conn(|conn| {
                responses::insert_response(
                    conn,
                    &CandidateResponse {
                        id: ResponseId::new("r_42"),
                        candidate_name: "Ada".into(),
                        vacancy_title: "Engineer".into(),
                        created_at: Utc::now(),
                    },
                )?;
                Ok::<_, IntakeError>(
                    conversations::insert_conversation(
                        conn,
                        &ResponseId::new("r_42"),
                        ChannelKind::Telegram,
                        Utc::now(),
                    )?
                    .id,
                )
            })
            .unwrap();
        (db, id)
    }

    fn buffer(db: &Database, channel: &ChannelIdentifier, messages: &[Message]) -> TempSessionId {
        db.with_conn(|conn| {
            let (temp, _) = sessions::ensure_session(conn, channel, Utc::now())?;
            for m in messages {
                EphemeralStore.append(conn, &temp, m)?;
            }
            Ok::<_, IntakeError>(temp)
        })
        .unwrap()
    }

    #[test]
    fn test_migration_preserves_order() {
        let (db, conversation_id) = setup();
        let channel = ChannelIdentifier::TelegramChatId(555);
        // Storage keeps microsecond precision.
        let t0 = from_micros(to_micros(Utc::now()));
        let sent = vec![
            Message::candidate_text("hi", t0),
            Message::bot_text("please send your code", t0),
            Message::candidate_text("need job", t0 + Duration::milliseconds(5)),
        ];
        let temp = buffer(&db, &channel, &sent);

        let migrator = MessageMigrator::new(Arc::clone(&db));
        assert_eq!(migrator.migrate(&temp, &conversation_id).unwrap().len(), 3);

        let stored = db
            .with_conn(|conn| PermanentStore.list(conn, &conversation_id))
            .unwrap();
        let messages: Vec<Message> = stored.into_iter().map(|m| m.message).collect();
        assert_eq!(messages, sent);
        assert!(db
            .with_conn(|conn| sessions::find_session(conn, &temp))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_migration_is_idempotent() {
        let (db, conversation_id) = setup();
        let temp = buffer(
            &db,
            &ChannelIdentifier::TelegramChatId(1),
            &[Message::candidate_text("hello", Utc::now())],
        );

        let migrator = MessageMigrator::new(Arc::clone(&db));
        assert_eq!(migrator.migrate(&temp, &conversation_id).unwrap().len(), 1);
        assert!(migrator.migrate(&temp, &conversation_id).unwrap().is_empty());
        assert_eq!(
            db.with_conn(|conn| PermanentStore.count(conn, &conversation_id))
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_failure_leaves_session_intact() {
        let (db, _) = setup();
        let temp = buffer(
            &db,
            &ChannelIdentifier::TelegramChatId(1),
            &[Message::candidate_text("hello", Utc::now())],
        );

        let migrator = MessageMigrator::new(Arc::clone(&db));
        let err = migrator.migrate(&temp, &Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));

        let remaining = db
            .with_conn(|conn| EphemeralStore.count(conn, &temp))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_insert_failure_midway_rolls_back_copied_rows() {
        let (db, conversation_id) = setup();
        let temp = buffer(
            &db,
            &ChannelIdentifier::TelegramChatId(7),
            &[
                Message::candidate_text("one", Utc::now()),
                Message::candidate_text("two", Utc::now() + Duration::milliseconds(1)),
                Message::candidate_text("reject me", Utc::now() + Duration::milliseconds(2)),
            ],
        );
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_insert BEFORE INSERT ON conversation_messages
                 WHEN NEW.content = 'reject me'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .map_err(|e| IntakeError::Storage(e.to_string()))
        })
        .unwrap();

        let migrator = MessageMigrator::new(Arc::clone(&db));
        let err = migrator.migrate(&temp, &conversation_id).unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));

        assert_eq!(
            db.with_conn(|conn| PermanentStore.count(conn, &conversation_id))
                .unwrap(),
            0
        );
        assert_eq!(
            db.with_conn(|conn| EphemeralStore.count(conn, &temp)).unwrap(),
            3
        );
        assert!(db
            .with_conn(|conn| sessions::find_session(conn, &temp))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_migrating_empty_session_deletes_it() {
        let (db, conversation_id) = setup();
        let temp = buffer(&db, &ChannelIdentifier::TelegramChatId(9), &[]);

        let migrator = MessageMigrator::new(Arc::clone(&db));
        assert!(migrator.migrate(&temp, &conversation_id).unwrap().is_empty());
        assert!(db
            .with_conn(|conn| sessions::find_session(conn, &temp))
            .unwrap()
            .is_none());
    }
}
