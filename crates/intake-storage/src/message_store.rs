//! Message persistence shared by the ephemeral and permanent schemas.
//!
//! Both stores hold the same [`Message`] value and order it by
//! `(timestamp, seq)`. The ephemeral store is keyed by temp session, the
//! permanent one by conversation id. Moving history between them is a
//! typed copy through the [`MessageStore`] trait.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use intake_core::error::IntakeError;
use intake_core::types::{
    BufferedMessage, ConversationMessage, Message, Sender, TempSessionId,
};

use crate::db::{from_micros, storage_err, to_micros};

/// A persisted record that wraps a [`Message`].
pub trait StoredMessage {
    fn message(&self) -> &Message;
}

impl StoredMessage for BufferedMessage {
    fn message(&self) -> &Message {
        &self.message
    }
}

impl StoredMessage for ConversationMessage {
    fn message(&self) -> &Message {
        &self.message
    }
}

/// Append-only, ordered message storage keyed by an owner.
pub trait MessageStore {
    type Owner: ?Sized;
    type Record: StoredMessage;

    /// Append a message. Returns `None` when the message duplicates an
    /// already-stored `external_message_id` for the same owner.
    fn append(
        &self,
        conn: &Connection,
        owner: &Self::Owner,
        message: &Message,
    ) -> Result<Option<Self::Record>, IntakeError>;

    /// All messages for an owner in `(timestamp, seq)` order.
    fn list(&self, conn: &Connection, owner: &Self::Owner) -> Result<Vec<Self::Record>, IntakeError>;

    fn count(&self, conn: &Connection, owner: &Self::Owner) -> Result<usize, IntakeError>;
}

/// Messages buffered for an unidentified session.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralStore;

impl EphemeralStore {
    /// Drop every buffered message for a session.
    pub fn delete_owner(&self, conn: &Connection, owner: &TempSessionId) -> Result<usize, IntakeError> {
        conn.execute(
            "DELETE FROM buffered_messages WHERE temp_session_id = ?1",
            params![owner.as_str()],
        )
        .map_err(storage_err)
    }
}

impl MessageStore for EphemeralStore {
    type Owner = TempSessionId;
    type Record = BufferedMessage;

    fn append(
        &self,
        conn: &Connection,
        owner: &TempSessionId,
        message: &Message,
    ) -> Result<Option<BufferedMessage>, IntakeError> {
        let id = Uuid::new_v4();
        let changed = conn
            .execute(
                "INSERT INTO buffered_messages
                     (id, temp_session_id, sender, content_type, content, external_message_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING",
                params![
                    id.to_string(),
                    owner.as_str(),
                    message.sender.as_str(),
                    message.content_type.as_str(),
                    message.content,
                    message.external_message_id,
                    to_micros(message.timestamp),
                ],
            )
            .map_err(|e| IntakeError::Storage(format!("Failed to buffer message: {}", e)))?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(BufferedMessage {
            id,
            temp_session_id: owner.clone(),
            seq: conn.last_insert_rowid(),
            message: message.clone(),
        }))
    }

    fn list(&self, conn: &Connection, owner: &TempSessionId) -> Result<Vec<BufferedMessage>, IntakeError> {
        let mut stmt = conn
            .prepare(
                "SELECT seq, id, sender, content_type, content, external_message_id, timestamp
                 FROM buffered_messages
                 WHERE temp_session_id = ?1
                 ORDER BY timestamp ASC, seq ASC",
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map(params![owner.as_str()], |row| Ok(row_to_buffered(row, owner)))
            .map_err(storage_err)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(storage_err)??);
        }
        Ok(messages)
    }

    fn count(&self, conn: &Connection, owner: &TempSessionId) -> Result<usize, IntakeError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM buffered_messages WHERE temp_session_id = ?1",
                params![owner.as_str()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }
}

/// Messages of a permanent, identity-bound conversation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermanentStore;

const PERMANENT_COLUMNS: &str =
    "seq, id, conversation_id, sender, content_type, content, external_message_id, created_at, transcript";

impl PermanentStore {
    pub fn find(&self, conn: &Connection, id: Uuid) -> Result<Option<ConversationMessage>, IntakeError> {
        let sql = format!(
            "SELECT {} FROM conversation_messages WHERE id = ?1",
            PERMANENT_COLUMNS
        );
        let result = conn
            .query_row(&sql, params![id.to_string()], |row| Ok(row_to_conversation(row)))
            .optional()
            .map_err(storage_err)?;

        match result {
            Some(message) => Ok(Some(message?)),
            None => Ok(None),
        }
    }

    /// Attach a transcript to a stored voice message.
    ///
    /// Returns the updated record, or `None` if the id is unknown.
    pub fn set_transcript(
        &self,
        conn: &Connection,
        id: Uuid,
        transcript: &str,
    ) -> Result<Option<ConversationMessage>, IntakeError> {
        let changed = conn
            .execute(
                "UPDATE conversation_messages SET transcript = ?2
                 WHERE id = ?1 AND content_type = 'voice'",
                params![id.to_string(), transcript],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Ok(None);
        }
        self.find(conn, id)
    }

    /// The most recent `limit` messages, oldest first.
    pub fn recent(
        &self,
        conn: &Connection,
        conversation_id: &Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, IntakeError> {
        let sql = format!(
            "SELECT * FROM (
                 SELECT {} FROM conversation_messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?2
             ) ORDER BY created_at ASC, seq ASC",
            PERMANENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params![conversation_id.to_string(), limit as i64], |row| {
                Ok(row_to_conversation(row))
            })
            .map_err(storage_err)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(storage_err)??);
        }
        Ok(messages)
    }

    /// Append a message arriving on a live conversation.
    ///
    /// The row is stamped by the server clock, never earlier than the
    /// newest row already stored, so channel timestamps with coarse
    /// precision cannot reorder a reply ahead of the line it answers.
    /// Must run inside the caller's transaction.
    pub fn append_live(
        &self,
        conn: &Connection,
        conversation_id: &Uuid,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationMessage>, IntakeError> {
        let last: Option<i64> = conn
            .query_row(
                "SELECT MAX(created_at) FROM conversation_messages WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        let stamp = last.map_or(to_micros(now), |last| last.max(to_micros(now)));
        let stamped = Message {
            timestamp: from_micros(stamp),
            ..message.clone()
        };
        self.append(conn, conversation_id, &stamped)
    }

    pub fn count_by_sender(
        &self,
        conn: &Connection,
        conversation_id: &Uuid,
        sender: Sender,
    ) -> Result<usize, IntakeError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversation_messages
                 WHERE conversation_id = ?1 AND sender = ?2",
                params![conversation_id.to_string(), sender.as_str()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }
}

impl MessageStore for PermanentStore {
    type Owner = Uuid;
    type Record = ConversationMessage;

    fn append(
        &self,
        conn: &Connection,
        owner: &Uuid,
        message: &Message,
    ) -> Result<Option<ConversationMessage>, IntakeError> {
        let id = Uuid::new_v4();
        let changed = conn
            .execute(
                "INSERT INTO conversation_messages
                     (id, conversation_id, sender, content_type, content, external_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING",
                params![
                    id.to_string(),
                    owner.to_string(),
                    message.sender.as_str(),
                    message.content_type.as_str(),
                    message.content,
                    message.external_message_id,
                    to_micros(message.timestamp),
                ],
            )
            .map_err(|e| IntakeError::Storage(format!("Failed to save message: {}", e)))?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(ConversationMessage {
            id,
            conversation_id: *owner,
            seq: conn.last_insert_rowid(),
            message: message.clone(),
            transcript: None,
        }))
    }

    fn list(&self, conn: &Connection, owner: &Uuid) -> Result<Vec<ConversationMessage>, IntakeError> {
        let sql = format!(
            "SELECT {} FROM conversation_messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, seq ASC",
            PERMANENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params![owner.to_string()], |row| Ok(row_to_conversation(row)))
            .map_err(storage_err)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(storage_err)??);
        }
        Ok(messages)
    }

    fn count(&self, conn: &Connection, owner: &Uuid) -> Result<usize, IntakeError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1",
                params![owner.to_string()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }
}

/// Copy every record of `owner` from one store to another, preserving order.
///
/// Returns the records written, in order. Duplicates (by external message
/// id) already present in the target are skipped.
pub fn copy_messages<S, T>(
    conn: &Connection,
    source: &S,
    source_owner: &S::Owner,
    target: &T,
    target_owner: &T::Owner,
) -> Result<Vec<T::Record>, IntakeError>
where
    S: MessageStore,
    T: MessageStore,
{
    let mut written = Vec::new();
    for record in source.list(conn, source_owner)? {
        if let Some(copied) = target.append(conn, target_owner, record.message())? {
            written.push(copied);
        }
    }
    Ok(written)
}

fn parse_uuid(raw: &str) -> Result<Uuid, IntakeError> {
    Uuid::parse_str(raw).map_err(|e| IntakeError::Storage(format!("Invalid UUID: {}", e)))
}

fn row_to_message(
    row: &Row<'_>,
    sender_idx: usize,
) -> Result<Message, IntakeError> {
    let sender: String = row.get(sender_idx).map_err(storage_err)?;
    let content_type: String = row.get(sender_idx + 1).map_err(storage_err)?;
    let timestamp: i64 = row.get(sender_idx + 4).map_err(storage_err)?;

    Ok(Message {
        sender: sender.parse()?,
        content_type: content_type.parse()?,
        content: row.get(sender_idx + 2).map_err(storage_err)?,
        external_message_id: row.get(sender_idx + 3).map_err(storage_err)?,
        timestamp: from_micros(timestamp),
    })
}

fn row_to_buffered(row: &Row<'_>, owner: &TempSessionId) -> Result<BufferedMessage, IntakeError> {
    let id: String = row.get(1).map_err(storage_err)?;
    Ok(BufferedMessage {
        id: parse_uuid(&id)?,
        temp_session_id: owner.clone(),
        seq: row.get(0).map_err(storage_err)?,
        message: row_to_message(row, 2)?,
    })
}

fn row_to_conversation(row: &Row<'_>) -> Result<ConversationMessage, IntakeError> {
    let id: String = row.get(1).map_err(storage_err)?;
    let conversation_id: String = row.get(2).map_err(storage_err)?;
    Ok(ConversationMessage {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        seq: row.get(0).map_err(storage_err)?,
        message: row_to_message(row, 3)?,
        transcript: row.get(8).map_err(storage_err)?,
    })
}
