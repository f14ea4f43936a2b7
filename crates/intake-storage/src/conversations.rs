//! Permanent conversations and channel bindings.

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use intake_core::error::IntakeError;
use intake_core::types::{
    ChannelBinding, ChannelIdentifier, ChannelKind, Conversation, ConversationStatus, ResponseId,
    Timestamp,
};

use crate::db::{from_micros, storage_err, to_micros};

/// Create a new ACTIVE conversation for a response.
///
/// Fails with a storage error if the response already has one.
pub fn insert_conversation(
    conn: &Connection,
    response_id: &ResponseId,
    channel_kind: ChannelKind,
    now: Timestamp,
) -> Result<Conversation, IntakeError> {
    let conversation = Conversation {
        id: Uuid::new_v4(),
        response_id: response_id.clone(),
        channel_kind,
        status: ConversationStatus::Active,
        created_at: now,
    };
    conn.execute(
        "INSERT INTO conversations (id, response_id, channel_kind, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            conversation.id.to_string(),
            response_id.as_str(),
            channel_kind.as_str(),
            conversation.status.as_str(),
            to_micros(now),
        ],
    )
    .map_err(|e| IntakeError::Storage(format!("Failed to create conversation: {}", e)))?;
    Ok(conversation)
}

pub fn find_conversation(conn: &Connection, id: &Uuid) -> Result<Option<Conversation>, IntakeError> {
    query_one(
        conn,
        "SELECT id, response_id, channel_kind, status, created_at
         FROM conversations WHERE id = ?1",
        &id.to_string(),
    )
}

pub fn find_conversation_by_response(
    conn: &Connection,
    response_id: &ResponseId,
) -> Result<Option<Conversation>, IntakeError> {
    query_one(
        conn,
        "SELECT id, response_id, channel_kind, status, created_at
         FROM conversations WHERE response_id = ?1",
        response_id.as_str(),
    )
}

/// Compare-and-set the conversation status.
///
/// Returns true only if the row was in `from` and is now in `to`.
pub fn transition_conversation(
    conn: &Connection,
    id: &Uuid,
    from: ConversationStatus,
    to: ConversationStatus,
) -> Result<bool, IntakeError> {
    let changed = conn
        .execute(
            "UPDATE conversations SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![id.to_string(), from.as_str(), to.as_str()],
        )
        .map_err(storage_err)?;
    Ok(changed == 1)
}

/// Bind a channel to a response. Rebinding the same channel to the same
/// response is a no-op; the caller checks for conflicts first.
pub fn bind_channel(
    conn: &Connection,
    channel: &ChannelIdentifier,
    response_id: &ResponseId,
    conversation_id: &Uuid,
    now: Timestamp,
) -> Result<ChannelBinding, IntakeError> {
    conn.execute(
        "INSERT INTO channel_bindings (channel_id, response_id, conversation_id, bound_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(channel_id) DO NOTHING",
        params![
            channel.key(),
            response_id.as_str(),
            conversation_id.to_string(),
            to_micros(now),
        ],
    )
    .map_err(|e| IntakeError::Storage(format!("Failed to bind channel: {}", e)))?;

    find_binding(conn, channel)?.ok_or_else(|| {
        IntakeError::Storage(format!("Binding for {} vanished after insert", channel))
    })
}

pub fn find_binding(
    conn: &Connection,
    channel: &ChannelIdentifier,
) -> Result<Option<ChannelBinding>, IntakeError> {
    let result = conn
        .query_row(
            "SELECT channel_id, response_id, conversation_id, bound_at
             FROM channel_bindings WHERE channel_id = ?1",
            params![channel.key()],
            |row| Ok(row_to_binding(row)),
        )
        .optional()
        .map_err(storage_err)?;

    match result {
        Some(binding) => Ok(Some(binding?)),
        None => Ok(None),
    }
}

/// Every channel currently bound to a response.
pub fn bindings_for_response(
    conn: &Connection,
    response_id: &ResponseId,
) -> Result<Vec<ChannelBinding>, IntakeError> {
    let mut stmt = conn
        .prepare(
            "SELECT channel_id, response_id, conversation_id, bound_at
             FROM channel_bindings WHERE response_id = ?1
             ORDER BY bound_at ASC",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![response_id.as_str()], |row| Ok(row_to_binding(row)))
        .map_err(storage_err)?;

    let mut bindings = Vec::new();
    for row in rows {
        bindings.push(row.map_err(storage_err)??);
    }
    Ok(bindings)
}

/// Drop every binding of a response except the one for `keep`.
///
/// Returns the channels that were released.
pub fn release_other_bindings(
    conn: &Connection,
    response_id: &ResponseId,
    keep: &ChannelIdentifier,
) -> Result<Vec<ChannelIdentifier>, IntakeError> {
    let released: Vec<ChannelIdentifier> = bindings_for_response(conn, response_id)?
        .into_iter()
        .map(|b| b.channel)
        .filter(|channel| channel != keep)
        .collect();
    for channel in &released {
        conn.execute(
            "DELETE FROM channel_bindings WHERE channel_id = ?1",
            params![channel.key()],
        )
        .map_err(storage_err)?;
    }
    Ok(released)
}

fn query_one(conn: &Connection, sql: &str, key: &str) -> Result<Option<Conversation>, IntakeError> {
    let result = conn
        .query_row(sql, params![key], |row| Ok(row_to_conversation(row)))
        .optional()
        .map_err(storage_err)?;

    match result {
        Some(conversation) => Ok(Some(conversation?)),
        None => Ok(None),
    }
}

fn row_to_conversation(row: &Row<'_>) -> Result<Conversation, IntakeError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let response_id: String = row.get(1).map_err(storage_err)?;
    let channel_kind: String = row.get(2).map_err(storage_err)?;
    let status: String = row.get(3).map_err(storage_err)?;
    let created_at: i64 = row.get(4).map_err(storage_err)?;

    Ok(Conversation {
        id: Uuid::parse_str(&id)
            .map_err(|e| IntakeError::Storage(format!("Invalid UUID: {}", e)))?,
        response_id: ResponseId::new(response_id),
        channel_kind: channel_kind.parse()?,
        status: status.parse()?,
        created_at: from_micros(created_at),
    })
}

fn row_to_binding(row: &Row<'_>) -> Result<ChannelBinding, IntakeError> {
    let channel: String = row.get(0).map_err(storage_err)?;
    let response_id: String = row.get(1).map_err(storage_err)?;
    let conversation_id: String = row.get(2).map_err(storage_err)?;
    let bound_at: i64 = row.get(3).map_err(storage_err)?;

    Ok(ChannelBinding {
        channel: ChannelIdentifier::parse(&channel)?,
        response_id: ResponseId::new(response_id),
        conversation_id: Uuid::parse_str(&conversation_id)
            .map_err(|e| IntakeError::Storage(format!("Invalid UUID: {}", e)))?,
        bound_at: from_micros(bound_at),
    })
}
