//! Unidentified (temp) sessions, one per channel.

use rusqlite::{params, Connection, OptionalExtension};

use intake_core::error::IntakeError;
use intake_core::types::{ChannelIdentifier, TempSessionId, Timestamp, UnidentifiedSession};

use crate::db::{from_micros, storage_err, to_micros};

/// Create the session for a channel if it does not exist yet.
///
/// Uses `ON CONFLICT DO NOTHING` on the channel so concurrent first
/// messages converge on one row. Returns the session id and whether this
/// call created it.
pub fn ensure_session(
    conn: &Connection,
    channel: &ChannelIdentifier,
    now: Timestamp,
) -> Result<(TempSessionId, bool), IntakeError> {
    let temp = TempSessionId::for_channel(channel);
    let changed = conn
        .execute(
            "INSERT INTO temp_sessions (temp_session_id, channel_id, channel_kind, awaiting_pin, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(channel_id) DO NOTHING",
            params![
                temp.as_str(),
                channel.key(),
                channel.kind().as_str(),
                to_micros(now),
            ],
        )
        .map_err(|e| IntakeError::Storage(format!("Failed to create temp session: {}", e)))?;
    Ok((temp, changed == 1))
}

pub fn find_session(
    conn: &Connection,
    temp: &TempSessionId,
) -> Result<Option<UnidentifiedSession>, IntakeError> {
    let row = conn
        .query_row(
            "SELECT temp_session_id, channel_id, awaiting_pin, created_at
             FROM temp_sessions WHERE temp_session_id = ?1",
            params![temp.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(storage_err)?;

    match row {
        Some((id, channel, awaiting_pin, created_at)) => Ok(Some(UnidentifiedSession {
            temp_session_id: TempSessionId::parse(&id)?,
            channel: ChannelIdentifier::parse(&channel)?,
            created_at: from_micros(created_at),
            awaiting_pin,
        })),
        None => Ok(None),
    }
}

pub fn session_exists(conn: &Connection, channel: &ChannelIdentifier) -> Result<bool, IntakeError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM temp_sessions WHERE channel_id = ?1",
            params![channel.key()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    Ok(found.is_some())
}

pub fn set_awaiting_pin(
    conn: &Connection,
    temp: &TempSessionId,
    awaiting_pin: bool,
) -> Result<(), IntakeError> {
    conn.execute(
        "UPDATE temp_sessions SET awaiting_pin = ?2 WHERE temp_session_id = ?1",
        params![temp.as_str(), awaiting_pin],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// Delete a session; its buffered messages cascade. Returns whether a row
/// was removed.
pub fn delete_session(conn: &Connection, temp: &TempSessionId) -> Result<bool, IntakeError> {
    let changed = conn
        .execute(
            "DELETE FROM temp_sessions WHERE temp_session_id = ?1",
            params![temp.as_str()],
        )
        .map_err(storage_err)?;
    Ok(changed == 1)
}

/// Delete every session created before `cutoff`.
pub fn delete_sessions_before(conn: &Connection, cutoff: Timestamp) -> Result<usize, IntakeError> {
    conn.execute(
        "DELETE FROM temp_sessions WHERE created_at < ?1",
        params![to_micros(cutoff)],
    )
    .map_err(storage_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{Duration, Utc};

    #[test]
    fn test_ensure_session_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let channel = ChannelIdentifier::TelegramChatId(555);
        db.with_conn(|conn| {
            let (first, created) = ensure_session(conn, &channel, Utc::now())?;
            assert!(created);
            let (second, created) = ensure_session(conn, &channel, Utc::now())?;
            assert!(!created);
            assert_eq!(first, second);
            assert_eq!(first.as_str(), "temp_tg:555");
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_find_session_round_trip() {
        let db = Database::in_memory().unwrap();
        let channel = ChannelIdentifier::WebSessionToken("abc123".into());
        db.with_conn(|conn| {
            let (temp, _) = ensure_session(conn, &channel, Utc::now())?;
            let session = find_session(conn, &temp)?.unwrap();
            assert_eq!(session.channel, channel);
            assert!(session.awaiting_pin);

            set_awaiting_pin(conn, &temp, false)?;
            assert!(!find_session(conn, &temp)?.unwrap().awaiting_pin);
            assert!(session_exists(conn, &channel)?);
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_sessions_before_cutoff() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            ensure_session(conn, &ChannelIdentifier::TelegramChatId(1), now - Duration::hours(48))?;
            ensure_session(conn, &ChannelIdentifier::TelegramChatId(2), now)?;

            let removed = delete_sessions_before(conn, now - Duration::hours(24))?;
            assert_eq!(removed, 1);
            assert!(!session_exists(conn, &ChannelIdentifier::TelegramChatId(1))?);
            assert!(session_exists(conn, &ChannelIdentifier::TelegramChatId(2))?);
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_missing_session() {
        let db = Database::in_memory().unwrap();
        let temp = TempSessionId::for_channel(&ChannelIdentifier::TelegramChatId(9));
        let removed = db.with_conn(|conn| delete_session(conn, &temp)).unwrap();
        assert!(!removed);
    }
}
