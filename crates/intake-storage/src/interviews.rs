//! Interview session lifecycle overlay.

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use intake_core::error::IntakeError;
use intake_core::types::{InterviewSession, InterviewStatus, ResponseId, Timestamp};

use crate::db::{from_micros, storage_err, to_micros};

const COLUMNS: &str = "id, response_id, status, metadata, started_at, finished_at, finish_reason";

/// Start an ACTIVE interview for a response.
///
/// The partial unique index rejects a second ACTIVE interview for the
/// same response; that surfaces as a storage error.
pub fn insert_interview(
    conn: &Connection,
    response_id: &ResponseId,
    metadata: serde_json::Value,
    now: Timestamp,
) -> Result<InterviewSession, IntakeError> {
    let session = InterviewSession {
        id: Uuid::new_v4(),
        response_id: response_id.clone(),
        status: InterviewStatus::Active,
        metadata,
        started_at: now,
        finished_at: None,
        finish_reason: None,
    };
    conn.execute(
        "INSERT INTO interview_sessions (id, response_id, status, metadata, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            session.id.to_string(),
            response_id.as_str(),
            session.status.as_str(),
            serde_json::to_string(&session.metadata)?,
            to_micros(now),
        ],
    )
    .map_err(|e| IntakeError::Storage(format!("Failed to start interview: {}", e)))?;
    Ok(session)
}

/// The most recently started interview for a response, in any state.
pub fn latest_interview(
    conn: &Connection,
    response_id: &ResponseId,
) -> Result<Option<InterviewSession>, IntakeError> {
    let sql = format!(
        "SELECT {} FROM interview_sessions
         WHERE response_id = ?1
         ORDER BY started_at DESC, rowid DESC
         LIMIT 1",
        COLUMNS
    );
    let result = conn
        .query_row(&sql, params![response_id.as_str()], |row| Ok(row_to_interview(row)))
        .optional()
        .map_err(storage_err)?;

    match result {
        Some(session) => Ok(Some(session?)),
        None => Ok(None),
    }
}

/// Compare-and-set an ACTIVE interview into a terminal state.
///
/// Returns true only for the caller whose update flipped the row; every
/// concurrent or later caller sees false.
pub fn finish_interview(
    conn: &Connection,
    id: &Uuid,
    to: InterviewStatus,
    reason: &str,
    now: Timestamp,
) -> Result<bool, IntakeError> {
    let changed = conn
        .execute(
            "UPDATE interview_sessions
             SET status = ?2, finished_at = ?3, finish_reason = ?4
             WHERE id = ?1 AND status = 'active'",
            params![id.to_string(), to.as_str(), to_micros(now), reason],
        )
        .map_err(storage_err)?;
    Ok(changed == 1)
}

/// ACTIVE interviews that started before `cutoff`, oldest first.
pub fn active_started_before(
    conn: &Connection,
    cutoff: Timestamp,
    limit: usize,
) -> Result<Vec<InterviewSession>, IntakeError> {
    let sql = format!(
        "SELECT {} FROM interview_sessions
         WHERE status = 'active' AND started_at < ?1
         ORDER BY started_at ASC
         LIMIT ?2",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params![to_micros(cutoff), limit as i64], |row| {
            Ok(row_to_interview(row))
        })
        .map_err(storage_err)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row.map_err(storage_err)??);
    }
    Ok(sessions)
}

fn row_to_interview(row: &Row<'_>) -> Result<InterviewSession, IntakeError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let response_id: String = row.get(1).map_err(storage_err)?;
    let status: String = row.get(2).map_err(storage_err)?;
    let metadata: String = row.get(3).map_err(storage_err)?;
    let started_at: i64 = row.get(4).map_err(storage_err)?;
    let finished_at: Option<i64> = row.get(5).map_err(storage_err)?;

    Ok(InterviewSession {
        id: Uuid::parse_str(&id)
            .map_err(|e| IntakeError::Storage(format!("Invalid UUID: {}", e)))?,
        response_id: ResponseId::new(response_id),
        status: status.parse()?,
        metadata: serde_json::from_str(&metadata)?,
        started_at: from_micros(started_at),
        finished_at: finished_at.map(from_micros),
        finish_reason: row.get(6).map_err(storage_err)?,
    })
}
