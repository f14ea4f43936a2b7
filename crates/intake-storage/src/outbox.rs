//! Transactional outbox for durable job events.
//!
//! Events are written in the same transaction as the state change that
//! produced them and later relayed to the job bus. `event_key` is unique,
//! so enqueueing the same logical event twice is a no-op.

use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension, Row};

use intake_core::error::IntakeError;
use intake_core::events::JobEvent;
use intake_core::types::Timestamp;

use crate::db::{from_micros, storage_err, to_micros};

/// A row in the job outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    pub event_key: String,
    pub event_name: String,
    pub payload: String,
    pub attempts: u32,
    pub next_attempt_at: Timestamp,
    pub dispatched_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
}

impl OutboxEntry {
    /// Decode the stored event payload.
    pub fn event(&self) -> Result<JobEvent, IntakeError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

const COLUMNS: &str = "id, event_key, event_name, payload, attempts, next_attempt_at, \
                       dispatched_at, last_error, created_at";

/// Insert an event. Returns false if an event with the same key exists.
pub fn enqueue(conn: &Connection, event: &JobEvent, now: Timestamp) -> Result<bool, IntakeError> {
    let payload = serde_json::to_string(event)?;
    let changed = conn
        .execute(
            "INSERT INTO job_outbox (event_key, event_name, payload, next_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(event_key) DO NOTHING",
            params![event.key(), event.name(), payload, to_micros(now)],
        )
        .map_err(|e| IntakeError::Storage(format!("Failed to enqueue event: {}", e)))?;
    Ok(changed == 1)
}

/// Undispatched rows whose next attempt is due, oldest first.
///
/// Rows that have used up `max_attempts` are left for operators.
pub fn due(
    conn: &Connection,
    now: Timestamp,
    max_attempts: u32,
    limit: usize,
) -> Result<Vec<OutboxEntry>, IntakeError> {
    let sql = format!(
        "SELECT {} FROM job_outbox
         WHERE dispatched_at IS NULL AND next_attempt_at <= ?1 AND attempts < ?2
         ORDER BY next_attempt_at ASC, id ASC
         LIMIT ?3",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(
            params![to_micros(now), max_attempts, limit as i64],
            |row| Ok(row_to_entry(row)),
        )
        .map_err(storage_err)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.map_err(storage_err)??);
    }
    Ok(entries)
}

/// Mark a row dispatched. Returns false if it was already dispatched.
pub fn mark_dispatched(conn: &Connection, id: i64, now: Timestamp) -> Result<bool, IntakeError> {
    let changed = conn
        .execute(
            "UPDATE job_outbox
             SET dispatched_at = ?2, attempts = attempts + 1, last_error = NULL
             WHERE id = ?1 AND dispatched_at IS NULL",
            params![id, to_micros(now)],
        )
        .map_err(storage_err)?;
    Ok(changed == 1)
}

/// Record a failed delivery attempt and schedule the next one.
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error: &str,
    retry_after: Duration,
    now: Timestamp,
) -> Result<(), IntakeError> {
    conn.execute(
        "UPDATE job_outbox
         SET attempts = attempts + 1, last_error = ?2, next_attempt_at = ?3
         WHERE id = ?1 AND dispatched_at IS NULL",
        params![id, error, to_micros(now + retry_after)],
    )
    .map_err(storage_err)?;
    Ok(())
}

pub fn find_by_key(conn: &Connection, key: &str) -> Result<Option<OutboxEntry>, IntakeError> {
    let sql = format!("SELECT {} FROM job_outbox WHERE event_key = ?1", COLUMNS);
    let result = conn
        .query_row(&sql, params![key], |row| Ok(row_to_entry(row)))
        .optional()
        .map_err(storage_err)?;

    match result {
        Some(entry) => Ok(Some(entry?)),
        None => Ok(None),
    }
}

/// Number of rows not yet dispatched.
pub fn pending_count(conn: &Connection) -> Result<usize, IntakeError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM job_outbox WHERE dispatched_at IS NULL",
            [],
            |row| row.get(0),
        )
        .map_err(storage_err)?;
    Ok(count as usize)
}

fn row_to_entry(row: &Row<'_>) -> Result<OutboxEntry, IntakeError> {
    let next_attempt_at: i64 = row.get(5).map_err(storage_err)?;
    let dispatched_at: Option<i64> = row.get(6).map_err(storage_err)?;
    let created_at: i64 = row.get(8).map_err(storage_err)?;

    Ok(OutboxEntry {
        id: row.get(0).map_err(storage_err)?,
        event_key: row.get(1).map_err(storage_err)?,
        event_name: row.get(2).map_err(storage_err)?,
        payload: row.get(3).map_err(storage_err)?,
        attempts: row.get(4).map_err(storage_err)?,
        next_attempt_at: from_micros(next_attempt_at),
        dispatched_at: dispatched_at.map(from_micros),
        last_error: row.get(7).map_err(storage_err)?,
        created_at: from_micros(created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Utc;

    fn completion(response: &str) -> JobEvent {
        JobEvent::InterviewComplete {
            response_id: response.into(),
            transcript: "bot: hi\ncandidate: hello".into(),
            reason: "tool_call".into(),
            question_count: 1,
        }
    }

    #[test]
    fn test_enqueue_is_keyed() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            assert!(enqueue(conn, &completion("r_1"), Utc::now())?);
            assert!(!enqueue(conn, &completion("r_1"), Utc::now())?);
            assert!(enqueue(conn, &completion("r_2"), Utc::now())?);
            assert_eq!(pending_count(conn)?, 2);

            let entry = find_by_key(conn, "interview.complete:r_1")?.unwrap();
            assert_eq!(entry.event_name, "interview.complete");
            assert_eq!(entry.event()?, completion("r_1"));
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_dispatch_once() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            enqueue(conn, &completion("r_1"), Utc::now())?;
            let entry = due(conn, Utc::now(), 8, 10)?.remove(0);

            assert!(mark_dispatched(conn, entry.id, Utc::now())?);
            assert!(!mark_dispatched(conn, entry.id, Utc::now())?);
            assert!(due(conn, Utc::now(), 8, 10)?.is_empty());
            assert_eq!(pending_count(conn)?, 0);
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_failed_rows_are_rescheduled_and_parked() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            enqueue(conn, &completion("r_1"), now)?;
            let id = due(conn, now, 2, 10)?[0].id;

            mark_failed(conn, id, "bus closed", Duration::seconds(30), now)?;
            assert!(due(conn, now, 2, 10)?.is_empty());

            let later = now + Duration::seconds(31);
            let retry = due(conn, later, 2, 10)?;
            assert_eq!(retry.len(), 1);
            assert_eq!(retry[0].attempts, 1);
            assert_eq!(retry[0].last_error.as_deref(), Some("bus closed"));

            mark_failed(conn, id, "bus closed", Duration::seconds(30), later)?;
            // Out of attempts: parked, still pending for operators.
            assert!(due(conn, later + Duration::minutes(5), 2, 10)?.is_empty());
            assert_eq!(pending_count(conn)?, 1);
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }
}
