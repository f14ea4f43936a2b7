//! Candidate response records and their identification pins.
//!
//! All functions take a `&Connection` so they can run either standalone
//! through [`Database::with_conn`](crate::Database::with_conn) or inside a
//! caller's transaction.

use rusqlite::{params, Connection, OptionalExtension};

use intake_core::error::IntakeError;
use intake_core::types::{
    CandidateResponse, IdentificationPin, ResponseId, TempSessionId, Timestamp,
};

use crate::db::{from_micros, storage_err, to_micros};

/// Insert a candidate response. Returns false if the id already exists.
pub fn insert_response(conn: &Connection, response: &CandidateResponse) -> Result<bool, IntakeError> {
    let changed = conn
        .execute(
            "INSERT INTO candidate_responses (id, candidate_name, vacancy_title, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![
                response.id.as_str(),
                response.candidate_name,
                response.vacancy_title,
                to_micros(response.created_at),
            ],
        )
        .map_err(|e| IntakeError::Storage(format!("Failed to save response: {}", e)))?;
    Ok(changed == 1)
}

pub fn find_response(
    conn: &Connection,
    id: &ResponseId,
) -> Result<Option<CandidateResponse>, IntakeError> {
    conn.query_row(
        "SELECT id, candidate_name, vacancy_title, created_at
         FROM candidate_responses WHERE id = ?1",
        params![id.as_str()],
        |row| {
            Ok(CandidateResponse {
                id: ResponseId::new(row.get::<_, String>(0)?),
                candidate_name: row.get(1)?,
                vacancy_title: row.get(2)?,
                created_at: from_micros(row.get(3)?),
            })
        },
    )
    .optional()
    .map_err(storage_err)
}

/// Insert a new pin. Returns false if the pin value is already taken.
pub fn insert_pin(
    conn: &Connection,
    pin: &IdentificationPin,
    now: Timestamp,
) -> Result<bool, IntakeError> {
    let changed = conn
        .execute(
            "INSERT INTO identification_pins (pin, response_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(pin) DO NOTHING",
            params![
                pin.pin,
                pin.response_id.as_str(),
                to_micros(pin.expires_at),
                to_micros(now),
            ],
        )
        .map_err(|e| IntakeError::Storage(format!("Failed to save pin: {}", e)))?;
    Ok(changed == 1)
}

/// Drop pins that expired without being consumed, freeing their values
/// for reissue. Consumed pins are kept so resolve retries stay idempotent.
pub fn purge_expired_pins(conn: &Connection, now: Timestamp) -> Result<usize, IntakeError> {
    conn.execute(
        "DELETE FROM identification_pins
         WHERE consumed_by IS NULL AND expires_at <= ?1",
        params![to_micros(now)],
    )
    .map_err(storage_err)
}

pub fn find_pin(conn: &Connection, pin: &str) -> Result<Option<IdentificationPin>, IntakeError> {
    let row = conn
        .query_row(
            "SELECT pin, response_id, expires_at, consumed_by, consumed_at
             FROM identification_pins WHERE pin = ?1",
            params![pin],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )
        .optional()
        .map_err(storage_err)?;

    match row {
        Some((pin, response_id, expires_at, consumed_by, consumed_at)) => {
            Ok(Some(IdentificationPin {
                pin,
                response_id: ResponseId::new(response_id),
                expires_at: from_micros(expires_at),
                consumed_by: consumed_by
                    .as_deref()
                    .map(TempSessionId::parse)
                    .transpose()?,
                consumed_at: consumed_at.map(from_micros),
            }))
        }
        None => Ok(None),
    }
}

/// Mark a pin consumed by a temp session.
///
/// Only succeeds while the pin is unconsumed; returns false if another
/// session got there first.
pub fn consume_pin(
    conn: &Connection,
    pin: &str,
    consumed_by: &TempSessionId,
    now: Timestamp,
) -> Result<bool, IntakeError> {
    let changed = conn
        .execute(
            "UPDATE identification_pins
             SET consumed_by = ?2, consumed_at = ?3
             WHERE pin = ?1 AND consumed_by IS NULL",
            params![pin, consumed_by.as_str(), to_micros(now)],
        )
        .map_err(storage_err)?;
    Ok(changed == 1)
}
