//! Database schema migrations.
//!
//! Applies the initial schema: the ephemeral holding tables for
//! unidentified sessions, the permanent conversation tables, interview
//! sessions, pins, channel bindings, and the transactional job outbox.

use rusqlite::Connection;
use tracing::info;

use intake_core::error::IntakeError;

/// Run all pending database migrations.
///
/// Currently implements the initial schema (version 1). Future migrations
/// can be added by checking the current version and applying incremental changes.
pub fn run_migrations(conn: &Connection) -> Result<(), IntakeError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| IntakeError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| IntakeError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
///
/// Timestamps are epoch microseconds. `seq` columns are AUTOINCREMENT so
/// they never reuse a value, which keeps `(timestamp, seq)` a total order.
fn apply_v1(conn: &Connection) -> Result<(), IntakeError> {
    conn.execute_batch(
        "
        -- Candidate responses (owned by the recruiting side).
        CREATE TABLE IF NOT EXISTS candidate_responses (
            id              TEXT PRIMARY KEY NOT NULL,
            candidate_name  TEXT NOT NULL DEFAULT '',
            vacancy_title   TEXT NOT NULL DEFAULT '',
            created_at      INTEGER NOT NULL
        );

        -- Single-use identification pins.
        CREATE TABLE IF NOT EXISTS identification_pins (
            pin             TEXT PRIMARY KEY NOT NULL,
            response_id     TEXT NOT NULL,
            expires_at      INTEGER NOT NULL,
            consumed_by     TEXT,
            consumed_at     INTEGER,
            created_at      INTEGER NOT NULL,
            FOREIGN KEY (response_id) REFERENCES candidate_responses(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_pins_response
            ON identification_pins (response_id);

        -- Ephemeral: unidentified sessions, one per channel.
        CREATE TABLE IF NOT EXISTS temp_sessions (
            temp_session_id TEXT PRIMARY KEY NOT NULL,
            channel_id      TEXT NOT NULL UNIQUE,
            channel_kind    TEXT NOT NULL
                            CHECK (channel_kind IN ('telegram', 'web')),
            awaiting_pin    INTEGER NOT NULL DEFAULT 1,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_temp_sessions_created
            ON temp_sessions (created_at ASC);

        -- Ephemeral: messages buffered before identification.
        CREATE TABLE IF NOT EXISTS buffered_messages (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            id                  TEXT NOT NULL UNIQUE,
            temp_session_id     TEXT NOT NULL,
            sender              TEXT NOT NULL
                                CHECK (sender IN ('candidate', 'bot')),
            content_type        TEXT NOT NULL
                                CHECK (content_type IN ('text', 'voice')),
            content             TEXT NOT NULL,
            external_message_id TEXT,
            timestamp           INTEGER NOT NULL,
            FOREIGN KEY (temp_session_id) REFERENCES temp_sessions(temp_session_id)
                ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_buffered_order
            ON buffered_messages (temp_session_id, timestamp ASC, seq ASC);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_buffered_external
            ON buffered_messages (temp_session_id, external_message_id)
            WHERE external_message_id IS NOT NULL;

        -- Permanent: identity-bound conversations, one per response.
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY NOT NULL,
            response_id     TEXT NOT NULL UNIQUE,
            channel_kind    TEXT NOT NULL
                            CHECK (channel_kind IN ('telegram', 'web')),
            status          TEXT NOT NULL DEFAULT 'active'
                            CHECK (status IN ('active', 'completed', 'cancelled')),
            created_at      INTEGER NOT NULL,
            FOREIGN KEY (response_id) REFERENCES candidate_responses(id)
        );

        -- Permanent: conversation messages. Never reference a channel id.
        CREATE TABLE IF NOT EXISTS conversation_messages (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            id                  TEXT NOT NULL UNIQUE,
            conversation_id     TEXT NOT NULL,
            sender              TEXT NOT NULL
                                CHECK (sender IN ('candidate', 'bot')),
            content_type        TEXT NOT NULL
                                CHECK (content_type IN ('text', 'voice')),
            content             TEXT NOT NULL,
            external_message_id TEXT,
            transcript          TEXT,
            created_at          INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversation_messages_order
            ON conversation_messages (conversation_id, created_at ASC, seq ASC);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversation_messages_external
            ON conversation_messages (conversation_id, external_message_id)
            WHERE external_message_id IS NOT NULL;

        -- Transport identity bound to a response for the physical session.
        CREATE TABLE IF NOT EXISTS channel_bindings (
            channel_id      TEXT PRIMARY KEY NOT NULL,
            response_id     TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            bound_at        INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id)
        );

        CREATE INDEX IF NOT EXISTS idx_channel_bindings_response
            ON channel_bindings (response_id);

        -- Interview lifecycle overlay.
        CREATE TABLE IF NOT EXISTS interview_sessions (
            id              TEXT PRIMARY KEY NOT NULL,
            response_id     TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'active'
                            CHECK (status IN ('active', 'completed', 'cancelled')),
            metadata        TEXT NOT NULL DEFAULT '{}',
            started_at      INTEGER NOT NULL,
            finished_at     INTEGER,
            finish_reason   TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_interview_sessions_one_active
            ON interview_sessions (response_id)
            WHERE status = 'active';

        CREATE INDEX IF NOT EXISTS idx_interview_sessions_started
            ON interview_sessions (status, started_at ASC);

        -- Transactional outbox for durable events.
        CREATE TABLE IF NOT EXISTS job_outbox (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            event_key       TEXT NOT NULL UNIQUE,
            event_name      TEXT NOT NULL,
            payload         TEXT NOT NULL,
            attempts        INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            dispatched_at   INTEGER,
            last_error      TEXT,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_job_outbox_pending
            ON job_outbox (next_attempt_at ASC)
            WHERE dispatched_at IS NULL;

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| IntakeError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_successfully() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_buffered_messages_cascade_with_session() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO temp_sessions (temp_session_id, channel_id, channel_kind, created_at)
             VALUES ('temp_tg:1', 'tg:1', 'telegram', 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO buffered_messages (id, temp_session_id, sender, content_type, content, timestamp)
             VALUES ('m1', 'temp_tg:1', 'candidate', 'text', 'hi', 0)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM temp_sessions WHERE temp_session_id = 'temp_tg:1'", [])
            .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM buffered_messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_one_active_interview_per_response() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO interview_sessions (id, response_id, started_at) VALUES ('a', 'r_1', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO interview_sessions (id, response_id, started_at) VALUES ('b', 'r_1', 1)",
            [],
        );
        assert!(dup.is_err());

        conn.execute(
            "UPDATE interview_sessions SET status = 'completed' WHERE id = 'a'",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO interview_sessions (id, response_id, started_at) VALUES ('b', 'r_1', 1)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_conversation_status_check() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO candidate_responses (id, created_at) VALUES ('r_1', 0)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO conversations (id, response_id, channel_kind, status, created_at)
             VALUES ('c1', 'r_1', 'telegram', 'paused', 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_outbox_event_key_unique() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO job_outbox (event_key, event_name, payload, next_attempt_at, created_at)
                      VALUES ('interview.complete:r_1', 'interview.complete', '{}', 0, 0)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
