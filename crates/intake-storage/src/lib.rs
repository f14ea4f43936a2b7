//! Intake Storage crate - SQLite persistence for the conversation pipeline.
//!
//! Provides a WAL-mode SQLite database with migrations, the ephemeral and
//! permanent message stores, repositories for sessions, conversations,
//! interviews, pins and bindings, and the transactional job outbox.
//!
//! Repository functions take a `&Connection` so a pipeline step can compose
//! several of them inside one [`Database::with_tx`] call.

pub mod conversations;
pub mod db;
pub mod interviews;
pub mod message_store;
pub mod migrations;
pub mod outbox;
pub mod responses;
pub mod sessions;

pub use db::{from_micros, to_micros, Database};
pub use message_store::{
    copy_messages, EphemeralStore, MessageStore, PermanentStore, StoredMessage,
};
pub use outbox::OutboxEntry;
pub use rusqlite::Connection;
