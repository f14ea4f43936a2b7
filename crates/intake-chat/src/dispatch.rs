//! The two ways the pipeline emits events.
//!
//! `send_best_effort` is for events whose loss is tolerable (outbound
//! replies, transcription triggers): failures are logged and swallowed.
//! `enqueue_durable` writes to the outbox inside the caller's transaction
//! and is used for anything that must eventually be delivered.

use tracing::{debug, warn};

use intake_core::error::IntakeError;
use intake_core::events::{JobEnvelope, JobEvent};
use intake_core::types::Timestamp;
use intake_storage::{outbox, Connection};

use crate::jobs::JobBus;

/// Publish an event without retry. Never fails the caller.
pub async fn send_best_effort(bus: &dyn JobBus, event: JobEvent) {
    let name = event.name();
    let key = event.key();
    if let Err(e) = bus.publish(JobEnvelope::first_attempt(event)).await {
        warn!(event = name, key = %key, error = %e, "Best-effort event dropped");
    }
}

/// Write an event to the outbox as part of the current transaction.
///
/// Returns false if an event with the same key is already queued, which
/// makes repeated calls for the same logical event harmless.
pub fn enqueue_durable(
    conn: &Connection,
    event: &JobEvent,
    now: Timestamp,
) -> Result<bool, IntakeError> {
    let inserted = outbox::enqueue(conn, event, now)?;
    if inserted {
        debug!(event = event.name(), key = %event.key(), "Event queued in outbox");
    } else {
        debug!(key = %event.key(), "Event already queued, skipping");
    }
    Ok(inserted)
}
