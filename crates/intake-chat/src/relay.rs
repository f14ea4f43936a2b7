//! Outbox relay: drains durable events into the job bus.
//!
//! Rows are published with their event key and attempt number, then
//! marked dispatched once a consumer has acknowledged them. Rows whose
//! event has no registered consumer are left pending without spending an
//! attempt. A failed publish is rescheduled with exponential
//! backoff until `max_attempts`, after which the row is left in place with
//! its `last_error` for operators. One relay runs per process; consumers
//! deduplicate by key, so a crash between publish and mark is harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use intake_core::config::OutboxConfig;
use intake_core::events::JobEnvelope;
use intake_core::types::Timestamp;
use intake_storage::{outbox, Database};

use crate::error::ChatError;
use crate::jobs::JobBus;

/// Longest delay between two attempts of one row.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Counts from one relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub dispatched: usize,
    pub failed: usize,
    /// Left pending because nothing consumes the event yet.
    pub waiting: usize,
}

pub struct OutboxRelay {
    db: Arc<Database>,
    bus: Arc<dyn JobBus>,
    config: OutboxConfig,
    wake: Arc<Notify>,
}

impl OutboxRelay {
    pub fn new(db: Arc<Database>, bus: Arc<dyn JobBus>, config: OutboxConfig) -> Self {
        Self {
            db,
            bus,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle that producers use to wake the relay after a commit.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Delay before retry number `attempts + 1`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base = Duration::from_millis(self.config.base_backoff_ms);
        let factor = 1u32 << attempts.min(16);
        base.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Publish every due row once.
    pub async fn run_once(&self, now: Timestamp) -> Result<RelayStats, ChatError> {
        let max_attempts = self.config.max_attempts;
        let batch = self.config.batch_size;
        let entries = self
            .db
            .with_conn(|conn| outbox::due(conn, now, max_attempts, batch))?;

        let mut stats = RelayStats::default();
        for entry in entries {
            if !self.bus.accepts(&entry.event_name) {
                debug!(key = %entry.event_key, "No consumer for outbox event, left pending");
                stats.waiting += 1;
                continue;
            }
            let result = match entry.event() {
                Ok(event) => {
                    let envelope = JobEnvelope {
                        key: entry.event_key.clone(),
                        attempt: entry.attempts + 1,
                        event,
                    };
                    self.bus.publish(envelope).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.db
                        .with_conn(|conn| outbox::mark_dispatched(conn, entry.id, Utc::now()))?;
                    debug!(key = %entry.event_key, attempt = entry.attempts + 1, "Outbox event dispatched");
                    stats.dispatched += 1;
                }
                Err(e) => {
                    let retry_after = self.backoff(entry.attempts);
                    let retry = chrono::Duration::from_std(retry_after)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                    let error = e.to_string();
                    self.db.with_conn(|conn| {
                        outbox::mark_failed(conn, entry.id, &error, retry, Utc::now())
                    })?;
                    if entry.attempts + 1 >= max_attempts {
                        warn!(
                            key = %entry.event_key,
                            attempts = entry.attempts + 1,
                            error = %error,
                            "Outbox event gave up after max attempts"
                        );
                    } else {
                        warn!(
                            key = %entry.event_key,
                            attempt = entry.attempts + 1,
                            retry_in_ms = retry_after.as_millis() as u64,
                            error = %error,
                            "Outbox event delivery failed, will retry"
                        );
                    }
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Relay loop. Polls on an interval and whenever woken; returns when
    /// the shutdown signal flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(10));
        info!("Outbox relay started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once(Utc::now()).await {
                warn!(error = %e, "Outbox relay pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::RecordingBus;
    use crate::jobs::{JobConsumer, QueueConsumer, RoutingJobBus};
    use intake_core::events::JobEvent;
    use intake_core::IntakeError;

    fn completion(response: &str) -> JobEvent {
        JobEvent::InterviewComplete {
            response_id: response.into(),
            transcript: "candidate: hi".into(),
            reason: "tool_call".into(),
            question_count: 2,
        }
    }

    fn make_relay(bus: Arc<RecordingBus>, max_attempts: u32) -> (Arc<Database>, OutboxRelay) {
        let db = Arc::new(Database::in_memory().unwrap());
        let config = OutboxConfig {
            poll_interval_ms: 10,
            batch_size: 10,
            max_attempts,
            base_backoff_ms: 1000,
        };
        let relay = OutboxRelay::new(Arc::clone(&db), bus, config);
        (db, relay)
    }

    #[tokio::test]
    async fn test_dispatches_once() {
        let bus = Arc::new(RecordingBus::new());
        let (db, relay) = make_relay(Arc::clone(&bus), 8);
        db.with_conn(|conn| outbox::enqueue(conn, &completion("r_1"), Utc::now()))
            .unwrap();

        let stats = relay.run_once(Utc::now()).await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                dispatched: 1,
                ..RelayStats::default()
            }
        );
        let stats = relay.run_once(Utc::now()).await.unwrap();
        assert_eq!(stats, RelayStats::default());

        let events = bus.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "interview.complete:r_1");
        assert_eq!(events[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_retries_after_failure() {
        let bus = Arc::new(RecordingBus::new());
        let (db, relay) = make_relay(Arc::clone(&bus), 8);
        db.with_conn(|conn| outbox::enqueue(conn, &completion("r_1"), Utc::now()))
            .unwrap();

        bus.fail_next(1);
        let stats = relay.run_once(Utc::now()).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert!(bus.events().is_empty());

        // Not due yet.
        let stats = relay.run_once(Utc::now()).await.unwrap();
        assert_eq!(stats, RelayStats::default());

        let later = Utc::now() + chrono::Duration::seconds(5);
        let stats = relay.run_once(later).await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(bus.events()[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let bus = Arc::new(RecordingBus::new());
        let (db, relay) = make_relay(Arc::clone(&bus), 2);
        db.with_conn(|conn| outbox::enqueue(conn, &completion("r_1"), Utc::now()))
            .unwrap();

        bus.fail_next(10);
        let mut at = Utc::now();
        for _ in 0..4 {
            relay.run_once(at).await.unwrap();
            at += chrono::Duration::hours(2);
        }
        let entry = db
            .with_conn(|conn| outbox::find_by_key(conn, "interview.complete:r_1"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.attempts, 2);
        assert!(entry.last_error.is_some());
        assert!(!entry.is_dispatched());
    }

    struct Ack(std::sync::Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl JobConsumer for Ack {
        async fn accept(&self, envelope: &JobEnvelope) -> Result<(), IntakeError> {
            self.0.lock().unwrap().push(envelope.key.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_event_without_consumer_stays_pending() {
        let bus = Arc::new(RoutingJobBus::new());
        let (replies, _rx) = QueueConsumer::channel(8);
        bus.register(JobEvent::MESSAGE_SEND, Arc::new(replies));
        let db = Arc::new(Database::in_memory().unwrap());
        let relay = OutboxRelay::new(Arc::clone(&db), bus.clone(), OutboxConfig::default());
        db.with_conn(|conn| outbox::enqueue(conn, &completion("r_1"), Utc::now()))
            .unwrap();

        let stats = relay.run_once(Utc::now()).await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                waiting: 1,
                ..RelayStats::default()
            }
        );
        assert_eq!(db.with_conn(|conn| outbox::pending_count(conn)).unwrap(), 1);
        let entry = db
            .with_conn(|conn| outbox::find_by_key(conn, "interview.complete:r_1"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.attempts, 0);

        // Once scoring is attached the row goes out and is acknowledged.
        let scoring = Arc::new(Ack(std::sync::Mutex::new(Vec::new())));
        bus.register(JobEvent::INTERVIEW_COMPLETE, scoring.clone());
        let stats = relay.run_once(Utc::now()).await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(db.with_conn(|conn| outbox::pending_count(conn)).unwrap(), 0);
        assert_eq!(*scoring.0.lock().unwrap(), vec!["interview.complete:r_1".to_string()]);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let bus = Arc::new(RecordingBus::new());
        let (_db, relay) = make_relay(bus, 8);
        assert_eq!(relay.backoff(0), Duration::from_secs(1));
        assert_eq!(relay.backoff(1), Duration::from_secs(2));
        assert_eq!(relay.backoff(3), Duration::from_secs(8));
        assert_eq!(relay.backoff(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bus = Arc::new(RecordingBus::new());
        let (db, relay) = make_relay(Arc::clone(&bus), 8);
        let relay = Arc::new(relay);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let relay = Arc::clone(&relay);
            async move { relay.run(rx).await }
        });

        db.with_conn(|conn| outbox::enqueue(conn, &completion("r_2"), Utc::now()))
            .unwrap();
        relay.waker().notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(bus.count_named("interview.complete"), 1);
    }
}
