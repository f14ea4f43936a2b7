//! Periodic sweeper for stale interviews, sessions and pins.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use intake_core::config::{CompletionConfig, IdentityConfig};
use intake_core::types::{CompletionReason, Timestamp};
use intake_storage::{interviews, responses, Database};

use crate::completion::CompletionCoordinator;
use crate::error::ChatError;
use crate::unidentified::UnidentifiedSessionStore;

/// Interviews examined per sweep.
const SWEEP_BATCH: usize = 100;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub timed_out: usize,
    /// Interviews another trigger finished between listing and completing.
    pub lost_race: usize,
    pub sessions_expired: usize,
    pub pins_purged: usize,
}

pub struct TimeoutWatchdog {
    db: Arc<Database>,
    completion: Arc<CompletionCoordinator>,
    unidentified: Arc<UnidentifiedSessionStore>,
    completion_config: CompletionConfig,
    identity_config: IdentityConfig,
}

impl TimeoutWatchdog {
    pub fn new(
        db: Arc<Database>,
        completion: Arc<CompletionCoordinator>,
        unidentified: Arc<UnidentifiedSessionStore>,
        completion_config: CompletionConfig,
        identity_config: IdentityConfig,
    ) -> Self {
        Self {
            db,
            completion,
            unidentified,
            completion_config,
            identity_config,
        }
    }

    /// One sweep at `now`.
    ///
    /// Timed-out interviews go through the same completion path as every
    /// other trigger, so a sweep racing a tool call cannot double-emit.
    pub fn sweep_once(&self, now: Timestamp) -> Result<SweepStats, ChatError> {
        let mut stats = SweepStats::default();

        let timeout =
            chrono::Duration::minutes(i64::from(self.completion_config.interview_timeout_minutes));
        let stale = self
            .db
            .with_conn(|conn| interviews::active_started_before(conn, now - timeout, SWEEP_BATCH))?;

        for session in stale {
            match self
                .completion
                .complete(&session.response_id, CompletionReason::Timeout, None, now)
            {
                Ok(outcome) if outcome.already_completed => stats.lost_race += 1,
                Ok(_) => stats.timed_out += 1,
                Err(e) => {
                    warn!(response_id = %session.response_id, error = %e, "Timeout completion failed")
                }
            }
        }

        let ttl = chrono::Duration::minutes(i64::from(
            self.identity_config.unidentified_session_ttl_minutes,
        ));
        stats.sessions_expired = self.unidentified.expire(ttl, now)?;
        stats.pins_purged = self
            .db
            .with_conn(|conn| responses::purge_expired_pins(conn, now))?;

        if stats.timed_out > 0 {
            info!(timed_out = stats.timed_out, "Watchdog completed stale interviews");
        }
        Ok(stats)
    }

    /// Sweep on an interval until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.completion_config.watchdog_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Timeout watchdog started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_once(Utc::now()) {
                        Ok(stats) => debug!(?stats, "Watchdog sweep finished"),
                        Err(e) => error!(error = %e, "Watchdog sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Timeout watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use intake_core::types::{
        CandidateResponse, ChannelIdentifier, ChannelKind, IdentificationPin, InterviewStatus,
        Message, ResponseId,
    };
    use intake_core::IntakeError;
    use intake_storage::{conversations, outbox};
    use serde_json::json;

    struct Fixture {
        db: Arc<Database>,
        completion: Arc<CompletionCoordinator>,
        unidentified: Arc<UnidentifiedSessionStore>,
        watchdog: TimeoutWatchdog,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let completion = Arc::new(CompletionCoordinator::new(Arc::clone(&db)));
        let unidentified = Arc::new(UnidentifiedSessionStore::new(Arc::clone(&db)));
        let watchdog = TimeoutWatchdog::new(
            Arc::clone(&db),
            Arc::clone(&completion),
            Arc::clone(&unidentified),
            CompletionConfig {
                interview_timeout_minutes: 10,
                watchdog_interval_secs: 1,
            },
            IdentityConfig::default(),
        );
        Fixture {
            db,
            completion,
            unidentified,
            watchdog,
        }
    }

    fn start_interview(db: &Database, response: &str, started: Timestamp) {
        db.with_tx(|tx| {
            let id = ResponseId::new(response);
            responses::insert_response(
                tx,
                &CandidateResponse {
                    id: id.clone(),
                    candidate_name: "Ada".into(),
                    vacancy_title: "Engineer".into(),
                    created_at: started,
                },
            )?;
            conversations::insert_conversation(tx, &id, ChannelKind::Web, started)?;
            interviews::insert_interview(tx, &id, json!({}), started)?;
            Ok::<_, IntakeError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_sweep_times_out_stale_interviews() {
        let f = fixture();
        let now = Utc::now();
        start_interview(&f.db, "r_old", now - ChronoDuration::minutes(11));
        start_interview(&f.db, "r_new", now - ChronoDuration::minutes(2));

        let stats = f.watchdog.sweep_once(now).unwrap();
        assert_eq!(stats.timed_out, 1);

        let old = f
            .db
            .with_conn(|conn| interviews::latest_interview(conn, &ResponseId::new("r_old")))
            .unwrap()
            .unwrap();
        assert_eq!(old.status, InterviewStatus::Completed);
        assert_eq!(old.finish_reason.as_deref(), Some("timeout"));

        let fresh = f
            .db
            .with_conn(|conn| interviews::latest_interview(conn, &ResponseId::new("r_new")))
            .unwrap()
            .unwrap();
        assert_eq!(fresh.status, InterviewStatus::Active);

        // A second sweep finds nothing left to do.
        assert_eq!(f.watchdog.sweep_once(now).unwrap().timed_out, 0);
        assert_eq!(f.db.with_conn(|conn| outbox::pending_count(conn)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_racing_watchdog_emits_once() {
        let f = fixture();
        let now = Utc::now();
        start_interview(&f.db, "r_race", now - ChronoDuration::minutes(30));

        let completion = Arc::clone(&f.completion);
        let tool_call = tokio::task::spawn_blocking(move || {
            completion
                .complete(&ResponseId::new("r_race"), CompletionReason::ToolCall, None, now)
                .unwrap()
        });
        let stats = f.watchdog.sweep_once(now).unwrap();
        let outcome = tool_call.await.unwrap();

        let winners = stats.timed_out + usize::from(!outcome.already_completed);
        assert_eq!(winners, 1);
        assert_eq!(f.db.with_conn(|conn| outbox::pending_count(conn)).unwrap(), 1);
    }

    #[test]
    fn test_sweep_expires_sessions_and_pins() {
        let f = fixture();
        let now = Utc::now();
        f.unidentified
            .append_message(
                &ChannelIdentifier::TelegramChatId(1),
                &Message::candidate_text("hello", now - ChronoDuration::days(2)),
            )
            .unwrap();
        start_interview(&f.db, "r_pin", now);
        f.db.with_conn(|conn| {
            responses::insert_pin(
                conn,
                &IdentificationPin {
                    pin: "4321".into(),
                    response_id: ResponseId::new("r_pin"),
                    expires_at: now - ChronoDuration::minutes(1),
                    consumed_by: None,
                    consumed_at: None,
                },
                now - ChronoDuration::days(8),
            )
        })
        .unwrap();

        let stats = f.watchdog.sweep_once(now).unwrap();
        assert_eq!(stats.sessions_expired, 1);
        assert_eq!(stats.pins_purged, 1);
        assert!(!f
            .unidentified
            .exists(&ChannelIdentifier::TelegramChatId(1))
            .unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let watchdog = Arc::new(f.watchdog);
        let handle = tokio::spawn({
            let watchdog = Arc::clone(&watchdog);
            async move { watchdog.run(rx).await }
        });
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
