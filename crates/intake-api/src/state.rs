//! Application state shared across all route handlers.
//!
//! AppState wires the conversation pipeline together once at startup and
//! is passed to handlers via axum's State extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

use intake_channels::{TelegramAdapter, WebAdapter};
use intake_chat::{
    AiResponder, ChannelGateway, CompletionCoordinator, ConversationOrchestrator,
    IdentityResolver, JobBus, MessageMigrator, RateLimiter, UnidentifiedSessionStore,
};
use intake_core::config::IntakeConfig;
use intake_storage::Database;

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (read-only after startup).
    pub config: Arc<IntakeConfig>,
    /// SQLite database for persistent storage.
    pub database: Arc<Database>,
    /// Job bus used for side effects.
    pub bus: Arc<dyn JobBus>,
    /// Entry point for every inbound channel message.
    pub gateway: Arc<ChannelGateway>,
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub identity: Arc<IdentityResolver>,
    pub completion: Arc<CompletionCoordinator>,
    /// Buffered pre-identification sessions, swept by the watchdog.
    pub unidentified: Arc<UnidentifiedSessionStore>,
    pub telegram: Arc<TelegramAdapter>,
    pub web: Arc<WebAdapter>,
    /// Limiter shared by HTTP route groups and AI turns.
    pub limiter: Arc<dyn RateLimiter>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Build the pipeline around a database, job bus, responder and limiter.
    ///
    /// `relay_waker`, when given, is notified after each completion commits
    /// so the outbox relay dispatches without waiting for its next poll.
    pub fn new(
        config: IntakeConfig,
        database: Arc<Database>,
        bus: Arc<dyn JobBus>,
        responder: Arc<dyn AiResponder>,
        limiter: Arc<dyn RateLimiter>,
        relay_waker: Option<Arc<Notify>>,
    ) -> Self {
        let completion = CompletionCoordinator::new(Arc::clone(&database));
        let completion = Arc::new(match relay_waker {
            Some(waker) => completion.with_relay_waker(waker),
            None => completion,
        });

        let orchestrator = Arc::new(ConversationOrchestrator::new(
            Arc::clone(&database),
            Arc::clone(&bus),
            responder,
            Arc::clone(&limiter),
            Arc::clone(&completion),
            config.orchestrator.clone(),
            config.rate_limit.clone(),
        ));
        let unidentified = Arc::new(UnidentifiedSessionStore::new(Arc::clone(&database)));
        let identity = Arc::new(IdentityResolver::new(
            Arc::clone(&database),
            config.identity.clone(),
        ));
        let migrator = Arc::new(MessageMigrator::new(Arc::clone(&database)));
        let gateway = Arc::new(ChannelGateway::new(
            Arc::clone(&database),
            Arc::clone(&bus),
            Arc::clone(&unidentified),
            Arc::clone(&identity),
            migrator,
            Arc::clone(&orchestrator),
        ));

        Self {
            telegram: Arc::new(TelegramAdapter::new(config.telegram.clone())),
            web: Arc::new(WebAdapter::new(&config.web)),
            config: Arc::new(config),
            database,
            bus,
            gateway,
            orchestrator,
            identity,
            completion,
            unidentified,
            limiter,
            start_time: Instant::now(),
        }
    }
}
