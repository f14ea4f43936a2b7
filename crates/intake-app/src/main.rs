//! Intake - entry point.
//!
//! Loads configuration, opens the database, wires the conversation
//! pipeline, starts the background workers (outbox relay, timeout
//! watchdog, reply delivery) and serves the HTTP API until Ctrl-C.

mod cli;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use intake_api::{start_server, AppState};
use intake_channels::{ChannelAdapter, DeliveryWorker, WebhookForwarder};
use intake_chat::{
    InProcessRateLimiter, JobBus, OutboxRelay, QueueConsumer, RoutingJobBus, ScriptedResponder,
    TimeoutWatchdog,
};
use intake_core::config::IntakeConfig;
use intake_core::events::JobEvent;
use intake_storage::Database;

use crate::cli::CliArgs;

/// Replies queued for the delivery worker.
const DELIVERY_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config is read before tracing starts so its log level can apply.
    let config_file = args.resolve_config_path();
    let loaded = if config_file.exists() {
        IntakeConfig::load(&config_file).map(Some)
    } else {
        Ok(None)
    };
    let mut config = match &loaded {
        Ok(Some(config)) => config.clone(),
        _ => IntakeConfig::default(),
    };

    // Tracing.
    let level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::info!("Starting Intake v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(Some(_)) => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        Ok(None) => tracing::info!(path = %config_file.display(), "No config file, using defaults"),
        Err(e) => {
            tracing::error!(path = %config_file.display(), error = %e, "Invalid configuration");
            return Err(e.into());
        }
    }
    config.general.port = args.resolve_port(config.general.port);

    // Storage.
    let data_dir = args.resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("intake.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    // Job bus consumers and outbox relay.
    let bus = Arc::new(RoutingJobBus::new());
    let (replies, delivery_rx) = QueueConsumer::channel(DELIVERY_QUEUE);
    bus.register(JobEvent::MESSAGE_SEND, Arc::new(replies));
    match WebhookForwarder::scoring(&config.collaborators) {
        Some(scoring) => {
            tracing::info!(url = scoring.url(), "Scoring webhook configured");
            bus.register(JobEvent::INTERVIEW_COMPLETE, Arc::new(scoring));
        }
        None => tracing::warn!("No scoring webhook, completed interviews stay in the outbox"),
    }
    match WebhookForwarder::transcription(&config.collaborators) {
        Some(transcription) => {
            tracing::info!(url = transcription.url(), "Transcription webhook configured");
            bus.register(JobEvent::VOICE_TRANSCRIBE, Arc::new(transcription));
        }
        None => tracing::warn!("No transcription webhook, voice notes will not be transcribed"),
    }
    let bus_dyn: Arc<dyn JobBus> = bus;
    let relay = Arc::new(OutboxRelay::new(
        Arc::clone(&db),
        Arc::clone(&bus_dyn),
        config.outbox.clone(),
    ));

    // Pipeline.
    let state = AppState::new(
        config.clone(),
        Arc::clone(&db),
        bus_dyn,
        Arc::new(ScriptedResponder::default()),
        Arc::new(InProcessRateLimiter::new()),
        Some(relay.waker()),
    );
    tracing::info!(
        telegram = state.telegram.is_enabled(),
        "Conversation pipeline ready"
    );

    // === Background tasks ===

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    workers.push(tokio::spawn({
        let relay = Arc::clone(&relay);
        let shutdown = shutdown_rx.clone();
        async move { relay.run(shutdown).await }
    }));

    let watchdog = Arc::new(TimeoutWatchdog::new(
        Arc::clone(&db),
        Arc::clone(&state.completion),
        Arc::clone(&state.unidentified),
        config.completion.clone(),
        config.identity.clone(),
    ));
    workers.push(tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { watchdog.run(shutdown).await }
    }));

    let adapters = vec![
        state.telegram.clone() as Arc<dyn ChannelAdapter>,
        state.web.clone() as Arc<dyn ChannelAdapter>,
    ];
    let delivery = DeliveryWorker::new(adapters);
    workers.push(tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { delivery.run(delivery_rx, shutdown).await }
    }));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // Dropping the sender would stop every worker.
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    // === API server ===

    let served = start_server(state, shutdown_rx).await;

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    tracing::info!("Intake stopped");

    served.map_err(Into::into)
}
