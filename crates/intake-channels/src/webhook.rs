//! Forwards durable and transcription events to collaborator services.
//!
//! Each event is POSTed as its JSON envelope with the dedup key in an
//! `Idempotency-Key` header. Only a 2xx response acknowledges it; anything
//! else fails the publish so the outbox keeps the row for a retry.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use intake_chat::JobConsumer;
use intake_core::config::CollaboratorConfig;
use intake_core::error::IntakeError;
use intake_core::events::JobEnvelope;

use crate::error::ChannelError;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub struct WebhookForwarder {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>, auth_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
        }
    }

    /// Scoring forwarder, if a scoring URL is configured.
    pub fn scoring(config: &CollaboratorConfig) -> Option<Self> {
        Self::from_url(&config.scoring_url, config)
    }

    /// Transcription forwarder, if a transcription URL is configured.
    pub fn transcription(config: &CollaboratorConfig) -> Option<Self> {
        Self::from_url(&config.transcription_url, config)
    }

    fn from_url(url: &str, config: &CollaboratorConfig) -> Option<Self> {
        if url.is_empty() {
            return None;
        }
        Some(Self::new(
            url,
            Some(config.auth_token.clone()),
            Duration::from_secs(config.timeout_secs.max(1)),
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, envelope: &JobEnvelope) -> Result<(), ChannelError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, envelope.key.as_str())
            .json(envelope);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(key = %envelope.key, url = %self.url, "Collaborator acknowledged event");
            return Ok(());
        }
        Err(ChannelError::Provider(format!(
            "{} returned HTTP {}",
            self.url,
            status.as_u16()
        )))
    }
}

#[async_trait]
impl JobConsumer for WebhookForwarder {
    async fn accept(&self, envelope: &JobEnvelope) -> Result<(), IntakeError> {
        self.post(envelope).await.map_err(Into::into)
    }
}
