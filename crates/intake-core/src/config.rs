use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{IntakeError, Result};

/// Top-level configuration for the Intake service.
///
/// Loaded from `~/.intake/config.toml` by default. Each section corresponds
/// to one stage of the conversation pipeline or a cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
}

impl IntakeConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: IntakeConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| IntakeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if !(4..=8).contains(&self.identity.pin_length) {
            return Err(IntakeError::Config(format!(
                "identity.pin_length must be between 4 and 8, got {}",
                self.identity.pin_length
            )));
        }
        if self.identity.pin_ttl_minutes == 0 {
            return Err(IntakeError::Config(
                "identity.pin_ttl_minutes must be greater than zero".to_string(),
            ));
        }
        if self.orchestrator.max_message_length == 0 {
            return Err(IntakeError::Config(
                "orchestrator.max_message_length must be greater than zero".to_string(),
            ));
        }
        if self.outbox.max_attempts == 0 {
            return Err(IntakeError::Config(
                "outbox.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.completion.interview_timeout_minutes == 0 {
            return Err(IntakeError::Config(
                "completion.interview_timeout_minutes must be greater than zero".to_string(),
            ));
        }
        for (field, url) in [
            ("collaborators.scoring_url", &self.collaborators.scoring_url),
            ("collaborators.transcription_url", &self.collaborators.transcription_url),
        ] {
            if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(IntakeError::Config(format!(
                    "{} must be an http(s) URL, got {}",
                    field, url
                )));
            }
        }
        Ok(())
    }
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// HTTP listen address.
    pub bind_address: String,
    /// HTTP listen port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.intake/data".to_string(),
            log_level: "info".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Pin issuance and unidentified-session retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Number of digits in an issued pin (4-8).
    pub pin_length: usize,
    /// Minutes an issued pin stays valid.
    pub pin_ttl_minutes: u32,
    /// Minutes an unidentified session is kept before it is purged.
    pub unidentified_session_ttl_minutes: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            pin_length: 4,
            pin_ttl_minutes: 7 * 24 * 60,
            unidentified_session_ttl_minutes: 24 * 60,
        }
    }
}

/// Conversation orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Window in milliseconds during which rapid candidate lines are merged
    /// into one AI turn. Zero disables coalescing.
    pub coalesce_window_ms: u64,
    /// Maximum inbound message length in characters.
    pub max_message_length: usize,
    /// Number of prior messages handed to the AI responder.
    pub history_turns: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 1500,
            max_message_length: 4000,
            history_turns: 40,
        }
    }
}

/// Interview completion and timeout watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Minutes after which an ACTIVE interview is completed by the watchdog.
    pub interview_timeout_minutes: u32,
    /// Seconds between watchdog sweeps.
    pub watchdog_interval_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            interview_timeout_minutes: 10,
            watchdog_interval_secs: 30,
        }
    }
}

/// Transactional outbox relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Milliseconds between relay polls when idle.
    pub poll_interval_ms: u64,
    /// Rows fetched per relay pass.
    pub batch_size: usize,
    /// Delivery attempts before a row is parked.
    pub max_attempts: u32,
    /// Base backoff in milliseconds; doubles per attempt.
    pub base_backoff_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 50,
            max_attempts: 8,
            base_backoff_ms: 500,
        }
    }
}

/// Rate limits for AI turns and inbound HTTP traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// AI turns allowed per conversation per window.
    pub ai_turns_per_window: u32,
    /// AI turn window in seconds.
    pub ai_window_secs: u64,
    /// Inbound HTTP requests allowed per second per route group.
    pub http_requests_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ai_turns_per_window: 10,
            ai_window_secs: 60,
            http_requests_per_sec: 100,
        }
    }
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Whether the Telegram adapter is enabled.
    pub enabled: bool,
    /// Bot token issued by BotFather.
    pub bot_token: String,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` header value. Empty disables the check.
    pub webhook_secret: String,
    /// Bot API base URL.
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            webhook_secret: String::new(),
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

/// Web chat widget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Allowed CORS origins for the widget.
    pub allowed_origins: Vec<String>,
    /// Buffered outbound replies per widget stream.
    pub stream_buffer: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            stream_buffer: 64,
        }
    }
}

/// Webhooks of the scoring and transcription services.
///
/// Events for a collaborator with no URL stay in the outbox (or are
/// dropped, for best-effort events) until one is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    /// Receives `interview.complete`. Empty disables forwarding.
    pub scoring_url: String,
    /// Receives `voice.transcribe`. Empty disables forwarding.
    pub transcription_url: String,
    /// Sent as a bearer token when set.
    pub auth_token: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            scoring_url: String::new(),
            transcription_url: String::new(),
            auth_token: String::new(),
            timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = IntakeConfig::default();
        assert_eq!(config.general.data_dir, "~/.intake/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.port, 8080);
        assert_eq!(config.identity.pin_length, 4);
        assert_eq!(config.completion.interview_timeout_minutes, 10);
        assert_eq!(config.outbox.max_attempts, 8);
        assert!(!config.telegram.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/srv/intake"
log_level = "debug"
port = 9090

[identity]
pin_length = 6

[orchestrator]
coalesce_window_ms = 0

[telegram]
enabled = true
bot_token = "123:abc"
webhook_secret = "s3cret"
"#;
        let file = create_temp_config(content);
        let config = IntakeConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/srv/intake");
        assert_eq!(config.general.port, 9090);
        assert_eq!(config.identity.pin_length, 6);
        assert_eq!(config.orchestrator.coalesce_window_ms, 0);
        assert!(config.telegram.enabled);
        assert_eq!(config.telegram.webhook_secret, "s3cret");
        // Untouched sections keep their defaults.
        assert_eq!(config.outbox.batch_size, 50);
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
    }

    #[test]
    fn test_load_missing_file() {
        let result = IntakeConfig::load(Path::new("/nonexistent/intake.toml"));
        assert!(matches!(result, Err(IntakeError::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("[general\nport = ");
        let result = IntakeConfig::load(file.path());
        assert!(matches!(result, Err(IntakeError::Config(_))));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = create_temp_config("[identity]\npin_length = 2\n");
        let err = IntakeConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("pin_length"));
    }

    #[test]
    fn test_collaborator_urls_are_validated() {
        let file = create_temp_config(
            "[collaborators]\nscoring_url = \"https://scoring.internal/hooks\"\n",
        );
        let config = IntakeConfig::load(file.path()).unwrap();
        assert_eq!(config.collaborators.scoring_url, "https://scoring.internal/hooks");
        assert!(config.collaborators.transcription_url.is_empty());
        assert_eq!(config.collaborators.timeout_secs, 10);

        let file = create_temp_config("[collaborators]\ntranscription_url = \"ftp://x\"\n");
        let err = IntakeConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("transcription_url"));
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let config = IntakeConfig::load_or_default(Path::new("/nonexistent/intake.toml"));
        assert_eq!(config.general.port, 8080);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = IntakeConfig::default();
        config.general.port = 7000;
        config.outbox.max_attempts = 3;
        config.save(&path).unwrap();

        let loaded = IntakeConfig::load(&path).unwrap();
        assert_eq!(loaded.general.port, 7000);
        assert_eq!(loaded.outbox.max_attempts, 3);
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = IntakeConfig::default();
        config.outbox.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = IntakeConfig::default();
        config.completion.interview_timeout_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = IntakeConfig::default();
        config.identity.pin_ttl_minutes = 0;
        assert!(config.validate().is_err());
    }
}
