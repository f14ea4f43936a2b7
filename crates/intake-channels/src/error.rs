//! Error types for channel adapters.

use intake_core::error::IntakeError;
use intake_core::types::ChannelKind;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is not configured")]
    NotConfigured(ChannelKind),
    #[error("adapter for {adapter} cannot deliver to {target}")]
    WrongChannel { adapter: ChannelKind, target: String },
    #[error("unknown web session")]
    UnknownSession,
    #[error("malformed inbound payload: {0}")]
    Malformed(String),
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected request: {0}")]
    Provider(String),
}

impl From<ChannelError> for IntakeError {
    fn from(err: ChannelError) -> Self {
        IntakeError::Channel(err.to_string())
    }
}
