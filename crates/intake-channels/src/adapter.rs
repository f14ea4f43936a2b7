//! Outbound side of a transport.

use async_trait::async_trait;

use intake_core::types::{ChannelIdentifier, ChannelKind};

use crate::error::ChannelError;

/// A transport that can push text back to a participant.
///
/// Inbound normalisation is transport specific (webhook payloads, widget
/// requests) and lives on the concrete adapters.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver `text` to `channel`. `message_id` identifies the outbound
    /// message so a transport can surface it to the client.
    async fn deliver(
        &self,
        channel: &ChannelIdentifier,
        message_id: uuid::Uuid,
        text: &str,
    ) -> Result<(), ChannelError>;
}
