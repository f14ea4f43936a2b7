//! Consumer that turns `message.send` events into transport calls.
//!
//! The bus acknowledges a reply once it is queued here; the transport
//! call happens on the worker task.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use intake_chat::SeenKeys;
use intake_core::events::{JobEnvelope, JobEvent};
use intake_core::types::ChannelKind;

use crate::adapter::ChannelAdapter;
use crate::error::ChannelError;

/// Recently delivered keys remembered for redelivery checks.
const SEEN_CAPACITY: usize = 4096;

/// What happened to one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Same key handled before.
    Duplicate,
    /// Not a `message.send` event.
    Skipped,
}

pub struct DeliveryWorker {
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    seen: SeenKeys,
}

impl DeliveryWorker {
    pub fn new(adapters: Vec<Arc<dyn ChannelAdapter>>) -> Self {
        Self {
            adapters,
            seen: SeenKeys::new(SEEN_CAPACITY),
        }
    }

    fn adapter_for(&self, kind: ChannelKind) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.iter().find(|a| a.kind() == kind)
    }

    pub async fn handle(&self, envelope: &JobEnvelope) -> Result<Delivery, ChannelError> {
        let JobEvent::MessageSend {
            message_id,
            channel_id,
            content,
        } = &envelope.event
        else {
            return Ok(Delivery::Skipped);
        };

        if !self.seen.first_time(&envelope.key) {
            debug!(key = %envelope.key, "Duplicate delivery dropped");
            return Ok(Delivery::Duplicate);
        }

        let adapter = self
            .adapter_for(channel_id.kind())
            .ok_or(ChannelError::NotConfigured(channel_id.kind()))?;
        adapter.deliver(channel_id, *message_id, content).await?;
        Ok(Delivery::Sent)
    }

    /// Drain the reply queue until it closes or shutdown is signalled.
    pub async fn run(
        &self,
        mut queue: mpsc::Receiver<JobEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(adapters = self.adapters.len(), "Delivery worker started");
        loop {
            tokio::select! {
                received = queue.recv() => match received {
                    Some(envelope) => {
                        if let Err(e) = self.handle(&envelope).await {
                            warn!(key = %envelope.key, error = %e, "Reply delivery failed");
                        }
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Delivery worker stopped");
    }
}
