//! Asynchronous job bus.
//!
//! The pipeline never awaits scoring, transcription or outbound delivery
//! inline; it publishes [`JobEnvelope`]s and the consumers registered for
//! each event name take them. A publish only succeeds once such a consumer
//! has acknowledged the envelope.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use intake_core::error::IntakeError;
use intake_core::events::JobEnvelope;

/// Publisher side of the job bus.
#[async_trait]
pub trait JobBus: Send + Sync {
    /// Hand an event to the bus. Delivery is at-least-once: consumers must
    /// tolerate redelivery of the same `key`.
    async fn publish(&self, envelope: JobEnvelope) -> Result<(), IntakeError>;

    /// Whether anything would take an event with this name right now.
    /// The outbox leaves rows untouched while this is false.
    fn accepts(&self, _event_name: &str) -> bool {
        true
    }
}

/// Receiving side of the job bus.
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Take one envelope. `Ok` acknowledges it.
    async fn accept(&self, envelope: &JobEnvelope) -> Result<(), IntakeError>;
}

/// In-process bus that routes each event to the consumers registered for
/// its name, in registration order.
#[derive(Default)]
pub struct RoutingJobBus {
    consumers: RwLock<HashMap<&'static str, Vec<Arc<dyn JobConsumer>>>>,
}

impl RoutingJobBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event_name: &'static str, consumer: Arc<dyn JobConsumer>) {
        let mut consumers = match self.consumers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        consumers.entry(event_name).or_default().push(consumer);
    }

    pub fn consumer_count(&self, event_name: &str) -> usize {
        self.consumers_for(event_name).len()
    }

    fn consumers_for(&self, event_name: &str) -> Vec<Arc<dyn JobConsumer>> {
        let consumers = match self.consumers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        consumers.get(event_name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl JobBus for RoutingJobBus {
    async fn publish(&self, envelope: JobEnvelope) -> Result<(), IntakeError> {
        let name = envelope.event.name();
        let consumers = self.consumers_for(name);
        if consumers.is_empty() {
            return Err(IntakeError::JobBus(format!(
                "no consumer registered for {}",
                name
            )));
        }
        for consumer in consumers {
            consumer.accept(&envelope).await?;
        }
        Ok(())
    }

    fn accepts(&self, event_name: &str) -> bool {
        self.consumer_count(event_name) > 0
    }
}

/// Consumer that acknowledges by queueing the envelope for a worker task.
#[derive(Clone)]
pub struct QueueConsumer {
    tx: mpsc::Sender<JobEnvelope>,
}

impl QueueConsumer {
    /// A consumer and the receiver its worker drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<JobEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobConsumer for QueueConsumer {
    async fn accept(&self, envelope: &JobEnvelope) -> Result<(), IntakeError> {
        self.tx.try_send(envelope.clone()).map_err(|e| {
            IntakeError::JobBus(format!("queue rejected {}: {}", envelope.key, e))
        })
    }
}

/// Bounded memory of recently handled event keys, for consumers that
/// must drop redeliveries.
pub struct SeenKeys {
    capacity: usize,
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl SeenKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Record a key. Returns true the first time it is seen.
    pub fn first_time(&self, key: &str) -> bool {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (set, order) = &mut *guard;
        if set.contains(key) {
            return false;
        }
        set.insert(key.to_string());
        order.push_back(key.to_string());
        while order.len() > self.capacity {
            if let Some(old) = order.pop_front() {
                set.remove(&old);
            }
        }
        true
    }
}
