use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// One frame fanned out on a topic. `origin` names the publisher so that
/// receivers sharing the bus with it can skip their own frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub origin: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe fan-out shared by every session of the same origin.
///
/// Delivery is best effort and unordered across publishers; consumers are
/// expected to apply frames idempotently.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publish `payload` on `topic`, returning how many receivers saw it.
    /// Publishing with nobody listening is not an error.
    fn publish(&self, topic: &str, origin: &str, payload: Bytes) -> BusResult<usize>;
}

/// In-process bus for single-instance deployments and tests.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, origin: &str, payload: Bytes) -> BusResult<usize> {
        let sender = self.sender_for(topic);
        if sender.receiver_count() == 0 {
            trace!(target = "transport_bus", topic, origin, "no subscribers for topic");
            return Ok(0);
        }
        sender
            .send(BusMessage {
                topic: topic.to_string(),
                origin: origin.to_string(),
                payload,
            })
            .map_err(|_| BusError::Closed)
    }
}
