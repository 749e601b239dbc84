//! Keeps sibling sessions' stores consistent by relaying local mutations over
//! a [`Bus`] topic.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transport_bus::{Bus, BusError, BusMessage};

use crate::store::{
    MessageId, MessagePatch, Origin, Store, StoreChange, StoreError, ThreadKey, ThreadPatch,
};

pub const SYNC_TOPIC: &str = "store/sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to encode sync frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncFrame {
    Thread { thread: ThreadPatch },
    Message { message: MessagePatch },
    Seen { thread: ThreadKey, message_id: u64 },
    Deleted { message_ids: Vec<u64> },
}

pub struct StoreSync {
    bus: Arc<dyn Bus>,
    store: Arc<Store>,
    tab_id: String,
    topic: String,
}

impl StoreSync {
    pub fn new(bus: Arc<dyn Bus>, store: Arc<Store>, tab_id: impl Into<String>) -> Self {
        Self {
            bus,
            store,
            tab_id: tab_id.into(),
            topic: SYNC_TOPIC.to_string(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Snapshot the entity a change refers to. Changes that did not
    /// originate here, or that concern pending messages, yield nothing.
    pub fn frame_for(&self, change: &StoreChange) -> Option<SyncFrame> {
        match change {
            StoreChange::ThreadUpserted { key, origin, .. } if origin.should_relay() => {
                let thread = self.store.thread(key)?;
                Some(SyncFrame::Thread {
                    thread: ThreadPatch::from_thread(&thread),
                })
            }
            StoreChange::MessageUpserted { id, origin, .. }
            | StoreChange::MessagePromoted { id, origin, .. }
                if origin.should_relay() =>
            {
                let message = self.store.message(id)?;
                MessagePatch::from_message(&message)
                    .map(|message| SyncFrame::Message { message })
            }
            StoreChange::ThreadSeen {
                key,
                message_id,
                origin,
            } if origin.should_relay() => Some(SyncFrame::Seen {
                thread: key.clone(),
                message_id: *message_id,
            }),
            StoreChange::MessagesDeleted { ids, origin } if origin.should_relay() => {
                let message_ids: Vec<u64> = ids
                    .iter()
                    .filter_map(|id| MessageId::server_id(*id))
                    .collect();
                (!message_ids.is_empty()).then_some(SyncFrame::Deleted { message_ids })
            }
            _ => None,
        }
    }

    pub fn publish(&self, frame: &SyncFrame) -> Result<usize, SyncError> {
        let payload = serde_json::to_vec(frame)?;
        Ok(self
            .bus
            .publish(&self.topic, &self.tab_id, Bytes::from(payload))?)
    }

    /// Apply a sibling's frame as a remote mutation.
    pub fn apply(&self, frame: SyncFrame) -> Result<(), StoreError> {
        match frame {
            SyncFrame::Thread { thread } => {
                self.store.insert_thread(thread, Origin::Remote)?;
            }
            SyncFrame::Message { message } => {
                self.store.insert_message(message, Origin::Remote)?;
            }
            SyncFrame::Seen { thread, message_id } => {
                self.store.mark_seen(&thread, message_id, Origin::Remote)?;
            }
            SyncFrame::Deleted { message_ids } => {
                self.store.delete_messages(&message_ids, Origin::Remote);
            }
        }
        Ok(())
    }

    fn receive(&self, message: BusMessage) {
        if message.origin == self.tab_id {
            return;
        }
        let frame = match serde_json::from_slice::<SyncFrame>(&message.payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target = "busline::sync",
                    origin = %message.origin,
                    error = %err,
                    "discarding malformed sync frame"
                );
                return;
            }
        };
        trace!(
            target = "busline::sync",
            origin = %message.origin,
            frame = ?frame,
            "applying sync frame"
        );
        if let Err(err) = self.apply(frame) {
            debug!(
                target = "busline::sync",
                origin = %message.origin,
                error = %err,
                "sync frame not applicable here"
            );
        }
    }

    /// Start relaying in both directions. Subscriptions are taken before this
    /// returns, so nothing published afterwards is missed.
    pub fn spawn(self: Arc<Self>) -> SyncTasks {
        let mut changes = self.store.changes();
        let outbound_sync = Arc::clone(&self);
        let outbound = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let Some(frame) = outbound_sync.frame_for(&change) else {
                            continue;
                        };
                        match outbound_sync.publish(&frame) {
                            Ok(receivers) => {
                                trace!(target = "busline::sync", receivers, "relayed store change");
                            }
                            Err(err) => {
                                warn!(
                                    target = "busline::sync",
                                    error = %err,
                                    "failed to relay store change"
                                );
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target = "busline::sync", skipped, "store change feed lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut incoming = self.bus.subscribe(&self.topic);
        let inbound = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(message) => self.receive(message),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(target = "busline::sync", skipped, "sync topic lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        SyncTasks { outbound, inbound }
    }
}

/// Relay tasks; dropping stops them.
#[derive(Debug)]
pub struct SyncTasks {
    outbound: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl SyncTasks {
    pub fn abort(&self) {
        self.outbound.abort();
        self.inbound.abort();
    }
}

impl Drop for SyncTasks {
    fn drop(&mut self) {
        self.abort();
    }
}
