//! In-memory graph of threads, messages and personas, merged from server
//! pushes, local actions and sibling sessions.
//!
//! Every mutation is an insert-or-update keyed by identity: applying the same
//! record twice leaves the graph as applying it once, so duplicate or
//! reordered deliveries are harmless. Entities are addressed by key; readers
//! look them up again to observe later updates.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::{DecodeError, parse_server_datetime};

pub mod handlers;
mod model;
mod records;

pub use model::{
    ImStatus, LocalId, Message, MessageId, Persona, PersonaId, ServerId, Thread, ThreadKey,
};
pub use records::{MessagePatch, PersonaPatch, RecordSet, ThreadPatch};

const CHANGE_FEED_CAPACITY: usize = 1024;

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A notification pushed by the server to this session.
    Server,
    /// An action taken in this session.
    Local,
    /// A sibling session relayed it over the fan-out bus.
    Remote,
}

impl Origin {
    /// Only this session's own actions are relayed to siblings; server
    /// pushes reach every session directly and remote ones are never echoed.
    pub fn should_relay(self) -> bool {
        matches!(self, Origin::Local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    ThreadUpserted {
        key: ThreadKey,
        created: bool,
        origin: Origin,
    },
    MessageUpserted {
        id: MessageId,
        thread: ThreadKey,
        created: bool,
        origin: Origin,
    },
    MessagePromoted {
        local: LocalId,
        id: MessageId,
        thread: ThreadKey,
        origin: Origin,
    },
    MessagesDeleted {
        ids: Vec<MessageId>,
        origin: Origin,
    },
    ThreadSeen {
        key: ThreadKey,
        message_id: u64,
        origin: Origin,
    },
    PersonaUpdated {
        id: PersonaId,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {message} references unknown thread {thread}")]
    UnknownThread { message: MessageId, thread: ThreadKey },
    #[error("message {0} does not name its thread")]
    MissingThread(MessageId),
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadKey),
    #[error("pending message {0:?} not found")]
    PendingNotFound(LocalId),
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] serde_json::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Result of an insert-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
    Unchanged,
}

impl Upsert {
    fn from_changed(changed: bool) -> Self {
        if changed {
            Upsert::Updated
        } else {
            Upsert::Unchanged
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
struct Graph {
    threads: HashMap<ThreadKey, Thread>,
    messages: HashMap<MessageId, Message>,
    personas: HashMap<PersonaId, Persona>,
    next_local_id: u64,
}

pub struct Store {
    graph: RwLock<Graph>,
    self_persona: Option<PersonaId>,
    changes: broadcast::Sender<StoreChange>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.graph.read();
        f.debug_struct("Store")
            .field("self_persona", &self.self_persona)
            .field("threads", &graph.threads.len())
            .field("messages", &graph.messages.len())
            .field("personas", &graph.personas.len())
            .finish()
    }
}

impl Store {
    pub fn new(self_persona: Option<PersonaId>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            graph: RwLock::new(Graph::default()),
            self_persona,
            changes,
        }
    }

    pub fn self_persona(&self) -> Option<PersonaId> {
        self.self_persona
    }

    /// Feed of applied mutations, in application order.
    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: StoreChange) {
        // No observers is fine.
        let _ = self.changes.send(change);
    }

    fn is_self(&self, author: Option<PersonaId>) -> bool {
        self.self_persona.is_some() && author == self.self_persona
    }

    pub fn insert_thread(&self, patch: ThreadPatch, origin: Origin) -> Result<Upsert, StoreError> {
        let last_activity_at = patch
            .last_activity_at
            .as_deref()
            .map(parse_server_datetime)
            .transpose()?;
        let key = patch.key();

        let mut seen_change = None;
        let outcome = {
            let mut graph = self.graph.write();
            let mut created = false;
            let thread = graph.threads.entry(key.clone()).or_insert_with(|| {
                created = true;
                Thread::new(key.clone())
            });

            let mut changed = false;
            if let Some(name) = patch.name {
                if thread.name.as_deref() != Some(name.as_str()) {
                    thread.name = Some(name);
                    changed = true;
                }
            }
            if let Some(is_pinned) = patch.is_pinned {
                changed |= thread.is_pinned != is_pinned;
                thread.is_pinned = is_pinned;
            }
            if let Some(seen) = patch.seen_message_id {
                if thread.advance_seen(seen) {
                    seen_change = Some(seen);
                    changed = true;
                }
            }
            let before = thread.last_activity_at;
            thread.touch(last_activity_at);
            changed |= thread.last_activity_at != before;

            if created {
                Upsert::Created
            } else {
                Upsert::from_changed(changed)
            }
        };

        if outcome != Upsert::Unchanged {
            self.emit(StoreChange::ThreadUpserted {
                key: key.clone(),
                created: outcome == Upsert::Created,
                origin,
            });
        }
        if let Some(message_id) = seen_change {
            self.emit(StoreChange::ThreadSeen {
                key,
                message_id,
                origin,
            });
        }
        Ok(outcome)
    }

    pub fn insert_persona(&self, patch: PersonaPatch) -> Upsert {
        let outcome = {
            let mut graph = self.graph.write();
            let mut created = false;
            let persona = graph.personas.entry(patch.id).or_insert_with(|| {
                created = true;
                Persona {
                    id: patch.id,
                    name: None,
                    im_status: ImStatus::Unknown,
                }
            });
            let mut changed = false;
            if let Some(name) = patch.name {
                if persona.name.as_deref() != Some(name.as_str()) {
                    persona.name = Some(name);
                    changed = true;
                }
            }
            if let Some(status) = patch.im_status {
                changed |= persona.im_status != status;
                persona.im_status = status;
            }
            if created {
                Upsert::Created
            } else {
                Upsert::from_changed(changed)
            }
        };
        if outcome != Upsert::Unchanged {
            self.emit(StoreChange::PersonaUpdated { id: patch.id });
        }
        outcome
    }

    pub fn set_im_status(&self, id: PersonaId, status: ImStatus) -> Upsert {
        self.insert_persona(PersonaPatch {
            id,
            name: None,
            im_status: Some(status),
        })
    }

    /// Insert or merge a persisted message.
    ///
    /// A new message must name a known thread; otherwise it is rejected and
    /// nothing is stored. Thread, author and creation time are fixed once
    /// known; body, star and pin follow the latest write.
    pub fn insert_message(
        &self,
        patch: MessagePatch,
        origin: Origin,
    ) -> Result<Upsert, StoreError> {
        let id = MessageId::persisted(patch.id);
        let created_at = patch.date.as_deref().map(parse_server_datetime).transpose()?;

        let (outcome, thread_key, seen_change) = {
            let mut graph = self.graph.write();
            let Graph {
                threads, messages, ..
            } = &mut *graph;

            if let Some(existing) = messages.get_mut(&id) {
                if let Some(thread) = &patch.thread {
                    if *thread != existing.thread {
                        warn!(
                            target = "busline::store",
                            message = %id,
                            stored = %existing.thread,
                            pushed = %thread,
                            "ignoring thread change for existing message"
                        );
                    }
                }
                let changed = merge_message(existing, &patch, created_at);
                (Upsert::from_changed(changed), existing.thread.clone(), None)
            } else {
                let key = patch.thread.clone().ok_or(StoreError::MissingThread(id))?;
                let Some(thread) = threads.get_mut(&key) else {
                    return Err(StoreError::UnknownThread {
                        message: id,
                        thread: key,
                    });
                };
                thread.place(id);
                thread.touch(created_at);
                let mut seen_change = None;
                if (self.is_self(patch.author_id) || thread.focused)
                    && thread.advance_seen(patch.id)
                {
                    seen_change = Some(patch.id);
                }
                messages.insert(
                    id,
                    Message {
                        id,
                        thread: key.clone(),
                        author: patch.author_id,
                        body: patch.body.unwrap_or_default(),
                        created_at,
                        starred: patch.starred.unwrap_or(false),
                        pinned: patch.pinned.unwrap_or(false),
                    },
                );
                (Upsert::Created, key, seen_change)
            }
        };

        if outcome != Upsert::Unchanged {
            self.emit(StoreChange::MessageUpserted {
                id,
                thread: thread_key.clone(),
                created: outcome == Upsert::Created,
                origin,
            });
        }
        if let Some(message_id) = seen_change {
            self.emit(StoreChange::ThreadSeen {
                key: thread_key,
                message_id,
                origin,
            });
        }
        Ok(outcome)
    }

    /// Apply a multi-model record set: threads, then personas, then
    /// messages, so messages can reference threads from the same set. Each
    /// record is applied on its own; rejects are logged and skipped.
    pub fn insert_records(&self, set: RecordSet, origin: Origin) -> InsertReport {
        let mut report = InsertReport::default();
        let mut tally = |result: Result<(), StoreError>, model: &str| match result {
            Ok(()) => report.applied += 1,
            Err(err) => {
                warn!(target = "busline::store", model, error = %err, "record rejected");
                report.rejected += 1;
            }
        };

        for value in set.threads {
            let result = serde_json::from_value::<ThreadPatch>(value)
                .map_err(StoreError::from)
                .and_then(|patch| self.insert_thread(patch, origin).map(|_| ()));
            tally(result, "Thread");
        }
        for value in set.personas {
            let result = serde_json::from_value::<PersonaPatch>(value)
                .map_err(StoreError::from)
                .map(|patch| {
                    self.insert_persona(patch);
                });
            tally(result, "Persona");
        }
        for value in set.messages {
            let result = serde_json::from_value::<MessagePatch>(value)
                .map_err(StoreError::from)
                .and_then(|patch| self.insert_message(patch, origin).map(|_| ()));
            tally(result, "Message");
        }
        report
    }

    /// Move the read marker of `key` forward to `message_id`.
    pub fn mark_seen(
        &self,
        key: &ThreadKey,
        message_id: u64,
        origin: Origin,
    ) -> Result<bool, StoreError> {
        let changed = {
            let mut graph = self.graph.write();
            let thread = graph
                .threads
                .get_mut(key)
                .ok_or_else(|| StoreError::ThreadNotFound(key.clone()))?;
            thread.advance_seen(message_id)
        };
        if changed {
            self.emit(StoreChange::ThreadSeen {
                key: key.clone(),
                message_id,
                origin,
            });
        }
        Ok(changed)
    }

    /// Focusing a thread reads everything in it and keeps new messages read
    /// while it stays focused.
    pub fn set_focus(&self, key: &ThreadKey, focused: bool) -> Result<(), StoreError> {
        let seen = {
            let mut graph = self.graph.write();
            let thread = graph
                .threads
                .get_mut(key)
                .ok_or_else(|| StoreError::ThreadNotFound(key.clone()))?;
            thread.focused = focused;
            match thread.last_persisted_id() {
                Some(last) if focused && thread.advance_seen(last) => Some(last),
                _ => None,
            }
        };
        if let Some(message_id) = seen {
            self.emit(StoreChange::ThreadSeen {
                key: key.clone(),
                message_id,
                origin: Origin::Local,
            });
        }
        Ok(())
    }

    pub fn delete_messages(&self, ids: &[u64], origin: Origin) -> usize {
        let removed: Vec<MessageId> = {
            let mut graph = self.graph.write();
            let Graph {
                threads, messages, ..
            } = &mut *graph;
            ids.iter()
                .map(|id| MessageId::persisted(*id))
                .filter(|id| match messages.remove(id) {
                    Some(message) => {
                        if let Some(thread) = threads.get_mut(&message.thread) {
                            thread.remove(*id);
                        }
                        true
                    }
                    None => false,
                })
                .collect()
        };
        let count = removed.len();
        if count > 0 {
            self.emit(StoreChange::MessagesDeleted {
                ids: removed,
                origin,
            });
        }
        count
    }

    pub fn set_starred(&self, ids: &[u64], starred: bool, origin: Origin) -> usize {
        let mut updated = 0;
        for id in ids {
            // Only touch messages we already hold.
            if self.message(&MessageId::persisted(*id)).is_none() {
                continue;
            }
            let patch = MessagePatch {
                id: *id,
                thread: None,
                author_id: None,
                body: None,
                date: None,
                starred: Some(starred),
                pinned: None,
            };
            if let Ok(Upsert::Updated) = self.insert_message(patch, origin) {
                updated += 1;
            }
        }
        updated
    }

    /// Add a locally composed message that the server has not confirmed yet.
    pub fn post_pending(
        &self,
        key: &ThreadKey,
        body: impl Into<String>,
    ) -> Result<LocalId, StoreError> {
        let (local, id) = {
            let mut graph = self.graph.write();
            let local = LocalId(graph.next_local_id);
            let id = MessageId::Pending(local);
            let Graph {
                threads, messages, ..
            } = &mut *graph;
            let thread = threads
                .get_mut(key)
                .ok_or_else(|| StoreError::ThreadNotFound(key.clone()))?;
            let now = OffsetDateTime::now_utc();
            thread.place(id);
            thread.touch(Some(now));
            messages.insert(
                id,
                Message {
                    id,
                    thread: key.clone(),
                    author: self.self_persona,
                    body: body.into(),
                    created_at: Some(now),
                    starred: false,
                    pinned: false,
                },
            );
            graph.next_local_id += 1;
            (local, id)
        };
        self.emit(StoreChange::MessageUpserted {
            id,
            thread: key.clone(),
            created: true,
            origin: Origin::Local,
        });
        Ok(local)
    }

    /// Rewrite a pending message's identity once the server confirmed it.
    /// If the server's copy already arrived, the pending entry is folded
    /// into it.
    pub fn promote(
        &self,
        local: LocalId,
        server_id: u64,
        origin: Origin,
    ) -> Result<MessageId, StoreError> {
        let pending_id = MessageId::Pending(local);
        let id = MessageId::persisted(server_id);
        let thread_key = {
            let mut graph = self.graph.write();
            let Graph {
                threads, messages, ..
            } = &mut *graph;
            let pending = messages
                .remove(&pending_id)
                .ok_or(StoreError::PendingNotFound(local))?;
            let key = pending.thread.clone();
            let Some(thread) = threads.get_mut(&key) else {
                return Err(StoreError::UnknownThread {
                    message: pending_id,
                    thread: key,
                });
            };
            thread.remove(pending_id);
            if messages.contains_key(&id) {
                debug!(
                    target = "busline::store",
                    local = local.0,
                    server_id,
                    "server copy arrived before promotion"
                );
            } else {
                thread.place(id);
                messages.insert(id, Message { id, ..pending });
            }
            thread.advance_seen(server_id);
            key
        };
        self.emit(StoreChange::MessagePromoted {
            local,
            id,
            thread: thread_key,
            origin,
        });
        Ok(id)
    }

    pub fn thread(&self, key: &ThreadKey) -> Option<Thread> {
        self.graph.read().threads.get(key).cloned()
    }

    pub fn threads(&self) -> Vec<Thread> {
        let mut threads: Vec<Thread> = self.graph.read().threads.values().cloned().collect();
        threads.sort_by(|a, b| a.key.cmp(&b.key));
        threads
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.graph.read().messages.get(id).cloned()
    }

    /// Messages of `key` in thread order.
    pub fn thread_messages(&self, key: &ThreadKey) -> Vec<Message> {
        let graph = self.graph.read();
        graph
            .threads
            .get(key)
            .map(|thread| {
                thread
                    .messages
                    .iter()
                    .filter_map(|id| graph.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn persona(&self, id: PersonaId) -> Option<Persona> {
        self.graph.read().personas.get(&id).cloned()
    }

    /// Persisted messages past the read marker not written by the local user.
    pub fn unread_count(&self, key: &ThreadKey) -> Option<usize> {
        let graph = self.graph.read();
        let thread = graph.threads.get(key)?;
        let seen = thread.seen_message_id.unwrap_or(0);
        let count = thread
            .messages
            .iter()
            .filter(|id| id.server_id().is_some_and(|server_id| server_id > seen))
            .filter_map(|id| graph.messages.get(id))
            .filter(|message| !self.is_self(message.author))
            .count();
        Some(count)
    }
}

fn merge_message(
    existing: &mut Message,
    patch: &MessagePatch,
    created_at: Option<OffsetDateTime>,
) -> bool {
    let mut changed = false;
    if existing.author.is_none() && patch.author_id.is_some() {
        existing.author = patch.author_id;
        changed = true;
    }
    if existing.created_at.is_none() && created_at.is_some() {
        existing.created_at = created_at;
        changed = true;
    }
    if let Some(body) = &patch.body {
        if existing.body != *body {
            existing.body = body.clone();
            changed = true;
        }
    }
    if let Some(starred) = patch.starred {
        changed |= existing.starred != starred;
        existing.starred = starred;
    }
    if let Some(pinned) = patch.pinned {
        changed |= existing.pinned != pinned;
        existing.pinned = pinned;
    }
    changed
}
