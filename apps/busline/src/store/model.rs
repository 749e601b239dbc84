use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub model: String,
    pub id: i64,
}

impl ThreadKey {
    pub fn new(model: impl Into<String>, id: i64) -> Self {
        Self {
            model: model.into(),
            id,
        }
    }

    pub fn channel(id: i64) -> Self {
        Self::new("discuss.channel", id)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u64);

/// Message identity. Persisted messages sort by server id; messages still
/// waiting for the server sort after every persisted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    Persisted(ServerId),
    Pending(LocalId),
}

impl MessageId {
    pub fn persisted(id: u64) -> Self {
        MessageId::Persisted(ServerId(id))
    }

    pub fn server_id(self) -> Option<u64> {
        match self {
            MessageId::Persisted(ServerId(id)) => Some(id),
            MessageId::Pending(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Persisted(ServerId(id)) => write!(f, "{id}"),
            MessageId::Pending(LocalId(id)) => write!(f, "pending-{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImStatus {
    Online,
    Away,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub id: PersonaId,
    pub name: Option<String>,
    pub im_status: ImStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub key: ThreadKey,
    pub name: Option<String>,
    /// Sorted by [`MessageId`] order.
    pub messages: Vec<MessageId>,
    /// Highest persisted message id the local user has seen.
    pub seen_message_id: Option<u64>,
    pub last_activity_at: Option<OffsetDateTime>,
    pub is_pinned: bool,
    pub focused: bool,
}

impl Thread {
    pub(crate) fn new(key: ThreadKey) -> Self {
        Self {
            key,
            name: None,
            messages: Vec::new(),
            seen_message_id: None,
            last_activity_at: None,
            is_pinned: false,
            focused: false,
        }
    }

    pub(crate) fn place(&mut self, id: MessageId) -> bool {
        match self.messages.binary_search(&id) {
            Ok(_) => false,
            Err(position) => {
                self.messages.insert(position, id);
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, id: MessageId) -> bool {
        match self.messages.binary_search(&id) {
            Ok(position) => {
                self.messages.remove(position);
                true
            }
            Err(_) => false,
        }
    }

    pub fn last_persisted_id(&self) -> Option<u64> {
        self.messages.iter().rev().find_map(|id| id.server_id())
    }

    /// Move the read marker forward; it never moves back.
    pub(crate) fn advance_seen(&mut self, message_id: u64) -> bool {
        match self.seen_message_id {
            Some(current) if current >= message_id => false,
            _ => {
                self.seen_message_id = Some(message_id);
                true
            }
        }
    }

    pub(crate) fn touch(&mut self, at: Option<OffsetDateTime>) {
        if let Some(at) = at {
            if self.last_activity_at.is_none_or(|current| current < at) {
                self.last_activity_at = Some(at);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub thread: ThreadKey,
    pub author: Option<PersonaId>,
    pub body: String,
    pub created_at: Option<OffsetDateTime>,
    pub starred: bool,
    pub pinned: bool,
}
