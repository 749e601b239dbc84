use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::model::{ImStatus, Message, PersonaId, Thread, ThreadKey};
use crate::protocol::format_server_datetime;

/// Partial thread attributes; absent fields leave the stored value alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPatch {
    pub model: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_message_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
}

impl ThreadPatch {
    pub fn new(key: &ThreadKey) -> Self {
        Self {
            model: key.model.clone(),
            id: key.id,
            name: None,
            is_pinned: None,
            seen_message_id: None,
            last_activity_at: None,
        }
    }

    pub fn named(key: &ThreadKey, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(key)
        }
    }

    pub fn key(&self) -> ThreadKey {
        ThreadKey::new(self.model.clone(), self.id)
    }

    pub fn from_thread(thread: &Thread) -> Self {
        Self {
            name: thread.name.clone(),
            is_pinned: Some(thread.is_pinned),
            seen_message_id: thread.seen_message_id,
            last_activity_at: thread.last_activity_at.map(format_server_datetime),
            ..Self::new(&thread.key)
        }
    }
}

/// Partial message attributes keyed by server id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<PersonaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

impl MessagePatch {
    pub fn new(id: u64, thread: &ThreadKey) -> Self {
        Self {
            id,
            thread: Some(thread.clone()),
            author_id: None,
            body: None,
            date: None,
            starred: None,
            pinned: None,
        }
    }

    pub fn by(mut self, author: PersonaId) -> Self {
        self.author_id = Some(author);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Full snapshot of a persisted message; `None` for pending ones.
    pub fn from_message(message: &Message) -> Option<Self> {
        let id = message.id.server_id()?;
        Some(Self {
            id,
            thread: Some(message.thread.clone()),
            author_id: message.author,
            body: Some(message.body.clone()),
            date: message.created_at.map(format_server_datetime),
            starred: Some(message.starred),
            pinned: Some(message.pinned),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaPatch {
    pub id: PersonaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub im_status: Option<ImStatus>,
}

/// Multi-model insert payload. Records stay as raw JSON until applied so a
/// malformed one can be rejected alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordSet {
    #[serde(rename = "Thread", default, deserialize_with = "one_or_many")]
    pub threads: Vec<Value>,
    #[serde(rename = "Persona", default, deserialize_with = "one_or_many")]
    pub personas: Vec<Value>,
    #[serde(rename = "Message", default, deserialize_with = "one_or_many")]
    pub messages: Vec<Value>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    })
}
