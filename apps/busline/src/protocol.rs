use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

/// Notification type tags pushed by the server.
pub mod kinds {
    pub const RECORD_INSERT: &str = "mail.record/insert";
    pub const NEW_MESSAGE: &str = "discuss.channel/new_message";
    pub const MESSAGE_DELETE: &str = "mail.message/delete";
    pub const MESSAGE_TOGGLE_STAR: &str = "mail.message/toggle_star";
    pub const THREAD_SEEN: &str = "discuss.channel.member/seen";
    pub const PRESENCE: &str = "bus.bus/im_status_updated";
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is neither a notification nor a list of notifications")]
    UnexpectedShape,
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
}

/// A decoded server push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireNotification", into = "WireNotification")]
pub struct Envelope {
    pub id: u64,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(id: u64, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireNotification {
    id: u64,
    message: WireMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl From<WireNotification> for Envelope {
    fn from(wire: WireNotification) -> Self {
        Self {
            id: wire.id,
            kind: wire.message.kind,
            payload: wire.message.payload,
        }
    }
}

impl From<Envelope> for WireNotification {
    fn from(envelope: Envelope) -> Self {
        Self {
            id: envelope.id,
            message: WireMessage {
                kind: envelope.kind,
                payload: envelope.payload,
            },
        }
    }
}

/// Decode one text frame into envelopes, in frame order.
///
/// The server sends a JSON array of notifications; a bare notification
/// object is accepted too. A malformed element is logged and skipped so the
/// rest of the batch still goes through; only a frame that is not JSON at
/// all (or not an array/object) is an error.
pub fn decode_frame(text: &str) -> Result<Vec<Envelope>, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let items = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => return Err(DecodeError::UnexpectedShape),
    };

    let mut envelopes = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Envelope>(item) {
            Ok(envelope) => envelopes.push(envelope),
            Err(err) => {
                warn!(
                    target = "busline::protocol",
                    error = %err,
                    "dropping malformed notification"
                );
            }
        }
    }
    Ok(envelopes)
}

/// Frames sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_name", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// (Re)join `channels`, asking for replay of everything after `last`.
    Subscribe { channels: Vec<String>, last: u64 },
    UpdatePresence { inactivity_period: u64 },
}

impl ClientFrame {
    pub fn to_text(&self) -> String {
        // Both variants only hold strings and integers.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Websocket close code as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const CLEAN: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const ABNORMAL_CLOSURE: Self = Self(1006);
    pub const SERVER_ERROR: Self = Self(1011);
    pub const RESTART: Self = Self(1012);
    pub const TRY_LATER: Self = Self(1013);
    pub const SESSION_EXPIRED: Self = Self(4001);
    pub const KEEP_ALIVE_TIMEOUT: Self = Self(4002);
    pub const RECONNECTING: Self = Self(4003);

    /// Closures the client or server asked for on purpose. These never
    /// count as network instability.
    pub fn is_planned(self) -> bool {
        matches!(
            self,
            Self::CLEAN | Self::GOING_AWAY | Self::SESSION_EXPIRED | Self::RECONNECTING
        )
    }

    /// The server will not accept this session again; reconnecting is
    /// pointless.
    pub fn is_terminal(self) -> bool {
        self == Self::SESSION_EXPIRED
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

/// Parse a server timestamp: `YYYY-MM-DD HH:MM:SS` in UTC, or RFC 3339.
pub fn parse_server_datetime(text: &str) -> Result<OffsetDateTime, DecodeError> {
    let server_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(naive) = PrimitiveDateTime::parse(text, server_format) {
        return Ok(naive.assume_utc());
    }
    OffsetDateTime::parse(text, &Rfc3339).map_err(|_| DecodeError::Timestamp(text.to_string()))
}

pub fn format_server_datetime(value: OffsetDateTime) -> String {
    let server_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let utc = value.to_offset(time::UtcOffset::UTC);
    utc.format(server_format).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_batched_notifications_in_order() {
        let text = r#"[
            {"id": 7, "message": {"type": "discuss.channel/new_message", "payload": {"id": 1}}},
            {"id": 8, "message": {"type": "bus.bus/im_status_updated", "payload": {"persona_id": 3}}}
        ]"#;
        let envelopes = decode_frame(text).expect("decode");
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].id, 7);
        assert_eq!(envelopes[0].kind, kinds::NEW_MESSAGE);
        assert_eq!(envelopes[1].payload, json!({"persona_id": 3}));
    }

    #[test]
    fn skips_malformed_items_but_keeps_the_rest() {
        let text = r#"[
            {"id": "nope", "message": {"type": "x"}},
            {"id": 9, "message": {"type": "mail.message/delete"}}
        ]"#;
        let envelopes = decode_frame(text).expect("decode");
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].id, 9);
        assert_eq!(envelopes[0].payload, Value::Null);
    }

    #[test]
    fn rejects_non_json_and_scalar_frames() {
        assert!(matches!(decode_frame("{oops"), Err(DecodeError::Json(_))));
        assert!(matches!(decode_frame("42"), Err(DecodeError::UnexpectedShape)));
    }

    #[test]
    fn subscribe_frame_wire_shape() {
        let frame = ClientFrame::Subscribe {
            channels: vec!["discuss.channel_1".into()],
            last: 41,
        };
        let value: Value = serde_json::from_str(&frame.to_text()).expect("json");
        assert_eq!(
            value,
            json!({"event_name": "subscribe", "data": {"channels": ["discuss.channel_1"], "last": 41}})
        );
    }

    #[test]
    fn planned_close_codes() {
        assert!(CloseCode::CLEAN.is_planned());
        assert!(CloseCode::SESSION_EXPIRED.is_planned());
        assert!(!CloseCode::ABNORMAL_CLOSURE.is_planned());
        assert!(!CloseCode::KEEP_ALIVE_TIMEOUT.is_planned());
        assert!(CloseCode::SESSION_EXPIRED.is_terminal());
        assert!(!CloseCode::RECONNECTING.is_terminal());
    }

    #[test]
    fn parses_both_timestamp_forms() {
        let server = parse_server_datetime("2024-03-05 10:11:12").expect("server form");
        let rfc = parse_server_datetime("2024-03-05T10:11:12Z").expect("rfc form");
        assert_eq!(server, rfc);
        assert_eq!(format_server_datetime(server), "2024-03-05 10:11:12");
        assert!(parse_server_datetime("yesterday").is_err());
    }
}
