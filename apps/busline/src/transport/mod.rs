//! The long-lived server connection and the lifecycle events it reports.

use thiserror::Error;

use crate::protocol::CloseCode;

pub mod backoff;
pub mod websocket;

pub use backoff::Backoff;
pub use websocket::{ChannelConfig, ChannelHandle, WebSocketChannel};

/// Lifecycle and payload events emitted by a transport channel, in the order
/// they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First successful connection.
    Connect,
    Disconnect {
        code: CloseCode,
    },
    /// A retry is scheduled.
    Reconnecting {
        attempt: u32,
    },
    /// Connection re-established after a disconnect.
    Reconnect,
    /// One text frame from the server.
    Frame(String),
}

/// OS-level network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    Online,
    Offline,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported url scheme {0}; expected ws or wss")]
    UnsupportedScheme(String),
    #[error("transport channel closed")]
    Closed,
}
