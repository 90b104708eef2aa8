//! Control-message codec
//!
//! Defines the JSON protocol spoken between the client transport and a
//! terminal session. Every frame is one `ControlMessage`; an unparseable
//! payload or an unknown operation is a protocol error that ends the
//! session, never a silent no-op.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Time allowed to write a message to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Maximum message size allowed from peer.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Time allowed to read the next pong message from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Send pings to peer with this period. Must be less than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Written into the stdin stream to signal "no more input" to the remote
/// process when the transport read path fails or the client disconnects.
pub const END_OF_TRANSMISSION: &str = "\u{0004}";

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode control message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Frame operations. Clients send `stdin`, `resize` and `ping`; the bridge
/// sends `stdout`. Anything else fails decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Stdin,
    Stdout,
    Resize,
    Ping,
}

/// The messaging protocol between the client transport and a terminal
/// session. `data` carries the payload for `stdin`/`stdout`; `rows`/`cols`
/// carry the new geometry for `resize`; `ping` carries nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rows: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cols: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl ControlMessage {
    /// Create a `stdin` message
    pub fn stdin(data: impl Into<String>) -> Self {
        Self {
            operation: Operation::Stdin,
            data: data.into(),
            rows: 0,
            cols: 0,
        }
    }

    /// Create a `stdout` message
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            operation: Operation::Stdout,
            data: data.into(),
            rows: 0,
            cols: 0,
        }
    }

    /// Create a `resize` message
    pub fn resize(rows: u16, cols: u16) -> Self {
        Self {
            operation: Operation::Resize,
            data: String::new(),
            rows,
            cols,
        }
    }

    /// Create a `ping` message
    pub fn ping() -> Self {
        Self {
            operation: Operation::Ping,
            data: String::new(),
            rows: 0,
            cols: 0,
        }
    }

    /// Decode a frame. Failure is terminal for the session.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::Malformed)
    }

    /// Serialize the message to a single JSON frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}
