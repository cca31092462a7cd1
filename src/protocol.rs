//! Wire format: inbound client frames and outbound server events.
//!
//! Every WebSocket text frame carries one JSON document. Inbound frames
//! are decoded once at the boundary into a closed [`ClientFrame`] variant;
//! everything malformed maps to a [`FrameError`] that is answered to the
//! sender only and never mutates state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// `{"type":"join","user"?:...,"room"?:...}`: update presence.
    Join {
        user: Option<String>,
        room: Option<String>,
    },
    /// `{"type":"msg","text":...}`: chat message to the sender's room.
    Msg { text: String },
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload is not well-formed JSON.
    InvalidJson,
    /// Payload is not an object or lacks the `type` discriminator.
    MissingType,
    /// The `type` value is not one we dispatch on.
    UnknownType,
    /// A `msg` frame without the required `text` field.
    MissingText,
}

impl FrameError {
    /// Error text sent back to the client.
    pub fn text(self) -> &'static str {
        match self {
            FrameError::InvalidJson => "invalid json",
            FrameError::MissingType => "missing type",
            FrameError::UnknownType => "unknown type",
            FrameError::MissingText => "missing text",
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

impl ClientFrame {
    /// Decode one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| FrameError::InvalidJson)?;

        let obj = value.as_object().ok_or(FrameError::MissingType)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?;

        match kind {
            "join" => Ok(ClientFrame::Join {
                user: obj.get("user").and_then(Value::as_str).map(str::to_string),
                room: obj.get("room").and_then(Value::as_str).map(str::to_string),
            }),
            "msg" => {
                let text = obj
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or(FrameError::MissingText)?;
                Ok(ClientFrame::Msg {
                    text: text.to_string(),
                })
            }
            _ => Err(FrameError::UnknownType),
        }
    }
}

/// An outbound event, serialized to one JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Room-scoped notice (welcome, join, leave).
    System {
        text: String,
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// A chat message relayed to a room.
    Msg {
        from: String,
        user_id: String,
        client_id: String,
        room_id: String,
        text: String,
    },
    /// Sender-only rejection of an inbound frame.
    Error { text: String },
    /// Sender-only acknowledgment of a `join` (debug replies enabled).
    DebugJoin {
        client_id: String,
        user_id: String,
        name: String,
        room_id: String,
    },
    /// Sender-only acknowledgment of a `msg` (debug replies enabled).
    DebugMsg {
        client_id: String,
        user_id: String,
        name: String,
        room_id: String,
        text: String,
    },
}

impl ServerEvent {
    /// Sender-only error reply for a rejected frame.
    pub fn error(err: FrameError) -> Self {
        ServerEvent::Error {
            text: err.text().to_string(),
        }
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> String {
        // The enum is string-typed throughout; serialization cannot fail.
        serde_json::to_string(self).expect("event serialization")
    }
}
