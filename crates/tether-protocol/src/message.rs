//! Message envelope types for tether.
//!
//! Every frame on the wire carries the same five-field envelope:
//! `[join_ref, ref, topic, event, payload]`. The `ref` correlates a reply
//! to a specific push; the `join_ref` identifies which join instance of a
//! topic a message belongs to, so stale join instances can be discarded.

use bytes::Bytes;
use serde_json::{json, Value};

use crate::events::{ChannelEvent, HEARTBEAT_EVENT, SYSTEM_TOPIC};

/// A raw frame as handed to or received from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// A text frame carrying the JSON array envelope.
    Text(String),
    /// A binary frame carrying the kind-byte framing.
    Binary(Bytes),
}

impl WireFrame {
    /// Get the frame size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    /// Check if the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message payload.
///
/// JSON payloads travel in text frames; binary payloads force binary
/// framing. `Reply` is produced only when decoding binary reply frames,
/// where the status travels in the header and the response body stays raw.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A JSON value.
    Json(Value),
    /// Raw binary data.
    Binary(Bytes),
    /// A decoded binary reply: status plus raw response body.
    Reply {
        /// Reply status, e.g. `"ok"` or `"error"`.
        status: String,
        /// Raw response body.
        response: Bytes,
    },
}

impl Payload {
    /// The empty JSON object payload.
    #[must_use]
    pub fn empty() -> Self {
        Payload::Json(json!({}))
    }

    /// Create a binary payload.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Payload::Binary(data.into())
    }

    /// Check whether this payload requires binary framing.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// Split a reply-shaped payload into its status and response body.
    ///
    /// Returns `None` when the payload is not shaped like a reply.
    #[must_use]
    pub fn reply_parts(&self) -> Option<(String, Payload)> {
        match self {
            Payload::Json(value) => {
                let status = value.get("status")?.as_str()?.to_string();
                let response = value.get("response").cloned().unwrap_or_else(|| json!({}));
                Some((status, Payload::Json(response)))
            }
            Payload::Reply { status, response } => {
                Some((status.clone(), Payload::Binary(response.clone())))
            }
            Payload::Binary(_) => None,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Binary(data)
    }
}

/// The decoded message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Identifies the join instance of the topic this message belongs to.
    pub join_ref: Option<String>,
    /// Correlates a reply to a specific push.
    pub event_ref: Option<String>,
    /// Logical channel name, e.g. `"room:1"`.
    pub topic: String,
    /// Event name, e.g. `"phx_join"` or an application-defined event.
    pub event: String,
    /// Event payload.
    pub payload: Payload,
}

impl Message {
    /// Create a new message with no refs attached.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Payload) -> Self {
        Self {
            join_ref: None,
            event_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Attach a join ref.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Attach a push ref.
    #[must_use]
    pub fn with_ref(mut self, event_ref: impl Into<String>) -> Self {
        self.event_ref = Some(event_ref.into());
        self
    }

    /// A heartbeat message on the system topic.
    #[must_use]
    pub fn heartbeat(event_ref: impl Into<String>) -> Self {
        Message::new(SYSTEM_TOPIC, HEARTBEAT_EVENT, Payload::empty()).with_ref(event_ref)
    }

    /// Check whether this message is a reply envelope.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.event == ChannelEvent::Reply.as_str()
    }
}
