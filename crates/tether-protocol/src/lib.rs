//! # tether-protocol
//!
//! Wire protocol definitions for the tether realtime client.
//!
//! This crate defines the message envelope and the codecs used between
//! tether clients and channel servers: a JSON array envelope over text
//! frames and a compact kind-byte framing for binary payloads.
//!
//! ## Envelope
//!
//! Every message carries `[join_ref, ref, topic, event, payload]`:
//! the `ref` correlates a reply to a push, the `join_ref` pins a message
//! to one join instance of a topic.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{serializer, Message, Payload};
//! use serde_json::json;
//!
//! let msg = Message::new("room:1", "shout", Payload::Json(json!({"body": "hi"})))
//!     .with_join_ref("1")
//!     .with_ref("2");
//!
//! let frame = serializer::encode(&msg).unwrap();
//! let decoded = serializer::decode(&frame).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod events;
pub mod message;
pub mod serializer;

pub use events::ChannelEvent;
pub use message::{Message, Payload, WireFrame};
pub use serializer::{decode, encode, FrameKind, ProtocolError};
