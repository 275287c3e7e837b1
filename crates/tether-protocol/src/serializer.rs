//! Codec for the tether wire envelope.
//!
//! Text frames carry the JSON array `[join_ref, ref, topic, event,
//! payload]`. Binary frames carry one kind byte followed by u8
//! length-prefixed UTF-8 fields and the raw payload:
//!
//! - push (0): `[0][join_ref_len][ref_len][topic_len][event_len]` + fields + payload
//! - reply (1): `[1][join_ref_len][ref_len][topic_len][status_len]` + fields + payload
//! - broadcast (2): `[2][topic_len][event_len]` + fields + payload
//!
//! Reply frames synthesize the literal `phx_reply` event and surface the
//! status/body pair as [`Payload::Reply`]. Declared field lengths are
//! validated against the remaining buffer; malformed frames are a decode
//! error, never a panic.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};
use thiserror::Error;

use crate::events::ChannelEvent;
use crate::message::{Message, Payload, WireFrame};

/// Frame kind identifiers for binary framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Push = 0,
    Reply = 1,
    Broadcast = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(FrameKind::Push),
            1 => Ok(FrameKind::Reply),
            2 => Ok(FrameKind::Broadcast),
            _ => Err(ProtocolError::UnknownKind(value)),
        }
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The kind byte is not a known frame kind.
    #[error("unknown binary frame kind: {0}")]
    UnknownKind(u8),

    /// The buffer ended before the declared frame contents.
    #[error("incomplete frame: need {needed} bytes, have {have}")]
    Incomplete {
        /// Bytes required by the header so far.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// A header field is not valid UTF-8.
    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// A header field exceeds the one-byte length prefix.
    #[error("field `{0}` exceeds the 255 byte framing limit")]
    FieldTooLong(&'static str),

    /// The text envelope is not a 5-element JSON array of the expected shape.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// JSON encoding or parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reply payloads exist only on the inbound path.
    #[error("reply payloads are decode-only")]
    EncodeReply,
}

/// Encode a message, choosing text or binary framing by payload type.
///
/// # Errors
///
/// Returns an error if a header field exceeds 255 bytes or the payload is
/// a decode-only reply.
pub fn encode(msg: &Message) -> Result<WireFrame, ProtocolError> {
    match &msg.payload {
        Payload::Json(value) => Ok(WireFrame::Text(encode_text(msg, value)?)),
        Payload::Binary(data) => Ok(WireFrame::Binary(encode_binary(msg, data)?)),
        Payload::Reply { .. } => Err(ProtocolError::EncodeReply),
    }
}

/// Decode a raw frame into a message envelope.
///
/// # Errors
///
/// Returns an error if the frame is truncated, malformed, or not UTF-8
/// where the framing requires it.
pub fn decode(raw: &WireFrame) -> Result<Message, ProtocolError> {
    match raw {
        WireFrame::Text(text) => decode_text(text),
        WireFrame::Binary(data) => decode_binary(data),
    }
}

fn encode_text(msg: &Message, payload: &Value) -> Result<String, ProtocolError> {
    let envelope = json!([msg.join_ref, msg.event_ref, msg.topic, msg.event, payload]);
    Ok(serde_json::to_string(&envelope)?)
}

fn encode_binary(msg: &Message, payload: &Bytes) -> Result<Bytes, ProtocolError> {
    let join_ref = msg.join_ref.as_deref().unwrap_or("");
    let event_ref = msg.event_ref.as_deref().unwrap_or("");
    check_field_len("join_ref", join_ref)?;
    check_field_len("ref", event_ref)?;
    check_field_len("topic", &msg.topic)?;
    check_field_len("event", &msg.event)?;

    let header = 5 + join_ref.len() + event_ref.len() + msg.topic.len() + msg.event.len();
    let mut buf = BytesMut::with_capacity(header + payload.len());
    buf.put_u8(FrameKind::Push as u8);
    buf.put_u8(join_ref.len() as u8);
    buf.put_u8(event_ref.len() as u8);
    buf.put_u8(msg.topic.len() as u8);
    buf.put_u8(msg.event.len() as u8);
    buf.extend_from_slice(join_ref.as_bytes());
    buf.extend_from_slice(event_ref.as_bytes());
    buf.extend_from_slice(msg.topic.as_bytes());
    buf.extend_from_slice(msg.event.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

fn check_field_len(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.len() > u8::MAX as usize {
        return Err(ProtocolError::FieldTooLong(field));
    }
    Ok(())
}

fn decode_text(raw: &str) -> Result<Message, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Array(items) = value else {
        return Err(ProtocolError::MalformedEnvelope("expected a JSON array"));
    };
    if items.len() != 5 {
        return Err(ProtocolError::MalformedEnvelope("expected 5 elements"));
    }
    let mut items = items.into_iter();
    let join_ref = optional_string(items.next().unwrap_or(Value::Null), "join_ref")?;
    let event_ref = optional_string(items.next().unwrap_or(Value::Null), "ref")?;
    let topic = required_string(items.next().unwrap_or(Value::Null), "topic")?;
    let event = required_string(items.next().unwrap_or(Value::Null), "event")?;
    let payload = items.next().unwrap_or(Value::Null);

    Ok(Message {
        join_ref,
        event_ref,
        topic,
        event,
        payload: Payload::Json(payload),
    })
}

fn optional_string(value: Value, field: &'static str) -> Result<Option<String>, ProtocolError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(ProtocolError::MalformedEnvelope(field)),
    }
}

fn required_string(value: Value, field: &'static str) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(ProtocolError::MalformedEnvelope(field)),
    }
}

fn decode_binary(data: &[u8]) -> Result<Message, ProtocolError> {
    let kind_byte = *data.first().ok_or(ProtocolError::Incomplete { needed: 1, have: 0 })?;
    match FrameKind::try_from(kind_byte)? {
        FrameKind::Push => decode_push(data),
        FrameKind::Reply => decode_reply(data),
        FrameKind::Broadcast => decode_broadcast(data),
    }
}

fn decode_push(data: &[u8]) -> Result<Message, ProtocolError> {
    ensure_header(data, 5)?;
    let mut reader = FieldReader::new(data, 5);
    let join_ref = reader.take(data[1] as usize, "join_ref")?.to_string();
    let event_ref = reader.take(data[2] as usize, "ref")?.to_string();
    let topic = reader.take(data[3] as usize, "topic")?.to_string();
    let event = reader.take(data[4] as usize, "event")?.to_string();

    Ok(Message {
        join_ref: non_empty(join_ref),
        event_ref: non_empty(event_ref),
        topic,
        event,
        payload: Payload::Binary(reader.rest()),
    })
}

fn decode_reply(data: &[u8]) -> Result<Message, ProtocolError> {
    ensure_header(data, 5)?;
    let mut reader = FieldReader::new(data, 5);
    let join_ref = reader.take(data[1] as usize, "join_ref")?.to_string();
    let event_ref = reader.take(data[2] as usize, "ref")?.to_string();
    let topic = reader.take(data[3] as usize, "topic")?.to_string();
    let status = reader.take(data[4] as usize, "status")?.to_string();

    Ok(Message {
        join_ref: non_empty(join_ref),
        event_ref: non_empty(event_ref),
        topic,
        event: ChannelEvent::Reply.as_str().to_string(),
        payload: Payload::Reply {
            status,
            response: reader.rest(),
        },
    })
}

fn decode_broadcast(data: &[u8]) -> Result<Message, ProtocolError> {
    ensure_header(data, 3)?;
    let mut reader = FieldReader::new(data, 3);
    let topic = reader.take(data[1] as usize, "topic")?.to_string();
    let event = reader.take(data[2] as usize, "event")?.to_string();

    Ok(Message {
        join_ref: None,
        event_ref: None,
        topic,
        event,
        payload: Payload::Binary(reader.rest()),
    })
}

fn ensure_header(data: &[u8], len: usize) -> Result<(), ProtocolError> {
    if data.len() < len {
        return Err(ProtocolError::Incomplete {
            needed: len,
            have: data.len(),
        });
    }
    Ok(())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Cursor over the variable-width header fields of a binary frame.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a str, ProtocolError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(ProtocolError::Incomplete {
                needed: end,
                have: self.data.len(),
            });
        }
        let raw = &self.data[self.pos..end];
        self.pos = end;
        std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn rest(self) -> Bytes {
        Bytes::copy_from_slice(&self.data[self.pos..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_frame(msg: &Message) -> String {
        match encode(msg).unwrap() {
            WireFrame::Text(text) => text,
            WireFrame::Binary(_) => panic!("expected text framing"),
        }
    }

    #[test]
    fn test_text_encode_exact_shape() {
        let msg = Message::new("room:1", "msg", Payload::Json(json!({"body": "hi"})))
            .with_join_ref("1")
            .with_ref("2");
        assert_eq!(text_frame(&msg), r#"["1","2","room:1","msg",{"body":"hi"}]"#);
    }

    #[test]
    fn test_text_encode_null_refs() {
        let msg = Message::heartbeat("7");
        assert_eq!(text_frame(&msg), r#"[null,"7","phoenix","heartbeat",{}]"#);
    }

    #[test]
    fn test_text_roundtrip() {
        let msg = Message::new("room:1", "shout", Payload::Json(json!({"n": 3})))
            .with_join_ref("4")
            .with_ref("9");
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_text_decode_reply() {
        let raw = r#"["1","2","room:1","phx_reply",{"status":"ok","response":{}}]"#;
        let msg = decode_text(raw).unwrap();
        assert!(msg.is_reply());
        let (status, response) = msg.payload.reply_parts().unwrap();
        assert_eq!(status, "ok");
        assert_eq!(response, Payload::empty());
    }

    #[test]
    fn test_text_decode_malformed() {
        assert!(decode_text("not json").is_err());
        assert!(decode_text(r#"{"topic":"room:1"}"#).is_err());
        assert!(decode_text(r#"["1","2","room:1"]"#).is_err());
        assert!(decode_text(r#"[3,"2","room:1","msg",{}]"#).is_err());
        assert!(decode_text(r#"["1","2",null,"msg",{}]"#).is_err());
    }

    #[test]
    fn test_binary_push_roundtrip() {
        let msg = Message::new("room:1", "file", Payload::binary(vec![1u8, 2, 3]))
            .with_join_ref("1")
            .with_ref("2");
        let frame = encode(&msg).unwrap();
        assert!(matches!(frame, WireFrame::Binary(_)));
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_binary_push_absent_refs() {
        let msg = Message::new("room:1", "file", Payload::binary(vec![9u8]));
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert!(decoded.join_ref.is_none());
        assert!(decoded.event_ref.is_none());
    }

    #[test]
    fn test_binary_reply_decode() {
        // [1][jr=1][ref=1][topic=6][status=2] "1" "2" "room:1" "ok" payload
        let mut data = vec![1u8, 1, 1, 6, 2];
        data.extend_from_slice(b"12room:1ok");
        data.extend_from_slice(&[0xde, 0xad]);
        let msg = decode_binary(&data).unwrap();
        assert_eq!(msg.event, "phx_reply");
        assert_eq!(msg.join_ref.as_deref(), Some("1"));
        assert_eq!(msg.event_ref.as_deref(), Some("2"));
        assert_eq!(msg.topic, "room:1");
        assert_eq!(
            msg.payload,
            Payload::Reply {
                status: "ok".into(),
                response: Bytes::from_static(&[0xde, 0xad]),
            }
        );
    }

    #[test]
    fn test_binary_broadcast_decode() {
        // [2][topic=6][event=5] "room:1" "alert" payload
        let mut data = vec![2u8, 6, 5];
        data.extend_from_slice(b"room:1alert");
        data.extend_from_slice(&[7u8]);
        let msg = decode_binary(&data).unwrap();
        assert!(msg.join_ref.is_none());
        assert!(msg.event_ref.is_none());
        assert_eq!(msg.topic, "room:1");
        assert_eq!(msg.event, "alert");
        assert_eq!(msg.payload, Payload::Binary(Bytes::from_static(&[7u8])));
    }

    #[test]
    fn test_binary_decode_truncated() {
        assert!(matches!(
            decode_binary(&[]),
            Err(ProtocolError::Incomplete { .. })
        ));
        assert!(matches!(
            decode_binary(&[0, 1, 1]),
            Err(ProtocolError::Incomplete { .. })
        ));
        // Declared lengths exceed the remaining buffer.
        assert!(matches!(
            decode_binary(&[0, 200, 1, 1, 1, b'a']),
            Err(ProtocolError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_binary_decode_unknown_kind() {
        assert!(matches!(
            decode_binary(&[9, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownKind(9))
        ));
    }

    #[test]
    fn test_binary_decode_invalid_utf8() {
        let data = vec![2u8, 2, 0, 0xff, 0xfe];
        assert!(matches!(
            decode_binary(&data),
            Err(ProtocolError::InvalidUtf8("topic"))
        ));
    }

    #[test]
    fn test_encode_field_too_long() {
        let topic = "t".repeat(300);
        let msg = Message::new(topic, "file", Payload::binary(vec![0u8]));
        assert!(matches!(
            encode(&msg),
            Err(ProtocolError::FieldTooLong("topic"))
        ));
    }

    #[test]
    fn test_encode_reply_rejected() {
        let msg = Message::new(
            "room:1",
            "phx_reply",
            Payload::Reply {
                status: "ok".into(),
                response: Bytes::new(),
            },
        );
        assert!(matches!(encode(&msg), Err(ProtocolError::EncodeReply)));
    }
}
