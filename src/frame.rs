//! Frame kinds and the broker payload codec.
//!
//! A frame is the unit of traffic in both directions:
//!
//! ```text
//! socket  ── yrs lib0 encoding ──►  varint kind (0|1) + var-length body
//! broker  ── raw payload       ──►  one kind byte (0x00|0x01) + raw body
//! ```
//!
//! On the socket we speak `yrs::sync::Message` directly, so encoding and
//! decoding belong to the CRDT library. On the broker the payload is the
//! kind byte followed by the raw update / awareness-diff bytes; this module
//! owns that layout.

use yrs::sync::{Message, SyncMessage};
use yrs::updates::encoder::Encode;

/// Broker message property values for the `messageType` key.
pub const MESSAGE_TYPE_SYNC: &str = "sync";
pub const MESSAGE_TYPE_AWARENESS: &str = "awareness";
pub const MESSAGE_TYPE_COMPACTION: &str = "compaction";

/// Wire kind of a frame. The discriminants are the broker kind bytes and the
/// lib0 message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Sync = 0x00,
    Awareness = 0x01,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(FrameKind::Sync),
            0x01 => Some(FrameKind::Awareness),
            _ => None,
        }
    }

    /// Property value published alongside a broker message of this kind.
    pub fn message_type(self) -> &'static str {
        match self {
            FrameKind::Sync => MESSAGE_TYPE_SYNC,
            FrameKind::Awareness => MESSAGE_TYPE_AWARENESS,
        }
    }
}

/// Broker payload errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty payload")]
    Empty,
    #[error("payload has kind byte but no body")]
    EmptyBody,
    #[error("unknown frame kind byte 0x{0:02x}")]
    UnknownKind(u8),
}

/// Encode a broker payload: kind byte followed by the raw body.
pub fn encode_topic_payload(kind: FrameKind, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(kind.as_byte());
    payload.extend_from_slice(body);
    payload
}

/// Split a broker payload into kind and body.
///
/// Rejects empty payloads, payloads with no body, and unknown kind bytes;
/// the ingest loop logs these and acknowledges without dispatching.
pub fn decode_topic_payload(payload: &[u8]) -> Result<(FrameKind, &[u8]), FrameError> {
    let (&kind, body) = payload.split_first().ok_or(FrameError::Empty)?;
    if body.is_empty() {
        return Err(FrameError::EmptyBody);
    }
    let kind = FrameKind::from_byte(kind).ok_or(FrameError::UnknownKind(kind))?;
    Ok((kind, body))
}

/// Wrap a raw CRDT update into the socket frame peers expect.
pub fn sync_update_frame(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_payload_roundtrip() {
        let payload = encode_topic_payload(FrameKind::Sync, &[1, 2, 3]);
        assert_eq!(payload, vec![0x00, 1, 2, 3]);

        let (kind, body) = decode_topic_payload(&payload).unwrap();
        assert_eq!(kind, FrameKind::Sync);
        assert_eq!(body, &[1, 2, 3]);
    }

    #[test]
    fn test_awareness_payload_roundtrip() {
        let payload = encode_topic_payload(FrameKind::Awareness, &[9]);
        let (kind, body) = decode_topic_payload(&payload).unwrap();
        assert_eq!(kind, FrameKind::Awareness);
        assert_eq!(body, &[9]);
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert_eq!(decode_topic_payload(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn test_kind_only_payload_rejected() {
        assert_eq!(decode_topic_payload(&[0x00]), Err(FrameError::EmptyBody));
        assert_eq!(decode_topic_payload(&[0x01]), Err(FrameError::EmptyBody));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(
            decode_topic_payload(&[0xff, 1, 2]),
            Err(FrameError::UnknownKind(0xff))
        );
    }

    #[test]
    fn test_kind_bytes_stable() {
        assert_eq!(FrameKind::Sync.as_byte(), 0x00);
        assert_eq!(FrameKind::Awareness.as_byte(), 0x01);
        assert_eq!(FrameKind::from_byte(0x00), Some(FrameKind::Sync));
        assert_eq!(FrameKind::from_byte(0x01), Some(FrameKind::Awareness));
        assert_eq!(FrameKind::from_byte(0x02), None);
    }

    #[test]
    fn test_sync_update_frame_decodes_as_message() {
        use yrs::sync::{Message, SyncMessage};
        use yrs::updates::decoder::Decode;

        let frame = sync_update_frame(vec![4, 5, 6]);
        let decoded = Message::decode_v1(&frame).unwrap();
        match decoded {
            Message::Sync(SyncMessage::Update(update)) => assert_eq!(update, vec![4, 5, 6]),
            other => panic!("expected sync update, got {other:?}"),
        }
    }
}
