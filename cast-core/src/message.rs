//! Control and media messages carried inside length-prefixed frames.
//!
//! Byte 0 of every frame body is the message type; the rest is the
//! type-specific body. All integers are big-endian.
//!
//! ```text
//! 0x00  handshake     version:u32 width:u32 height:u32 fps:u32
//! 0x00  handshake ack (empty body, receiver → sender)
//! 0x01  video frame   timestamp_ms:u32 payload:bytes
//! 0x02  heartbeat     (empty body, both directions)
//! 0xFF  error         len:u32 utf8[len]
//! ```
//!
//! Unknown type bytes parse to [`Message::Unknown`] so newer peers can add
//! types without breaking older ones.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CastError;

/// Version number sent in every handshake.
pub const PROTOCOL_VERSION: u32 = 1;

// ── MessageType ──────────────────────────────────────────────────

/// Leading type byte of a frame body.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Handshake request (sender) or acknowledgment (receiver).
    Handshake = 0x00,
    /// One encoded video unit.
    VideoFrame = 0x01,
    /// Keep-alive, echoed by the receiver.
    Heartbeat = 0x02,
    /// Error report; the connection closes after it.
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = CastError;

    fn try_from(value: u8) -> Result<Self, CastError> {
        match value {
            0x00 => Ok(MessageType::Handshake),
            0x01 => Ok(MessageType::VideoFrame),
            0x02 => Ok(MessageType::Heartbeat),
            0xFF => Ok(MessageType::Error),
            _ => Err(CastError::UnknownVariant {
                type_name: "MessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Handshake => write!(f, "Handshake"),
            MessageType::VideoFrame => write!(f, "VideoFrame"),
            MessageType::Heartbeat => write!(f, "Heartbeat"),
            MessageType::Error => write!(f, "Error"),
        }
    }
}

// ── Handshake ────────────────────────────────────────────────────

/// Stream parameters announced by the sender right after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Handshake {
    /// Encoded body size, excluding the type byte.
    pub const WIRE_LEN: usize = 16;

    /// Build a handshake for the current protocol version.
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            width,
            height,
            fps,
        }
    }
}

// ── Message ──────────────────────────────────────────────────────

/// A parsed frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck,
    VideoFrame { timestamp_ms: u32, payload: Bytes },
    Heartbeat,
    Error(String),
    /// A type byte this build does not know. Logged and ignored.
    Unknown(u8),
}

impl Message {
    /// Wrap an encoded unit, stamping it with the current wall clock.
    pub fn video_frame(payload: Bytes) -> Self {
        Message::VideoFrame {
            timestamp_ms: timestamp_now_ms(),
            payload,
        }
    }

    /// The wire type of this message, `None` for [`Message::Unknown`].
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Message::Handshake(_) | Message::HandshakeAck => Some(MessageType::Handshake),
            Message::VideoFrame { .. } => Some(MessageType::VideoFrame),
            Message::Heartbeat => Some(MessageType::Heartbeat),
            Message::Error(_) => Some(MessageType::Error),
            Message::Unknown(_) => None,
        }
    }

    /// Size of the frame body this message encodes to.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Message::Handshake(_) => Handshake::WIRE_LEN,
            Message::VideoFrame { payload, .. } => 4 + payload.len(),
            Message::Error(text) => 4 + text.len(),
            Message::HandshakeAck | Message::Heartbeat | Message::Unknown(_) => 0,
        }
    }

    /// Append the frame body (type byte + body, no length prefix) to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        match self {
            Message::Handshake(h) => {
                dst.put_u8(MessageType::Handshake as u8);
                dst.put_u32(h.version);
                dst.put_u32(h.width);
                dst.put_u32(h.height);
                dst.put_u32(h.fps);
            }
            Message::HandshakeAck => dst.put_u8(MessageType::Handshake as u8),
            Message::VideoFrame {
                timestamp_ms,
                payload,
            } => {
                dst.put_u8(MessageType::VideoFrame as u8);
                dst.put_u32(*timestamp_ms);
                dst.extend_from_slice(payload);
            }
            Message::Heartbeat => dst.put_u8(MessageType::Heartbeat as u8),
            Message::Error(text) => {
                dst.put_u8(MessageType::Error as u8);
                dst.put_u32(text.len() as u32);
                dst.extend_from_slice(text.as_bytes());
            }
            Message::Unknown(tag) => dst.put_u8(*tag),
        }
    }

    /// Encode into a standalone frame body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Parse a frame body.
    ///
    /// A type byte of `0x00` with no body is a handshake acknowledgment;
    /// with at least 16 bytes it is a handshake request. Trailing bytes
    /// after a fixed-size body are ignored.
    pub fn parse(mut body: Bytes) -> Result<Self, CastError> {
        if body.is_empty() {
            return Err(CastError::ProtocolViolation("empty message body"));
        }
        let tag = body.get_u8();

        let kind = match MessageType::try_from(tag) {
            Ok(kind) => kind,
            Err(_) => return Ok(Message::Unknown(tag)),
        };

        match kind {
            MessageType::Handshake if body.is_empty() => Ok(Message::HandshakeAck),
            MessageType::Handshake => {
                ensure_len("handshake", Handshake::WIRE_LEN, &body)?;
                Ok(Message::Handshake(Handshake {
                    version: body.get_u32(),
                    width: body.get_u32(),
                    height: body.get_u32(),
                    fps: body.get_u32(),
                }))
            }
            MessageType::VideoFrame => {
                ensure_len("video frame", 4, &body)?;
                let timestamp_ms = body.get_u32();
                Ok(Message::VideoFrame {
                    timestamp_ms,
                    payload: body,
                })
            }
            MessageType::Heartbeat => Ok(Message::Heartbeat),
            MessageType::Error => {
                ensure_len("error", 4, &body)?;
                let len = body.get_u32() as usize;
                ensure_len("error", len, &body)?;
                let text = String::from_utf8_lossy(&body[..len]).into_owned();
                Ok(Message::Error(text))
            }
        }
    }
}

fn ensure_len(kind: &'static str, needed: usize, body: &Bytes) -> Result<(), CastError> {
    if body.len() < needed {
        return Err(CastError::Truncated {
            kind,
            needed,
            actual: body.len(),
        });
    }
    Ok(())
}

/// Current wall-clock time in milliseconds, truncated to 32 bits.
///
/// Wraps roughly every 49.7 days; receivers only compare nearby values.
pub fn timestamp_now_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_roundtrip() {
        for t in [
            MessageType::Handshake,
            MessageType::VideoFrame,
            MessageType::Heartbeat,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::try_from(t as u8).unwrap(), t);
        }
        assert!(MessageType::try_from(0x42).is_err());
    }

    #[test]
    fn handshake_wire_layout() {
        let bytes = Message::Handshake(Handshake::new(1920, 1080, 30)).to_bytes();
        assert_eq!(
            &bytes[..],
            &[
                0x00, 0, 0, 0, 1, 0, 0, 0x07, 0x80, 0, 0, 0x04, 0x38, 0, 0, 0, 30
            ]
        );
    }

    #[test]
    fn handshake_parses_back() {
        let sent = Handshake::new(1920, 1080, 30);
        let parsed = Message::parse(Message::Handshake(sent).to_bytes()).unwrap();
        assert_eq!(parsed, Message::Handshake(sent));
        if let Message::Handshake(h) = parsed {
            assert_eq!(h.version, 1);
        }
    }

    #[test]
    fn empty_handshake_is_ack() {
        let parsed = Message::parse(Bytes::from_static(&[0x00])).unwrap();
        assert_eq!(parsed, Message::HandshakeAck);
    }

    #[test]
    fn short_handshake_is_truncated() {
        let err = Message::parse(Bytes::from_static(&[0x00, 0, 0, 0, 1])).unwrap_err();
        assert!(matches!(
            err,
            CastError::Truncated {
                kind: "handshake",
                needed: 16,
                actual: 4
            }
        ));
    }

    #[test]
    fn video_frame_layout() {
        let msg = Message::VideoFrame {
            timestamp_ms: 0x0102_0304,
            payload: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
        };
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..5], &[0x01, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[5..], &[0, 0, 0, 1, 0x65]);
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(Message::parse(bytes).unwrap(), msg);
    }

    #[test]
    fn video_frame_without_payload() {
        let parsed = Message::parse(Bytes::from_static(&[0x01, 0, 0, 0, 9])).unwrap();
        assert_eq!(
            parsed,
            Message::VideoFrame {
                timestamp_ms: 9,
                payload: Bytes::new()
            }
        );
    }

    #[test]
    fn error_message_layout() {
        let bytes = Message::Error("bad".into()).to_bytes();
        assert_eq!(&bytes[..], &[0xFF, 0, 0, 0, 3, b'b', b'a', b'd']);
        assert_eq!(
            Message::parse(bytes).unwrap(),
            Message::Error("bad".into())
        );
    }

    #[test]
    fn error_length_beyond_body_is_truncated() {
        let err = Message::parse(Bytes::from_static(&[0xFF, 0, 0, 0, 10, b'x'])).unwrap_err();
        assert!(matches!(err, CastError::Truncated { kind: "error", .. }));
    }

    #[test]
    fn unknown_tag_is_not_an_error() {
        let parsed = Message::parse(Bytes::from_static(&[0x7A, 1, 2, 3])).unwrap();
        assert_eq!(parsed, Message::Unknown(0x7A));
        assert_eq!(parsed.message_type(), None);
    }

    #[test]
    fn empty_body_is_violation() {
        assert!(matches!(
            Message::parse(Bytes::new()),
            Err(CastError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn heartbeat_is_single_byte() {
        assert_eq!(&Message::Heartbeat.to_bytes()[..], &[0x02]);
        assert_eq!(
            Message::parse(Bytes::from_static(&[0x02])).unwrap(),
            Message::Heartbeat
        );
    }
}
