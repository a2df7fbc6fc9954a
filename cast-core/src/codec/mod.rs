//! Length-prefixed framing for the cast byte stream.
//!
//! ```text
//! ┌──────────────┬───────────────────────────┐
//! │ len: u32 BE  │ body: len bytes           │
//! └──────────────┴───────────────────────────┘
//! ```
//!
//! The prefix is the only message boundary on the wire. A prefix larger
//! than [`MAX_FRAME_SIZE`] is a protocol violation: the decoder fails and
//! the owning connection is torn down. The encoder refuses oversized
//! bodies before a single byte is written.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CastError;
use crate::message::Message;

/// Largest accepted frame body (10 MiB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Append `payload` to `dst` behind its length prefix.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut, max: usize) -> Result<(), CastError> {
    if payload.len() > max {
        return Err(CastError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }
    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Split one complete frame body off the front of `src`.
///
/// Returns `Ok(None)` until the whole frame has arrived. The length check
/// happens as soon as the prefix is readable, so an oversized frame is
/// rejected without buffering its body.
pub fn decode_frame(src: &mut BytesMut, max: usize) -> Result<Option<Bytes>, CastError> {
    if src.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > max {
        return Err(CastError::FrameTooLarge { size: len, max });
    }

    let total = LENGTH_PREFIX_LEN + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_LEN);
    Ok(Some(src.split_to(len).freeze()))
}

// ── CastCodec ────────────────────────────────────────────────────

/// `tokio_util` codec turning a byte stream into [`Message`]s and back.
#[derive(Debug, Clone, Copy)]
pub struct CastCodec {
    max_frame_size: usize,
}

impl CastCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a custom frame limit. Used by tests to exercise the
    /// oversize path without multi-megabyte buffers.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for CastCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CastCodec {
    type Item = Message;
    type Error = CastError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_frame(src, self.max_frame_size)? {
            Some(body) => Message::parse(body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for CastCodec {
    type Error = CastError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.encoded_len();
        if len > self.max_frame_size {
            return Err(CastError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_PREFIX_LEN + len);
        dst.put_u32(len as u32);
        item.write_to(dst);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
