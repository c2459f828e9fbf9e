// src/transport/codec.rs
//! Magic-prefixed, length-prefixed frame codec
//!
//! ```text
//! ┌──────────────┬────────────────────────┬──────────────────┐
//! │ MAGIC (4)    │ LENGTH (6, LE, u48)    │ PAYLOAD (LENGTH) │
//! └──────────────┴────────────────────────┴──────────────────┘
//! ```
//!
//! The decoder tolerates arbitrary fragmentation: partial magic, partial
//! header and partial payload all leave the buffer untouched until more
//! bytes arrive. Bytes that cannot start a frame are discarded while
//! scanning for the next magic sequence.

use crate::observability::{FRAMES_DECODED, PROTOCOL_ERRORS};
use crate::utils::errors::{ControllerError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Frame start marker
pub const MAGIC: [u8; 4] = [0x52, 0x43, 0x46, 0x01];

/// Width of the little-endian length field
pub const LENGTH_BYTES: usize = 6;

/// Magic plus length field
pub const HEADER_LEN: usize = MAGIC.len() + LENGTH_BYTES;

/// Largest length representable in the 6-byte field
pub const MAX_ENCODABLE_LEN: u64 = (1 << 48) - 1;

/// Build the 10-byte header for a payload of `len` bytes
pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN]> {
    let len = len as u64;
    if len > MAX_ENCODABLE_LEN {
        return Err(ControllerError::FrameTooLarge {
            len,
            max: MAX_ENCODABLE_LEN,
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(&MAGIC);
    let mut length = &mut header[MAGIC.len()..];
    length.put_uint_le(len, LENGTH_BYTES);
    Ok(header)
}

/// Codec turning a byte stream into frame payloads and back
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: u64,
}

impl FrameCodec {
    pub fn new(max_frame_len: u64) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_ENCODABLE_LEN),
        }
    }

    pub fn max_frame_len(&self) -> u64 {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(256 * 1024 * 1024)
    }
}

/// Position of the first complete magic sequence in `buf`
fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|window| window == MAGIC)
}

/// Length of the longest suffix of `buf` that is a proper prefix of the magic
fn partial_magic_suffix(buf: &[u8]) -> usize {
    (1..MAGIC.len())
        .rev()
        .find(|&n| buf.len() >= n && buf[buf.len() - n..] == MAGIC[..n])
        .unwrap_or(0)
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ControllerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match find_magic(src) {
            Some(0) => {}
            Some(offset) => {
                warn!(skipped = offset, "Discarding bytes before frame magic");
                metrics::counter!(PROTOCOL_ERRORS, "kind" => "garbage").increment(1);
                src.advance(offset);
            }
            None => {
                let keep = partial_magic_suffix(src);
                let discard = src.len() - keep;
                if discard > 0 {
                    warn!(skipped = discard, "Discarding bytes with no frame magic");
                    metrics::counter!(PROTOCOL_ERRORS, "kind" => "garbage").increment(1);
                    src.advance(discard);
                }
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let len = (&src[MAGIC.len()..HEADER_LEN]).get_uint_le(LENGTH_BYTES);
        if len > self.max_frame_len {
            metrics::counter!(PROTOCOL_ERRORS, "kind" => "oversized").increment(1);
            return Err(ControllerError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = HEADER_LEN + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len as usize).freeze();
        metrics::counter!(FRAMES_DECODED).increment(1);
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ControllerError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.len() as u64 > self.max_frame_len {
            return Err(ControllerError::FrameTooLarge {
                len: payload.len() as u64,
                max: self.max_frame_len,
            });
        }

        let header = encode_header(payload.len())?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&header);
        dst.put_slice(&payload);
        Ok(())
    }
}
