use super::Protocol;
use crate::error::CodecError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Width of the length prefix.
pub const PREFIX_LEN: usize = 4;

const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingLength,
    AwaitingBody(usize),
}

/// Length-prefixed framing: `[u32 little-endian length][payload]`.
///
/// The decoder is incremental. The prefix is consumed as soon as four bytes are
/// available and the expected length is kept across calls, so frames survive any
/// number of partial reads.
///
/// # Example
/// ```ignore
/// let mut codec = FrameCodec::new();
/// let mut buffer = BytesMut::from(&FrameCodec::build(b"ping")?[..]);
/// assert_eq!(codec.decode_next(&mut buffer)?, Some(Bytes::from_static(b"ping")));
/// ```
#[derive(Debug, Clone)]
pub struct FrameCodec {
    phase: Phase,
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Creates a codec that rejects frames larger than `max` bytes.
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            phase: Phase::AwaitingLength,
            max_frame_length: max,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Encodes `payload` as one frame.
    pub fn build(payload: &[u8]) -> Result<Bytes, CodecError> {
        let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut frame = BytesMut::with_capacity(PREFIX_LEN + payload.len());
        frame.put_u32_le(len);
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    /// Body length announced by the prefix already consumed, if any.
    pub fn expected_length(&self) -> Option<usize> {
        match self.phase {
            Phase::AwaitingLength => None,
            Phase::AwaitingBody(len) => Some(len),
        }
    }
}

impl Protocol for FrameCodec {
    fn decode_next(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if self.phase == Phase::AwaitingLength {
            if buffer.len() < PREFIX_LEN {
                return Ok(None);
            }

            let len = buffer.get_u32_le() as usize;
            if len > self.max_frame_length {
                return Err(CodecError::FrameTooLarge {
                    len,
                    max: self.max_frame_length,
                });
            }
            self.phase = Phase::AwaitingBody(len);
        }

        let Phase::AwaitingBody(len) = self.phase else {
            return Ok(None);
        };

        if buffer.len() < len {
            buffer.reserve(len - buffer.len());
            return Ok(None);
        }

        self.phase = Phase::AwaitingLength;
        Ok(Some(buffer.split_to(len).freeze()))
    }

    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_length,
            });
        }
        Self::build(payload)
    }

    fn is_mid_frame(&self) -> bool {
        self.phase != Phase::AwaitingLength
    }
}
