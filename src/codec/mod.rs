//! Message framing.
//!
//! A [`Protocol`] turns the bytes read from a connection into discrete messages and
//! back. [`FrameCodec`] is the stock implementation: a 4-byte length prefix followed by
//! the payload.

mod frame;

pub use frame::{FrameCodec, PREFIX_LEN};

use crate::error::CodecError;

use bytes::{Bytes, BytesMut};

/// Outcome of the one-shot exchange that gates message dispatch on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Messages may flow.
    Complete,
    /// Not enough bytes yet; call again after the next read.
    Pending,
    /// The peer failed the exchange; the connection is closed.
    Rejected,
}

/// Incremental message parser and encoder bound to one connection.
pub trait Protocol {
    /// Runs before any message is decoded. May consume bytes from `buffer`.
    fn handshake(&mut self, _buffer: &mut BytesMut) -> Handshake {
        Handshake::Complete
    }

    /// Extracts the next complete message, or `Ok(None)` when more bytes are needed.
    fn decode_next(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, CodecError>;

    /// Wraps `payload` for the wire.
    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError>;

    /// Returns `true` when a message has been started but not finished.
    fn is_mid_frame(&self) -> bool {
        false
    }
}
