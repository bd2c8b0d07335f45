//! Backpressure writer.
//!
//! A [`Stream`] never blocks and never fails just because the kernel send buffer is
//! full. Bytes that cannot be written right away go to a per-handle
//! [`OverflowBuffer`]; [`Stream::drain`] moves them to the socket once it is writable
//! again. The overflow is a single FIFO, so the peer always receives bytes in the
//! order they were submitted.

use super::handle::{HandleId, Transport};
use super::overflow::{HandleLimiter, HandlePermit, OverflowBuffer};
use crate::reactor::AfterFork;

use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, trace};

/// State of the overflow after a drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Nothing left in overflow; the backing file is gone.
    Complete,
    /// The socket filled up again; the rest stays buffered.
    Pending,
}

#[derive(Debug)]
pub struct Stream<T> {
    transport: T,
    overflow: Option<OverflowBuffer>,
    limiter: HandleLimiter,
    runtime_dir: PathBuf,
    dropped: u64,
    closed: bool,
    _handle: HandlePermit,
}

impl<T: Transport> Stream<T> {
    /// Wraps `transport`, counting its descriptor against `limiter` for as long as the
    /// stream lives.
    pub fn new(transport: T, limiter: HandleLimiter, runtime_dir: impl Into<PathBuf>) -> Self {
        let handle = limiter.register();
        Self {
            transport,
            overflow: None,
            limiter,
            runtime_dir: runtime_dir.into(),
            dropped: 0,
            closed: false,
            _handle: handle,
        }
    }

    pub fn id(&self) -> HandleId {
        self.transport.id()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// `true` while an overflow file holds unsent bytes.
    pub fn is_buffering(&self) -> bool {
        self.overflow.is_some()
    }

    pub fn buffered_len(&self) -> u64 {
        self.overflow.as_ref().map_or(0, OverflowBuffer::len)
    }

    pub fn overflow_path(&self) -> Option<&Path> {
        self.overflow.as_ref().map(OverflowBuffer::path)
    }

    /// Bytes discarded because no overflow could hold them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Writes `data`, spilling whatever the socket does not take.
    ///
    /// Pending overflow is flushed first. The payload is then written in chunks of the
    /// send-buffer size; at the first short write the rest of that chunk and every
    /// later chunk are appended to the overflow. Returns the number of bytes that
    /// reached the socket during this call. Overflow that cannot be stored is dropped
    /// and counted rather than failing the write.
    ///
    /// Writing here does not schedule draining. Streams owned by a reactor are written
    /// through [`ReactorHandle::write`](crate::reactor::ReactorHandle::write), which
    /// hands a new overflow to the buffer service; a direct caller drains with
    /// [`Stream::drain`] itself.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream is closed"));
        }

        if self.is_buffering() && self.drain()? == Drain::Pending {
            self.spill(data);
            return Ok(0);
        }

        let chunk = self.transport.chunk_size().max(1);
        let mut written = 0;

        for piece in data.chunks(chunk) {
            let n = self.transport.try_write(piece)?;
            written += n;
            if n < piece.len() {
                self.spill(&data[written..]);
                break;
            }
        }

        trace!(handle = %self.id(), written, total = data.len(), "write");
        Ok(written)
    }

    /// Moves buffered bytes to the socket, one send-buffer sized chunk at a time.
    pub fn drain(&mut self) -> io::Result<Drain> {
        let Some(overflow) = self.overflow.as_mut() else {
            return Ok(Drain::Complete);
        };

        let chunk = self.transport.chunk_size().max(1);
        while !overflow.is_empty() {
            let pending = overflow.peek(chunk)?;
            let n = self.transport.try_write(&pending)?;
            overflow.consume(n);
            if n < pending.len() {
                return Ok(Drain::Pending);
            }
        }

        if let Some(overflow) = self.overflow.take() {
            overflow.close()?;
        }
        trace!(handle = %self.id(), "overflow drained");
        Ok(Drain::Complete)
    }

    /// Discards buffered bytes and refuses further writes.
    pub fn close(&mut self) {
        self.overflow = None;
        self.closed = true;
    }

    fn spill(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if self.overflow.is_none() {
            let Some(permit) = self.limiter.try_acquire() else {
                error!(
                    handle = %self.id(),
                    bytes = data.len(),
                    open = self.limiter.open(),
                    max = self.limiter.max(),
                    "open handle ceiling reached, dropping overflow"
                );
                self.dropped += data.len() as u64;
                return;
            };
            match OverflowBuffer::open(&self.runtime_dir, self.transport.id(), permit) {
                Ok(overflow) => self.overflow = Some(overflow),
                Err(error) => {
                    error!(handle = %self.id(), bytes = data.len(), %error, "overflow unavailable, dropping");
                    self.dropped += data.len() as u64;
                    return;
                }
            }
        }

        let Some(overflow) = self.overflow.as_mut() else {
            return;
        };
        if let Err(error) = overflow.append(data) {
            // A failed append may leave a partial tail, so the whole backlog goes.
            let lost = overflow.len() + data.len() as u64;
            error!(handle = %self.id(), bytes = lost, %error, "overflow append failed, dropping");
            self.dropped += lost;
            self.overflow = None;
        }
    }
}

impl<T> AfterFork for Stream<T> {
    fn after_fork(&mut self) {
        if let Some(mut overflow) = self.overflow.take() {
            overflow.after_fork();
        }
        self.closed = true;
    }
}
