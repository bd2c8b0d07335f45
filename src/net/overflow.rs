//! File-backed spill area for writes a socket could not absorb.
//!
//! Each [`OverflowBuffer`] is a FIFO over one file in the runtime directory: bytes are
//! appended at the tail and drained from a read cursor at the head. The file is
//! deleted when the buffer is closed or dropped. Opening a buffer takes a permit from
//! the [`HandleLimiter`], the runtime-wide count of open descriptors.

use crate::net::HandleId;
use crate::reactor::AfterFork;

use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Counts every descriptor the runtime holds open against one ceiling.
///
/// Sockets, listeners and transfer files are counted with [`HandleLimiter::register`]
/// and always succeed, since they are already open. Overflow files are optional and
/// only opened through [`HandleLimiter::try_acquire`] while below the ceiling.
#[derive(Debug, Clone)]
pub struct HandleLimiter {
    open: Rc<Cell<usize>>,
    max: usize,
}

impl HandleLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            open: Rc::new(Cell::new(0)),
            max,
        }
    }

    /// Takes a permit, or `None` if the ceiling is reached.
    pub fn try_acquire(&self) -> Option<HandlePermit> {
        let open = self.open.get();
        if open >= self.max {
            return None;
        }
        self.open.set(open + 1);
        Some(HandlePermit {
            open: self.open.clone(),
        })
    }

    /// Counts a descriptor that is already open, even past the ceiling.
    pub fn register(&self) -> HandlePermit {
        self.open.set(self.open.get() + 1);
        HandlePermit {
            open: self.open.clone(),
        }
    }

    pub fn open(&self) -> usize {
        self.open.get()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Releases its slot on drop.
#[derive(Debug)]
pub struct HandlePermit {
    open: Rc<Cell<usize>>,
}

impl Drop for HandlePermit {
    fn drop(&mut self) {
        self.open.set(self.open.get().saturating_sub(1));
    }
}

#[derive(Debug)]
pub struct OverflowBuffer {
    path: PathBuf,
    file: File,
    length: u64,
    cursor: u64,
    owned: bool,
    _permit: HandlePermit,
}

impl OverflowBuffer {
    /// Creates `socket_buffer_{pid}_{handle}.socket` under `dir`, truncating any
    /// stale file with the same name.
    pub fn open(dir: &Path, handle: HandleId, permit: HandlePermit) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("socket_buffer_{}_{}.socket", std::process::id(), handle));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        debug!(handle = %handle, path = %path.display(), "overflow buffer opened");
        Ok(Self {
            path,
            file,
            length: 0,
            cursor: 0,
            owned: true,
            _permit: permit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended but not yet consumed.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.length += data.len() as u64;
        Ok(())
    }

    /// Reads up to `max` bytes from the head without consuming them.
    pub fn peek(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let want = (max as u64).min(self.length) as usize;
        let mut chunk = vec![0; want];
        self.file.seek(SeekFrom::Start(self.cursor))?;
        self.file.read_exact(&mut chunk)?;
        Ok(chunk)
    }

    /// Advances the head by `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let n = (n as u64).min(self.length);
        self.cursor += n;
        self.length -= n;
    }

    /// Deletes the backing file.
    pub fn close(mut self) -> io::Result<()> {
        self.owned = false;
        fs::remove_file(&self.path)
    }
}

impl Drop for OverflowBuffer {
    fn drop(&mut self) {
        if self.owned {
            if let Err(error) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), %error, "overflow file not removed");
            }
        }
    }
}

impl AfterFork for OverflowBuffer {
    /// The file belongs to the parent process; the child only forgets it.
    fn after_fork(&mut self) {
        self.owned = false;
        self.length = 0;
        self.cursor = 0;
    }
}
