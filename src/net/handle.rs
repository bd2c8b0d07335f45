//! Non-blocking descriptor wrapper.
//!
//! An [`IoHandle`] owns one descriptor (socket or file) and exposes raw reads and
//! writes plus the socket metadata the runtime cares about: peer address, buffer
//! sizes and low-water marks.

use libc::{
    F_GETFL, F_SETFL, O_NONBLOCK, SO_RCVBUF, SO_RCVLOWAT, SO_SNDBUF, SO_SNDLOWAT, SOL_SOCKET,
    c_int, c_void, fcntl, socklen_t,
};
use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Fallback chunk size for descriptors that are not sockets.
const DEFAULT_SEND_BUFFER: usize = 64 * 1024;

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = 0;

/// Stable identity of a handle, used as the key of readiness subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Allocates a fresh id. Custom [`Transport`] implementations use it too.
    pub fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Poller token for this handle.
    pub(crate) fn token(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_token(token: usize) -> Self {
        Self(token as u64)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unix,
    Inet,
    Inet6,
    /// Not a socket.
    File,
}

/// Remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub family: Family,
    pub address: String,
    pub port: u16,
}

pub struct IoHandle {
    id: HandleId,
    fd: OwnedFd,
    peer: Peer,
    name: Option<String>,
    created: SystemTime,
    send_buffer: Cell<Option<usize>>,
}

impl IoHandle {
    /// Wraps a descriptor with unknown peer metadata.
    pub fn from_fd(fd: OwnedFd, family: Family) -> Self {
        Self::with_peer(
            fd,
            Peer {
                family,
                address: String::new(),
                port: 0,
            },
        )
    }

    fn with_peer(fd: OwnedFd, peer: Peer) -> Self {
        Self {
            id: HandleId::next(),
            fd,
            peer,
            name: None,
            created: SystemTime::now(),
            send_buffer: Cell::new(None),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let peer = match stream.peer_addr() {
            Ok(addr) => Peer {
                family: if addr.is_ipv6() { Family::Inet6 } else { Family::Inet },
                address: addr.ip().to_string(),
                port: addr.port(),
            },
            Err(_) => Peer {
                family: Family::Inet,
                address: String::new(),
                port: 0,
            },
        };

        let handle = Self::with_peer(stream.into(), peer);
        handle.set_nonblocking(true)?;
        Ok(handle)
    }

    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        let address = stream
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|path| path.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let handle = Self::with_peer(
            stream.into(),
            Peer {
                family: Family::Unix,
                address,
                port: 0,
            },
        );
        handle.set_nonblocking(true)?;
        Ok(handle)
    }

    /// Wraps an open file. Files are left blocking.
    pub fn from_file(file: File) -> Self {
        Self::from_fd(file.into(), Family::File)
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn is_socket(&self) -> bool {
        self.peer.family != Family::File
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.fd.as_raw_fd();
        let flags = unsafe { fcntl(fd, F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }

        let flags = if nonblocking { flags | O_NONBLOCK } else { flags & !O_NONBLOCK };
        if unsafe { fcntl(fd, F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Reads into `buf`. `Ok(0)` means end of stream.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Writes from `buf` without raising `SIGPIPE` on a closed socket.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.fd.as_raw_fd();
        let n = if self.is_socket() {
            unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) }
        } else {
            unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) }
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn send_buffer_size(&self) -> io::Result<usize> {
        if let Some(size) = self.send_buffer.get() {
            return Ok(size);
        }
        let size = self.get_option(SO_SNDBUF)?;
        self.send_buffer.set(Some(size));
        Ok(size)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.send_buffer.set(None);
        self.set_option(SO_SNDBUF, size)
    }

    pub fn receive_buffer_size(&self) -> io::Result<usize> {
        self.get_option(SO_RCVBUF)
    }

    pub fn set_receive_buffer_size(&self, size: usize) -> io::Result<()> {
        self.set_option(SO_RCVBUF, size)
    }

    pub fn send_low_water(&self) -> io::Result<usize> {
        self.get_option(SO_SNDLOWAT)
    }

    /// Not supported by every platform; Linux reports `ENOPROTOOPT`.
    pub fn set_send_low_water(&self, bytes: usize) -> io::Result<()> {
        self.set_option(SO_SNDLOWAT, bytes)
    }

    pub fn receive_low_water(&self) -> io::Result<usize> {
        self.get_option(SO_RCVLOWAT)
    }

    pub fn set_receive_low_water(&self, bytes: usize) -> io::Result<()> {
        self.set_option(SO_RCVLOWAT, bytes)
    }

    fn get_option(&self, name: c_int) -> io::Result<usize> {
        let mut value: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                SOL_SOCKET,
                name,
                &mut value as *mut c_int as *mut c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value.max(0) as usize)
    }

    fn set_option(&self, name: c_int, value: usize) -> io::Result<()> {
        let value = c_int::try_from(value)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "socket option out of range"))?;
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_SOCKET,
                name,
                &value as *const c_int as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for IoHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandle")
            .field("id", &self.id)
            .field("fd", &self.fd.as_raw_fd())
            .field("peer", &self.peer)
            .field("name", &self.name)
            .finish()
    }
}

/// The write side a [`crate::net::Stream`] drives.
pub trait Transport {
    fn id(&self) -> HandleId;

    /// Writes as much of `buf` as the kernel accepts right now. A full buffer is
    /// `Ok(0)`, not an error.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Chunk size used when writing and draining, normally the send-buffer size.
    fn chunk_size(&self) -> usize;
}

impl Transport for IoHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn chunk_size(&self) -> usize {
        self.send_buffer_size()
            .ok()
            .filter(|&size| size > 0)
            .unwrap_or(DEFAULT_SEND_BUFFER)
    }
}
