//! Listening sockets.

use super::address::{Scheme, SocketAddress};
use super::handle::{HandleId, IoHandle};
use super::overflow::HandlePermit;
use crate::reactor::AfterFork;

use std::fs;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use tracing::{debug, warn};

enum Socket {
    Tcp(TcpListener),
    Unix { inner: UnixListener, path: PathBuf },
}

/// A non-blocking listener. A Unix listener removes its socket path when dropped.
pub struct Listener {
    id: HandleId,
    address: SocketAddress,
    socket: Socket,
    owns_path: bool,
    permit: Option<HandlePermit>,
}

impl Listener {
    /// Binds `address`. A stale Unix socket file at the same path is removed first.
    pub fn bind(address: &SocketAddress) -> io::Result<Self> {
        let socket = match address.scheme() {
            Scheme::Tcp => {
                let inner = TcpListener::bind((address.host(), address.port()))?;
                inner.set_nonblocking(true)?;
                Socket::Tcp(inner)
            }
            Scheme::Unix => {
                let path = PathBuf::from(address.host());
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let inner = UnixListener::bind(&path)?;
                inner.set_nonblocking(true)?;
                Socket::Unix { inner, path }
            }
        };

        let listener = Self {
            id: HandleId::next(),
            address: address.clone(),
            socket,
            owns_path: true,
            permit: None,
        };
        debug!(listener = %listener.id, address = %listener.local_address(), "listening");
        Ok(listener)
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Keeps `permit` until the listener closes, so the socket counts against the
    /// open-handle ceiling.
    pub fn hold(&mut self, permit: HandlePermit) {
        self.permit = Some(permit);
    }

    /// The bound address. For TCP the port is the one the OS assigned.
    pub fn local_address(&self) -> SocketAddress {
        match &self.socket {
            Socket::Tcp(inner) => match inner.local_addr() {
                Ok(addr) => SocketAddress::tcp(addr.ip().to_string(), addr.port()),
                Err(_) => self.address.clone(),
            },
            Socket::Unix { path, .. } => SocketAddress::unix(path.clone()),
        }
    }

    /// Accepts one pending connection. `WouldBlock` means none is waiting.
    pub fn accept(&self) -> io::Result<IoHandle> {
        match &self.socket {
            Socket::Tcp(inner) => {
                let (stream, _) = inner.accept()?;
                IoHandle::from_tcp(stream)
            }
            Socket::Unix { inner, .. } => {
                let (stream, _) = inner.accept()?;
                IoHandle::from_unix(stream)
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match &self.socket {
            Socket::Tcp(inner) => inner.as_raw_fd(),
            Socket::Unix { inner, .. } => inner.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Socket::Unix { path, .. } = &self.socket {
            if self.owns_path {
                if let Err(error) = fs::remove_file(path) {
                    warn!(path = %path.display(), %error, "socket path not removed");
                }
            }
        }
    }
}

impl AfterFork for Listener {
    /// The socket path stays with the parent.
    fn after_fork(&mut self) {
        self.owns_path = false;
    }
}

/// Opens a blocking connection to `address` and returns it as a non-blocking handle.
pub fn connect(address: &SocketAddress) -> io::Result<IoHandle> {
    match address.scheme() {
        Scheme::Tcp => IoHandle::from_tcp(TcpStream::connect((address.host(), address.port()))?),
        Scheme::Unix => IoHandle::from_unix(UnixStream::connect(address.host())?),
    }
}
