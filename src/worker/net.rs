//! Framed network service.
//!
//! A [`NetWorker`] owns listeners and connections. Read readiness on a listener
//! accepts every pending peer; read readiness on a connection reads a bounded number
//! of chunks, decoding after each one: the protocol handshake runs once, then each
//! decoded message goes to the [`NetHooks`]. Writes go through the backpressure
//! stream of the connection.

use super::Worker;
use crate::codec::{FrameCodec, Handshake, Protocol};
use crate::config::RuntimeConfig;
use crate::error::{CodecError, Result};
use crate::net::{self, HandleId, IoHandle, Listener, Peer, SharedStream, SocketAddress};
use crate::reactor::{AfterFork, ReactorHandle, Readiness};

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Reads served per readiness notification before yielding to other handles.
const MAX_READS_PER_EVENT: usize = 16;

type Encoder = Rc<dyn Fn(&[u8]) -> std::result::Result<Bytes, CodecError>>;

/// Application callbacks of a [`NetWorker`].
pub trait NetHooks {
    fn on_connect(&mut self, _conn: &Connection, _reactor: &ReactorHandle) {}

    /// Called once the protocol handshake completed.
    fn on_handshake(&mut self, _conn: &Connection, _reactor: &ReactorHandle) {}

    fn on_message(&mut self, conn: &Connection, message: Bytes, reactor: &ReactorHandle);

    fn on_close(&mut self, _conn: &Connection, _reactor: &ReactorHandle) {}
}

/// A live connection. Cheap to clone; every clone writes through the same stream.
#[derive(Clone)]
pub struct Connection {
    id: HandleId,
    stream: SharedStream,
    peer: Peer,
    encoder: Encoder,
}

impl Connection {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The connection's stream. Writes that may buffer belong in [`Connection::send`]
    /// or [`ReactorHandle::write`]; writing on the stream directly leaves any overflow
    /// undrained until the caller drains it.
    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    pub fn name(&self) -> Option<String> {
        self.stream.borrow().transport().name().map(str::to_string)
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.stream.borrow_mut().transport_mut().set_name(name);
    }

    /// Encodes `payload` with the connection's protocol and writes it.
    pub fn send(&self, reactor: &ReactorHandle, payload: &[u8]) -> io::Result<usize> {
        let encoded = (self.encoder)(payload)?;
        reactor.write(&self.stream, &encoded)
    }

    /// Writes `bytes` as they are, without framing.
    pub fn send_raw(&self, reactor: &ReactorHandle, bytes: &[u8]) -> io::Result<usize> {
        reactor.write(&self.stream, bytes)
    }

    /// Marks the connection for closing. The worker releases it after the current
    /// message.
    pub fn close(&self) {
        self.stream.borrow_mut().close();
    }

    pub fn is_closed(&self) -> bool {
        self.stream.borrow().is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

struct Session<P> {
    conn: Connection,
    recv: BytesMut,
    protocol: P,
    handshaken: bool,
}

pub struct NetWorker<P, H> {
    name: String,
    hooks: H,
    factory: Box<dyn Fn() -> P>,
    listeners: HashMap<HandleId, Listener>,
    sessions: HashMap<HandleId, Session<P>>,
    scratch: Vec<u8>,
}

impl<H: NetHooks> NetWorker<FrameCodec, H> {
    /// A worker speaking length-prefixed frames of at most `max_frame_length` bytes.
    pub fn framed(name: impl Into<String>, hooks: H, max_frame_length: usize) -> Self {
        Self::with_protocol(name, hooks, move || FrameCodec::with_max_frame_length(max_frame_length))
    }

    /// A framed worker sized from `config`.
    pub fn from_config(name: impl Into<String>, hooks: H, config: &RuntimeConfig) -> Self {
        let mut worker = Self::framed(name, hooks, config.max_frame_length);
        worker.set_read_chunk(config.read_chunk_size);
        worker
    }
}

impl<P: Protocol + Default + 'static, H: NetHooks> NetWorker<P, H> {
    pub fn new(name: impl Into<String>, hooks: H) -> Self {
        Self::with_protocol(name, hooks, P::default)
    }
}

impl<P: Protocol + 'static, H: NetHooks> NetWorker<P, H> {
    /// Every connection gets its own protocol instance from `factory`.
    pub fn with_protocol(name: impl Into<String>, hooks: H, factory: impl Fn() -> P + 'static) -> Self {
        Self {
            name: name.into(),
            hooks,
            factory: Box::new(factory),
            listeners: HashMap::new(),
            sessions: HashMap::new(),
            scratch: vec![0; 64 * 1024],
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Size of the buffer used per read call.
    pub fn set_read_chunk(&mut self, size: usize) {
        self.scratch.resize(size.max(1), 0);
    }

    /// Listens on `address` (`unix://path` or `tcp://host:port`) and returns the
    /// bound address.
    pub fn bind(&mut self, reactor: &ReactorHandle, address: &str) -> Result<SocketAddress> {
        let address = SocketAddress::parse(address)?;
        let mut listener = Listener::bind(&address)?;
        listener.hold(reactor.limiter().register());
        reactor.watch_readable(listener.id(), listener.as_raw_fd(), &self.name)?;

        let local = listener.local_address();
        info!(worker = %self.name, address = %local, "listener ready");
        self.listeners.insert(listener.id(), listener);
        Ok(local)
    }

    /// Connects to `address` and serves the connection like an accepted one.
    pub fn connect(&mut self, reactor: &ReactorHandle, address: &str) -> Result<Connection> {
        let address = SocketAddress::parse(address)?;
        let handle = net::connect(&address)?;
        Ok(self.adopt(handle, reactor)?)
    }

    pub fn connection(&self, id: HandleId) -> Option<Connection> {
        self.sessions.get(&id).map(|session| session.conn.clone())
    }

    pub fn connection_by_name(&self, name: &str) -> Option<Connection> {
        self.sessions
            .values()
            .find(|session| session.conn.name().as_deref() == Some(name))
            .map(|session| session.conn.clone())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.sessions.values().map(|session| session.conn.clone()).collect()
    }

    pub fn listener_addresses(&self) -> Vec<SocketAddress> {
        self.listeners.values().map(Listener::local_address).collect()
    }

    fn adopt(&mut self, handle: IoHandle, reactor: &ReactorHandle) -> io::Result<Connection> {
        let id = handle.id();
        let fd = handle.as_raw_fd();
        let peer = handle.peer().clone();
        let stream = reactor.stream(handle);
        reactor.watch_readable(id, fd, &self.name)?;

        let encoding = (self.factory)();
        let conn = Connection {
            id,
            stream,
            peer,
            encoder: Rc::new(move |payload: &[u8]| encoding.encode(payload)),
        };

        self.sessions.insert(
            id,
            Session {
                conn: conn.clone(),
                recv: BytesMut::new(),
                protocol: (self.factory)(),
                handshaken: false,
            },
        );
        debug!(worker = %self.name, handle = %id, peer = %conn.peer.address, "connection opened");

        self.hooks.on_connect(&conn, reactor);
        Ok(conn)
    }

    fn accept(&mut self, id: HandleId, reactor: &ReactorHandle) {
        loop {
            let accepted = match self.listeners.get(&id) {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok(handle) => {
                    if let Err(error) = self.adopt(handle, reactor) {
                        warn!(worker = %self.name, %error, "cannot serve accepted connection");
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    warn!(worker = %self.name, %error, "accept failed");
                    break;
                }
            }
        }
    }

    /// Reads one chunk at a time and decodes after each, so buffered input stays
    /// bounded by one chunk plus a partial frame. Readiness is level triggered, so a
    /// socket still holding data after [`MAX_READS_PER_EVENT`] reads is reported again.
    fn read(&mut self, id: HandleId, reactor: &ReactorHandle) {
        for _ in 0..MAX_READS_PER_EVENT {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };

            let result = session.conn.stream.borrow().transport().read(&mut self.scratch);
            match result {
                Ok(0) => return self.close(id, reactor),
                Ok(n) => {
                    session.recv.extend_from_slice(&self.scratch[..n]);
                    if !self.process(id, reactor) {
                        return self.close(id, reactor);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    debug!(handle = %id, %error, "read failed");
                    return self.close(id, reactor);
                }
            }
        }
        trace!(handle = %id, "read budget spent, waiting for the next readiness");
    }

    /// Runs the handshake gate and the decode loop. Returns `false` when the
    /// connection must be closed.
    fn process(&mut self, id: HandleId, reactor: &ReactorHandle) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };

        if !session.handshaken {
            match session.protocol.handshake(&mut session.recv) {
                Handshake::Complete => {
                    session.handshaken = true;
                    self.hooks.on_handshake(&session.conn, reactor);
                }
                Handshake::Pending => return true,
                Handshake::Rejected => {
                    debug!(handle = %id, "handshake rejected");
                    return false;
                }
            }
        }

        loop {
            if session.conn.is_closed() {
                return false;
            }

            match session.protocol.decode_next(&mut session.recv) {
                Ok(Some(message)) => {
                    trace!(handle = %id, len = message.len(), "message");
                    self.hooks.on_message(&session.conn, message, reactor);
                }
                Ok(None) => return true,
                Err(error) => {
                    warn!(handle = %id, %error, "undecodable input, closing");
                    return false;
                }
            }
        }
    }

    /// Closes connection `id`: readiness is cancelled, hooks are told, overflow is
    /// discarded.
    pub fn close(&mut self, id: HandleId, reactor: &ReactorHandle) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };

        if let Err(error) = reactor.unwatch(id) {
            trace!(handle = %id, %error, "unwatch failed");
        }
        if session.protocol.is_mid_frame() || !session.recv.is_empty() {
            debug!(handle = %id, pending = session.recv.len(), "partial message discarded");
        }

        self.hooks.on_close(&session.conn, reactor);
        session.conn.stream.borrow_mut().close();
        debug!(worker = %self.name, handle = %id, "connection closed");
    }
}

impl<P: Protocol + 'static, H: NetHooks> Worker for NetWorker<P, H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_readiness(&mut self, id: HandleId, readiness: Readiness, reactor: &ReactorHandle) {
        if self.listeners.contains_key(&id) {
            self.accept(id, reactor);
        } else if readiness.readable {
            self.read(id, reactor);
        }
    }

    fn shutdown(&mut self, reactor: &ReactorHandle) {
        let ids: Vec<HandleId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close(id, reactor);
        }

        for id in self.listeners.keys() {
            if let Err(error) = reactor.unwatch(*id) {
                trace!(listener = %id, %error, "unwatch failed");
            }
        }
        self.listeners.clear();
    }

    fn after_fork(&mut self, _reactor: &ReactorHandle) {
        for session in self.sessions.values() {
            session.conn.stream.borrow_mut().after_fork();
        }
        self.sessions.clear();

        for listener in self.listeners.values_mut() {
            listener.after_fork();
        }
        self.listeners.clear();
    }
}
