use bytes::{Bytes, BytesMut};
use ripple::codec::{FrameCodec, Handshake, Protocol};
use ripple::error::CodecError;
use ripple::reactor::ReactorHandle;
use ripple::worker::{Connection, NetHooks, NetWorker};
use ripple::{Kernel, RuntimeBuilder};

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default, Clone)]
struct Journal {
    messages: Rc<RefCell<Vec<Vec<u8>>>>,
    names: Rc<RefCell<Vec<Option<String>>>>,
    connects: Rc<Cell<usize>>,
    closes: Rc<Cell<usize>>,
}

/// Records every callback and echoes each message back.
struct Echo {
    journal: Journal,
    reply: bool,
}

impl NetHooks for Echo {
    fn on_connect(&mut self, conn: &Connection, _reactor: &ReactorHandle) {
        self.journal.connects.set(self.journal.connects.get() + 1);
        conn.set_name(format!("peer-{}", self.journal.connects.get()));
    }

    fn on_message(&mut self, conn: &Connection, message: Bytes, reactor: &ReactorHandle) {
        self.journal.messages.borrow_mut().push(message.to_vec());
        self.journal.names.borrow_mut().push(conn.name());
        if self.reply {
            conn.send(reactor, &message).unwrap();
        }
    }

    fn on_close(&mut self, _conn: &Connection, _reactor: &ReactorHandle) {
        self.journal.closes.set(self.journal.closes.get() + 1);
    }
}

fn kernel() -> (Kernel, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let kernel = RuntimeBuilder::new()
        .runtime_dir(dir.path().join("run"))
        .heartbeat_interval(Duration::from_millis(10))
        .build()
        .unwrap();
    (kernel, dir)
}

fn serve<P: Protocol + 'static>(
    kernel: &mut Kernel,
    mut worker: NetWorker<P, Echo>,
    address: &str,
) -> String {
    let bound = worker.bind(kernel.reactor(), address).unwrap();
    kernel.push(worker).unwrap();
    bound.to_string()
}

fn unix_address(dir: &TempDir) -> String {
    format!("unix://{}", dir.path().join("echo.sock").display())
}

fn frame(payload: &[u8]) -> Vec<u8> {
    FrameCodec::build(payload).unwrap().to_vec()
}

/// Reads whatever is available and decodes complete frames into `frames`.
/// Returns `true` once the peer closed the connection.
fn pump_client(client: &mut impl Read, codec: &mut FrameCodec, buffer: &mut BytesMut, frames: &mut Vec<Vec<u8>>) -> bool {
    let mut chunk = [0u8; 4096];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    while let Ok(Some(frame)) = codec.decode_next(buffer) {
        frames.push(frame.to_vec());
    }
    false
}

#[test]
fn test_unix_echo_round_trip_with_split_frames() {
    let (mut kernel, dir) = kernel();
    let journal = Journal::default();
    let worker = NetWorker::framed("echo", Echo { journal: journal.clone(), reply: true }, 1024);
    serve(&mut kernel, worker, &unix_address(&dir));

    let mut client = UnixStream::connect(dir.path().join("echo.sock")).unwrap();
    let mut wire = frame(b"ping");
    wire.extend_from_slice(&frame(b""));
    wire.extend_from_slice(&frame(b"pong"));
    client.write_all(&wire[..6]).unwrap();
    client.set_nonblocking(true).unwrap();

    let (mut codec, mut buffer, mut frames) = (FrameCodec::new(), BytesMut::new(), Vec::new());
    let mut turns_since_connect = 0;
    let done = kernel
        .run_until(Duration::from_secs(5), |_| {
            if journal.connects.get() == 1 {
                turns_since_connect += 1;
                if turns_since_connect == 3 {
                    assert!(journal.messages.borrow().is_empty(), "Half a frame is not a message");
                    client.write_all(&wire[6..]).unwrap();
                }
            }
            pump_client(&mut client, &mut codec, &mut buffer, &mut frames);
            frames.len() == 3
        })
        .unwrap();

    assert!(done, "All echoes should come back");
    assert_eq!(frames, vec![b"ping".to_vec(), Vec::new(), b"pong".to_vec()]);
    assert_eq!(*journal.messages.borrow(), frames);
    assert_eq!(journal.connects.get(), 1);
    assert_eq!(journal.names.borrow()[0].as_deref(), Some("peer-1"));
}

#[test]
fn test_burst_larger_than_one_readiness_budget_is_fully_decoded() {
    let (mut kernel, dir) = kernel();
    let journal = Journal::default();
    let mut worker = NetWorker::framed("echo", Echo { journal: journal.clone(), reply: false }, 1024);
    worker.set_read_chunk(16);
    serve(&mut kernel, worker, &unix_address(&dir));

    let expected: Vec<Vec<u8>> = (0..100).map(|i| format!("message-{i:03}").into_bytes()).collect();
    let wire: Vec<u8> = expected.iter().flat_map(|payload| frame(payload)).collect();

    let mut client = UnixStream::connect(dir.path().join("echo.sock")).unwrap();
    client.write_all(&wire).unwrap();

    let done = kernel
        .run_until(Duration::from_secs(5), |_| journal.messages.borrow().len() == expected.len())
        .unwrap();

    assert!(done, "Every frame of the burst should be delivered");
    assert_eq!(*journal.messages.borrow(), expected, "Frames must arrive in order");
    assert_eq!(journal.closes.get(), 0, "A burst is not a reason to close");
}

#[test]
fn test_tcp_listener_reports_assigned_port() {
    let (mut kernel, _dir) = kernel();
    let journal = Journal::default();
    let worker = NetWorker::framed("echo", Echo { journal: journal.clone(), reply: true }, 1024);
    let bound = serve(&mut kernel, worker, "tcp://127.0.0.1:0");

    let port: u16 = bound.rsplit(':').next().unwrap().parse().unwrap();
    assert_ne!(port, 0, "Bound address should carry the real port");

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(&frame(b"over tcp")).unwrap();
    client.set_nonblocking(true).unwrap();

    let (mut codec, mut buffer, mut frames) = (FrameCodec::new(), BytesMut::new(), Vec::new());
    let done = kernel
        .run_until(Duration::from_secs(5), |_| {
            pump_client(&mut client, &mut codec, &mut buffer, &mut frames);
            !frames.is_empty()
        })
        .unwrap();

    assert!(done);
    assert_eq!(frames, vec![b"over tcp".to_vec()]);
}

#[test]
fn test_oversized_frame_closes_the_connection() {
    let (mut kernel, dir) = kernel();
    let journal = Journal::default();
    let worker = NetWorker::framed("echo", Echo { journal: journal.clone(), reply: true }, 16);
    serve(&mut kernel, worker, &unix_address(&dir));

    let mut client = UnixStream::connect(dir.path().join("echo.sock")).unwrap();
    client.write_all(&frame(&[1u8; 32])).unwrap();
    client.set_nonblocking(true).unwrap();

    let (mut codec, mut buffer, mut frames) = (FrameCodec::new(), BytesMut::new(), Vec::new());
    let mut closed = false;
    let done = kernel
        .run_until(Duration::from_secs(5), |_| {
            closed = closed || pump_client(&mut client, &mut codec, &mut buffer, &mut frames);
            closed
        })
        .unwrap();

    assert!(done, "Server should hang up");
    assert!(journal.messages.borrow().is_empty(), "No message may be delivered");
    assert_eq!(journal.closes.get(), 1);
}

#[test]
fn test_truncated_frame_at_eof_is_never_delivered() {
    let (mut kernel, dir) = kernel();
    let journal = Journal::default();
    let worker = NetWorker::framed("echo", Echo { journal: journal.clone(), reply: false }, 1024);
    serve(&mut kernel, worker, &unix_address(&dir));

    let mut client = UnixStream::connect(dir.path().join("echo.sock")).unwrap();
    let mut wire = frame(b"whole");
    wire.extend_from_slice(&frame(b"cut short")[..7]);
    client.write_all(&wire).unwrap();
    drop(client);

    let done = kernel
        .run_until(Duration::from_secs(5), |_| journal.closes.get() == 1)
        .unwrap();

    assert!(done);
    assert_eq!(*journal.messages.borrow(), vec![b"whole".to_vec()]);
}

/// Frames preceded by a `HELLO\n` greeting.
#[derive(Default)]
struct Greeting {
    frames: FrameCodec,
}

impl Protocol for Greeting {
    fn handshake(&mut self, buffer: &mut BytesMut) -> Handshake {
        const HELLO: &[u8] = b"HELLO\n";
        let seen = buffer.len().min(HELLO.len());
        if buffer[..seen] != HELLO[..seen] {
            return Handshake::Rejected;
        }
        if seen < HELLO.len() {
            return Handshake::Pending;
        }
        let _ = buffer.split_to(HELLO.len());
        Handshake::Complete
    }

    fn decode_next(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        self.frames.decode_next(buffer)
    }

    fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        self.frames.encode(payload)
    }

    fn is_mid_frame(&self) -> bool {
        self.frames.is_mid_frame()
    }
}

#[test]
fn test_handshake_gates_messages() {
    let (mut kernel, dir) = kernel();
    let journal = Journal::default();
    let worker: NetWorker<Greeting, Echo> = NetWorker::new("greeter", Echo { journal: journal.clone(), reply: true });
    serve(&mut kernel, worker, &unix_address(&dir));

    let mut client = UnixStream::connect(dir.path().join("echo.sock")).unwrap();
    client.write_all(b"HEL").unwrap();
    client.set_nonblocking(true).unwrap();

    let (mut codec, mut buffer, mut frames) = (FrameCodec::new(), BytesMut::new(), Vec::new());
    let mut stage = 0;
    let done = kernel
        .run_until(Duration::from_secs(5), |_| {
            if stage == 0 && journal.connects.get() == 1 {
                let mut rest = b"LO\n".to_vec();
                rest.extend_from_slice(&frame(b"after hello"));
                client.write_all(&rest).unwrap();
                stage = 1;
            }
            pump_client(&mut client, &mut codec, &mut buffer, &mut frames);
            !frames.is_empty()
        })
        .unwrap();

    assert!(done);
    assert_eq!(frames, vec![b"after hello".to_vec()]);
}

#[test]
fn test_failed_handshake_closes_the_connection() {
    let (mut kernel, dir) = kernel();
    let journal = Journal::default();
    let worker: NetWorker<Greeting, Echo> = NetWorker::new("greeter", Echo { journal: journal.clone(), reply: true });
    serve(&mut kernel, worker, &unix_address(&dir));

    let mut client = UnixStream::connect(dir.path().join("echo.sock")).unwrap();
    let mut wire = b"GOODBYE\n".to_vec();
    wire.extend_from_slice(&frame(b"ignored"));
    client.write_all(&wire).unwrap();

    let done = kernel
        .run_until(Duration::from_secs(5), |_| journal.closes.get() == 1)
        .unwrap();

    assert!(done);
    assert!(journal.messages.borrow().is_empty());
}

#[test]
fn test_outbound_connection_talks_to_a_listener() {
    let (mut kernel, dir) = kernel();
    let server_journal = Journal::default();
    let client_journal = Journal::default();

    let server = NetWorker::framed("server", Echo { journal: server_journal.clone(), reply: true }, 1024);
    let address = serve(&mut kernel, server, &unix_address(&dir));

    let mut client = NetWorker::framed("client", Echo { journal: client_journal.clone(), reply: false }, 1024);
    let conn = client.connect(kernel.reactor(), &address).unwrap();
    conn.send(kernel.reactor(), b"hi there").unwrap();
    kernel.push(client).unwrap();

    let done = kernel
        .run_until(Duration::from_secs(5), |_| !client_journal.messages.borrow().is_empty())
        .unwrap();

    assert!(done);
    assert_eq!(*server_journal.messages.borrow(), vec![b"hi there".to_vec()]);
    assert_eq!(*client_journal.messages.borrow(), vec![b"hi there".to_vec()]);
    assert_eq!(client_journal.connects.get(), 1);
}

#[test]
fn test_unload_closes_connections() {
    let (mut kernel, dir) = kernel();
    let journal = Journal::default();
    let worker = NetWorker::framed("echo", Echo { journal: journal.clone(), reply: true }, 1024);
    serve(&mut kernel, worker, &unix_address(&dir));

    let mut client = UnixStream::connect(dir.path().join("echo.sock")).unwrap();
    client.set_nonblocking(true).unwrap();
    let done = kernel
        .run_until(Duration::from_secs(5), |_| journal.connects.get() == 1)
        .unwrap();
    assert!(done);

    kernel.unload("echo").unwrap();
    assert_eq!(journal.closes.get(), 1);
    assert!(!dir.path().join("echo.sock").exists(), "Listener path should be removed");

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0, "Client should see end of stream");
}
