//! Built-in buffer service.
//!
//! Streams announce an overflow with a `Buffered` event. This worker then watches the
//! stream for write readiness and drains it on every writable notification and every
//! heartbeat. Once the overflow is empty it stops watching and publishes
//! `Unbuffered`.
//!
//! It also serves `TransferFile` requests: a file is copied into a stream chunk by
//! chunk, pausing whenever the stream starts buffering and continuing on
//! `Unbuffered`. The requesting task is resumed with the number of bytes sent.

use super::Worker;
use crate::error::{Result, TaskError};
use crate::event::{Event, EventKind, Origin, Payload};
use crate::net::{Drain, HandleId, HandlePermit, SharedStream, Transport};
use crate::reactor::{AfterFork, ReactorHandle, Readiness};
use crate::task::{Resumption, TaskContext, TaskId};

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use tracing::{debug, trace, warn};

pub const BUFFER_WORKER: &str = "ripple.buffer";

/// Payload of a `TransferFile` event.
#[derive(Clone)]
pub struct TransferRequest {
    pub path: PathBuf,
    pub stream: SharedStream,
    /// Task resumed with `Result<u64, TaskError>` once the transfer ends.
    pub task: Option<TaskId>,
}

struct Transfer {
    file: File,
    stream: SharedStream,
    task: Option<TaskId>,
    sent: u64,
    _permit: HandlePermit,
}

#[derive(Default)]
pub struct BufferWorker {
    streams: HashMap<HandleId, SharedStream>,
    transfers: HashMap<HandleId, Transfer>,
}

impl BufferWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams currently being drained.
    pub fn tracked(&self) -> usize {
        self.streams.len()
    }

    fn track(&mut self, stream: &SharedStream, reactor: &ReactorHandle) {
        let id = stream.borrow().id();
        let fd = ReactorHandle::stream_fd(stream);

        if let Err(error) = reactor.watch_writable(id, fd, BUFFER_WORKER) {
            warn!(handle = %id, %error, "cannot watch buffered stream");
            return;
        }
        self.streams.insert(id, stream.clone());
        trace!(handle = %id, "tracking buffered stream");
    }

    fn untrack(&mut self, id: HandleId, reactor: &ReactorHandle) {
        self.streams.remove(&id);
        if let Err(error) = reactor.unwatch_writable(id) {
            trace!(handle = %id, %error, "unwatch failed");
        }
    }

    fn drain(&mut self, id: HandleId, reactor: &ReactorHandle) {
        let Some(stream) = self.streams.get(&id).cloned() else {
            return;
        };

        if stream.borrow().is_closed() {
            self.untrack(id, reactor);
            self.finish(id, Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")), reactor);
            return;
        }

        let drained = stream.borrow_mut().drain();
        match drained {
            Ok(Drain::Pending) => trace!(handle = %id, left = stream.borrow().buffered_len(), "drain pending"),
            Ok(Drain::Complete) => {
                self.untrack(id, reactor);
                reactor.publish(Event::new(EventKind::Unbuffered, Payload::new(id), Origin::Handle(id)));
                debug!(handle = %id, "stream unbuffered");
            }
            Err(error) => {
                warn!(handle = %id, %error, "drain failed, closing stream");
                stream.borrow_mut().close();
                self.untrack(id, reactor);
                self.finish(id, Err(error), reactor);
            }
        }
    }

    fn start_transfer(&mut self, request: &TransferRequest, reactor: &ReactorHandle) {
        let id = request.stream.borrow().id();
        if self.transfers.contains_key(&id) {
            let busy = io::Error::new(io::ErrorKind::ResourceBusy, "a transfer is already running on this stream");
            resume_requester(request.task, Err(busy), reactor);
            return;
        }

        match File::open(&request.path) {
            Ok(file) => {
                debug!(handle = %id, path = %request.path.display(), "file transfer started");
                self.transfers.insert(
                    id,
                    Transfer {
                        file,
                        stream: request.stream.clone(),
                        task: request.task,
                        sent: 0,
                        _permit: reactor.limiter().register(),
                    },
                );
                self.pump(id, reactor);
            }
            Err(error) => resume_requester(request.task, Err(error), reactor),
        }
    }

    /// Copies file bytes into the stream until it buffers or the file ends.
    fn pump(&mut self, id: HandleId, reactor: &ReactorHandle) {
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };

        let chunk = transfer.stream.borrow().transport().chunk_size().max(1);
        let mut buffer = vec![0u8; chunk];

        let result = loop {
            if transfer.stream.borrow().is_buffering() {
                break Ok(false);
            }

            match transfer.file.read(&mut buffer) {
                Ok(0) => break Ok(true),
                Ok(n) => match reactor.write(&transfer.stream, &buffer[..n]) {
                    Ok(_) => transfer.sent += n as u64,
                    Err(error) => break Err(error),
                },
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => break Err(error),
            }
        };

        match result {
            Ok(false) => trace!(handle = %id, "transfer paused"),
            Ok(true) => {
                let sent = transfer.sent;
                self.finish(id, Ok(sent), reactor);
            }
            Err(error) => self.finish(id, Err(error), reactor),
        }
    }

    fn finish(&mut self, id: HandleId, result: io::Result<u64>, reactor: &ReactorHandle) {
        let Some(transfer) = self.transfers.remove(&id) else {
            return;
        };

        debug!(handle = %id, sent = transfer.sent, ok = result.is_ok(), "file transfer finished");
        resume_requester(transfer.task, result, reactor);
    }
}

fn resume_requester(task: Option<TaskId>, result: io::Result<u64>, reactor: &ReactorHandle) {
    let Some(task) = task else {
        return;
    };

    let outcome: std::result::Result<u64, TaskError> = result.map_err(TaskError::from);
    let event = Event::resume(Payload::new(outcome), Origin::Worker(BUFFER_WORKER.to_string()));
    if let Err(error) = reactor.scheduler().resume(task, event) {
        warn!(task = %task, %error, "transfer requester is gone");
    }
}

impl Worker for BufferWorker {
    fn name(&self) -> &str {
        BUFFER_WORKER
    }

    fn init(&mut self, reactor: &ReactorHandle) -> Result<()> {
        reactor.subscribe(BUFFER_WORKER, EventKind::Buffered);
        reactor.subscribe(BUFFER_WORKER, EventKind::Unbuffered);
        reactor.subscribe(BUFFER_WORKER, EventKind::TransferFile);
        Ok(())
    }

    fn handle_event(&mut self, event: &Event, reactor: &ReactorHandle) {
        match event.kind {
            EventKind::Buffered => match event.payload.downcast_ref::<SharedStream>() {
                Some(stream) => self.track(stream, reactor),
                None => warn!("buffered event without a stream"),
            },
            EventKind::Unbuffered => {
                if let Some(id) = event.payload.downcast_ref::<HandleId>() {
                    self.pump(*id, reactor);
                }
            }
            EventKind::TransferFile => match event.payload.downcast_ref::<TransferRequest>() {
                Some(request) => self.start_transfer(request, reactor),
                None => warn!("transfer event without a request"),
            },
            _ => {}
        }
    }

    fn handle_readiness(&mut self, id: HandleId, readiness: Readiness, reactor: &ReactorHandle) {
        if readiness.writable {
            self.drain(id, reactor);
        }
    }

    fn heartbeat(&mut self, reactor: &ReactorHandle) {
        let ids: Vec<HandleId> = self.streams.keys().copied().collect();
        for id in ids {
            self.drain(id, reactor);
        }
    }

    fn shutdown(&mut self, reactor: &ReactorHandle) {
        let ids: Vec<HandleId> = self.streams.keys().copied().collect();
        for id in ids {
            self.untrack(id, reactor);
        }

        let pending: Vec<HandleId> = self.transfers.keys().copied().collect();
        for id in pending {
            self.finish(id, Err(io::Error::new(io::ErrorKind::Interrupted, "runtime shutting down")), reactor);
        }
    }

    fn after_fork(&mut self, _reactor: &ReactorHandle) {
        for stream in self.streams.values() {
            stream.borrow_mut().after_fork();
        }
        self.streams.clear();
        self.transfers.clear();
    }
}

/// Streams the file at `path` into `stream` from inside a task and waits for the
/// transfer to end. Returns the number of bytes handed to the stream.
pub async fn send_file(
    ctx: &TaskContext,
    stream: &SharedStream,
    path: impl Into<PathBuf>,
) -> std::result::Result<u64, TaskError> {
    ctx.publish(
        EventKind::TransferFile,
        Payload::new(TransferRequest {
            path: path.into(),
            stream: stream.clone(),
            task: Some(ctx.id()),
        }),
    );

    ctx.flag(EventKind::Resume);
    let result = loop {
        match ctx.suspend().await {
            Ok(Resumption::Value(payload)) => {
                if let Some(outcome) = payload.downcast_ref::<std::result::Result<u64, TaskError>>() {
                    break outcome.clone();
                }
            }
            Ok(Resumption::Drained) => {}
            Err(cause) => break Err(cause),
        }
    };
    ctx.erase(EventKind::Resume, false);

    result
}
