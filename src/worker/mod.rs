//! Named services driven by the kernel.
//!
//! A [`Worker`] subscribes to event kinds, owns I/O handles and reacts to their
//! readiness. [`NetWorker`] composes a [`crate::codec::Protocol`] with backpressure
//! streams to serve a framed protocol; [`BufferWorker`] is the built-in service that
//! drains overflowing streams and streams files into sockets.

mod buffer;
mod net;

pub use buffer::{BUFFER_WORKER, BufferWorker, TransferRequest, send_file};
pub use net::{Connection, NetHooks, NetWorker};

use crate::error::Result;
use crate::event::Event;
use crate::net::HandleId;
use crate::reactor::{ReactorHandle, Readiness};

pub trait Worker {
    /// Unique name, used as the key of subscriptions and readiness watches.
    fn name(&self) -> &str;

    /// Called once when the worker is loaded. Subscriptions are declared here.
    fn init(&mut self, _reactor: &ReactorHandle) -> Result<()> {
        Ok(())
    }

    /// Receives every event of a subscribed kind, in queue order.
    fn handle_event(&mut self, _event: &Event, _reactor: &ReactorHandle) {}

    /// Receives readiness for handles this worker watches.
    fn handle_readiness(&mut self, _id: HandleId, _readiness: Readiness, _reactor: &ReactorHandle) {}

    /// Called once per tick, after the event queue was drained.
    fn heartbeat(&mut self, _reactor: &ReactorHandle) {}

    /// Releases owned handles. Called on unload and on kernel shutdown.
    fn shutdown(&mut self, _reactor: &ReactorHandle) {}

    /// Called in a forked child: drop inherited handles and reconnect what is needed.
    fn after_fork(&mut self, _reactor: &ReactorHandle) {}
}
