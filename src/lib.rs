//! Single-threaded event-driven runtime for long-lived network services.
//!
//! # Architecture
//!
//! - **Kernel**: owns the workers and runs the loop (readiness, timers, events,
//!   heartbeat, task GC); also handles fork and shutdown signals
//! - **Scheduler**: suspendable tasks with per-task event handlers, flags, defers and
//!   timeouts
//! - **Events**: a FIFO queue of typed events routed to subscribed workers
//! - **Stream**: a non-blocking writer that spills to a disk overflow when the socket
//!   is full and drains it on write readiness
//! - **FrameCodec**: 4-byte length-prefixed message framing
//! - **RuntimeBuilder**: fluent construction of a configured kernel

pub mod builder;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod net;
pub mod reactor;
pub mod task;
pub mod worker;

pub use builder::RuntimeBuilder;
pub use codec::{FrameCodec, Handshake, Protocol};
pub use config::RuntimeConfig;
pub use error::{CodecError, Error, Result, TaskError};
pub use event::{Event, EventKind, Origin, Payload};
pub use reactor::{Fork, Kernel, ReactorHandle};
pub use task::{Resumption, Scheduler, Status, TaskContext, TaskHandle, TaskId};
pub use worker::{Connection, NetHooks, NetWorker, Worker};
