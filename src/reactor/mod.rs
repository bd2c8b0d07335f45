//! Event loop, readiness dispatch and process control.
//!
//! - [`Kernel`]: owns the workers and drives ticks, heartbeats and fork
//! - [`ReactorHandle`]: the shared context every worker and task reaches the runtime
//!   through (scheduler, event queue, subscriptions, readiness watches)
//! - [`Supervisor`]: child process bookkeeping for signal relay
//! - `poller`: epoll / kqueue readiness

mod handle;
mod kernel;
mod poller;
mod process;
mod signal;

pub use handle::ReactorHandle;
pub use kernel::Kernel;
pub use poller::{Interest, Readiness};
pub use process::{Fork, Supervisor};
pub use signal::SHUTDOWN_SIGNALS;

/// A resource that must drop or re-establish inherited state in a forked child.
///
/// Descriptors are never shared across the fork boundary: the child forgets what it
/// inherited (without tearing down what the parent still uses) and re-opens whatever
/// it needs.
pub trait AfterFork {
    fn after_fork(&mut self);
}
