//! Cooperative tasks and the registry that owns them.
//!
//! - [`Scheduler`]: sole owner of every live task; spawns, resumes, expires timeouts
//!   and collects terminated tasks
//! - [`TaskContext`]: the handle a task body uses to suspend, await and register
//!   handlers on itself
//! - [`TaskHandle`]: what callers keep to observe a task's outcome
//!
//! A task is an ordinary future. It only yields at [`TaskContext::suspend`] (or a
//! helper built on it) and is re-entered when the scheduler delivers it an event.

mod context;
mod core;
mod scheduler;
mod timer;
mod waker;

pub use context::{Resumption, Suspend, TaskContext};
pub use self::core::{Outcome, Status, TaskHandle, TaskId};
pub use scheduler::{Scheduler, Step};
