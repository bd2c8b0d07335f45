//! Error types shared across the runtime.
//!
//! Core-level failures are reported through [`Error`]. Causes that reject a task are
//! carried by [`TaskError`], which is cheap to clone because the same cause is handed
//! to the task's handlers, its defers and every awaiting task.

use crate::task::TaskId;

use std::io;
use thiserror::Error;

/// Errors surfaced by the kernel, the reactor and the I/O layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("process duplication failed: {0}")]
    Fork(io::Error),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("worker `{0}` is already loaded")]
    DuplicateWorker(String),

    #[error("unknown worker `{0}`")]
    UnknownWorker(String),

    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The cause attached to a rejected task, or injected into a suspended one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task timed out")]
    Timeout,

    #[error("task cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("scheduler is gone")]
    SchedulerGone,
}

impl TaskError {
    /// Builds a plain failure from any message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Returns `true` for causes that are reported as `Timeout` events rather than
    /// `Exception` events.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<io::Error> for TaskError {
    fn from(error: io::Error) -> Self {
        Self::Failed(error.to_string())
    }
}

impl From<Error> for TaskError {
    fn from(error: Error) -> Self {
        Self::Failed(error.to_string())
    }
}

/// Framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

impl From<CodecError> for io::Error {
    fn from(error: CodecError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}
