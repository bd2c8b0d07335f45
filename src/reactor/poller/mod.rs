//! OS readiness notification.
//!
//! epoll on Linux, kqueue on macOS. Both expose the same level-triggered API keyed by
//! a `usize` token.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) use epoll::EpollPoller as Poller;
#[cfg(target_os = "macos")]
pub(crate) use kqueue::KqueuePoller as Poller;

/// Which readiness a descriptor is registered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

/// Readiness reported for a handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The peer hung up or the descriptor is in error.
    pub hangup: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub(crate) token: usize,
    pub(crate) readiness: Readiness,
}
