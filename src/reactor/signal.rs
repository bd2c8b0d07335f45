//! Shutdown signals.
//!
//! Handlers only record which signal arrived; the kernel checks it once per turn, so
//! shutdown always happens between two ticks and never mid-task.

use signal_hook::SigId;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM, SIGUSR2};
use std::io;
use std::os::raw::c_int;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Signals that trigger an orderly shutdown.
pub const SHUTDOWN_SIGNALS: [c_int; 4] = [SIGINT, SIGTERM, SIGQUIT, SIGUSR2];

#[derive(Default)]
pub(crate) struct Signals {
    pending: Arc<AtomicUsize>,
    installed: Vec<SigId>,
}

impl Signals {
    pub(crate) fn install(&mut self) -> io::Result<()> {
        if !self.installed.is_empty() {
            return Ok(());
        }

        for signal in SHUTDOWN_SIGNALS {
            let id = signal_hook::flag::register_usize(signal, Arc::clone(&self.pending), signal as usize)?;
            self.installed.push(id);
        }
        Ok(())
    }

    /// The last signal received since the previous call.
    pub(crate) fn take(&self) -> Option<c_int> {
        match self.pending.swap(0, Ordering::SeqCst) {
            0 => None,
            signal => Some(signal as c_int),
        }
    }
}

impl Drop for Signals {
    fn drop(&mut self) {
        for id in self.installed.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
