//! Process duplication results and child supervision.

use libc::{WNOHANG, c_int, pid_t};
use tracing::{debug, warn};

/// Which side of a successful fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(pid_t),
    Child,
}

/// Children started by this process, for signal relay and reaping.
#[derive(Debug, Default)]
pub struct Supervisor {
    children: Vec<pid_t>,
}

impl Supervisor {
    pub fn adopt(&mut self, pid: pid_t) {
        self.children.push(pid);
    }

    pub fn children(&self) -> &[pid_t] {
        &self.children
    }

    /// Sends `signal` to every child.
    pub fn relay(&self, signal: c_int) {
        for &pid in &self.children {
            if unsafe { libc::kill(pid, signal) } < 0 {
                warn!(pid, signal, error = %std::io::Error::last_os_error(), "signal relay failed");
            }
        }
    }

    /// Collects children that already exited. Returns `(pid, raw status)` pairs.
    pub fn reap(&mut self) -> Vec<(pid_t, c_int)> {
        self.wait(WNOHANG)
    }

    /// Blocks until every child exited.
    pub fn wait_all(&mut self) -> Vec<(pid_t, c_int)> {
        self.wait(0)
    }

    fn wait(&mut self, options: c_int) -> Vec<(pid_t, c_int)> {
        let mut exited = Vec::new();

        self.children.retain(|&pid| {
            let mut status: c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, options) };
            match rc {
                0 => true,
                rc if rc < 0 => {
                    debug!(pid, "child already gone");
                    false
                }
                _ => {
                    exited.push((pid, status));
                    false
                }
            }
        });

        exited
    }

    /// Drops the parent's children list in a forked child.
    pub(crate) fn forget(&mut self) {
        self.children.clear();
    }
}
