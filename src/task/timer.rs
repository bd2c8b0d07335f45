//! Registry-level timers keyed by task id.
//!
//! Timers are kept in a flat list of `(deadline, task, kind)` entries and fired by the
//! kernel on each tick, so a deadline is observed at the first tick after it elapsed.

use super::core::TaskId;

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Delivers a `Timeout` event once.
    Timeout,
    /// Delivers a `Resume` event, used by `sleep`.
    Wake,
}

#[derive(Debug, Default)]
pub(crate) struct TimerList {
    timers: Vec<(Instant, TaskId, TimerKind)>,
}

impl TimerList {
    pub(crate) fn register(&mut self, deadline: Instant, task: TaskId, kind: TimerKind) {
        self.timers.push((deadline, task, kind));
    }

    /// Removes every timer whose deadline is at or before `now` and returns them,
    /// earliest first.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(TaskId, TimerKind)> {
        let mut fired = Vec::new();
        self.timers.retain(|&(deadline, task, kind)| {
            if now >= deadline {
                fired.push((deadline, task, kind));
                false
            } else {
                true
            }
        });

        fired.sort_by_key(|&(deadline, _, _)| deadline);
        fired.into_iter().map(|(_, task, kind)| (task, kind)).collect()
    }

    /// Drops the timers of a task that no longer needs them.
    pub(crate) fn cancel(&mut self, task: TaskId) {
        self.timers.retain(|&(_, owner, _)| owner != task);
    }

    /// Time left until the earliest deadline, if any.
    pub(crate) fn next_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|&(deadline, _, _)| deadline.saturating_duration_since(now))
            .min()
    }

    pub(crate) fn clear(&mut self) {
        self.timers.clear();
    }
}
