//! Wakers that re-queue a task by id.
//!
//! Tasks are normally re-entered through explicit events, but any std future awaited
//! inside a task body may still wake it. A woken id lands in the [`ReadyQueue`] and
//! is polled again on the next kernel tick.

use super::core::TaskId;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};

/// FIFO of task ids waiting to be polled.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
}

impl ReadyQueue {
    pub(crate) fn push(&self, task: TaskId) {
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !queue.contains(&task) {
            queue.push_back(task);
        }
    }

    pub(crate) fn pop(&self) -> Option<TaskId> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

struct TaskWaker {
    task: TaskId,
    queue: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.task);
    }
}

/// Creates a waker that pushes `task` onto `queue`.
pub(crate) fn task_waker(task: TaskId, queue: Arc<ReadyQueue>) -> Waker {
    Waker::from(Arc::new(TaskWaker { task, queue }))
}
