//! Task state.
//!
//! A task pairs a boxed future with the bookkeeping the suspend protocol needs: the
//! handler table, the pending-flag multiset, defers, `then` callbacks and the
//! mailbox the scheduler fills when it resumes the task.

use super::context::TaskContext;
use crate::error::TaskError;
use crate::event::{Event, EventKind, Payload};

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Final value of a task: the fulfilled value or the rejection cause.
pub type Outcome = Result<Payload, TaskError>;

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Outcome>>>;
pub(crate) type Handler = Rc<dyn Fn(&Event, &TaskContext) -> Result<(), TaskError>>;
pub(crate) type Defer = Box<dyn FnOnce(&Outcome)>;
pub(crate) type Then = Box<dyn FnOnce(&Payload)>;

/// What the scheduler delivers to a suspended task.
pub(crate) enum Mail {
    Event(Event),
    Throw(TaskError),
}

/// Multiset of outstanding obligations, keyed by event kind.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    counts: HashMap<EventKind, usize>,
}

impl Flags {
    pub(crate) fn add(&mut self, kind: EventKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    /// Removes one occurrence of `kind`, or all of them.
    pub(crate) fn erase(&mut self, kind: &EventKind, all: bool) {
        let Some(count) = self.counts.get_mut(kind) else {
            return;
        };

        if all || *count <= 1 {
            self.counts.remove(kind);
        } else {
            *count -= 1;
        }
    }

    pub(crate) fn count(&self, kind: &EventKind) -> usize {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

pub(crate) struct TaskState {
    pub(crate) status: Status,
    pub(crate) result: Option<Outcome>,
    pub(crate) handlers: HashMap<EventKind, Handler>,
    pub(crate) flags: Flags,
    pub(crate) defers: Vec<Defer>,
    pub(crate) then_list: Vec<Then>,
    pub(crate) timeout_deadline: Option<Instant>,
    pub(crate) mailbox: VecDeque<Mail>,
    /// Outcome held back while flags are still raised after the body returned.
    pub(crate) settling: Option<Outcome>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            status: Status::Pending,
            result: None,
            handlers: HashMap::new(),
            flags: Flags::default(),
            defers: Vec::new(),
            then_list: Vec::new(),
            timeout_deadline: None,
            mailbox: VecDeque::new(),
            settling: None,
        }
    }
}

/// Registry entry for one task.
///
/// The future lives in its own slot so that it can be taken out while it is polled;
/// an empty slot on a pending task means the task is running right now.
pub(crate) struct TaskCell {
    pub(crate) id: TaskId,
    pub(crate) state: RefCell<TaskState>,
    pub(crate) future: RefCell<Option<TaskFuture>>,
    pub(crate) outcome: Rc<RefCell<Option<Outcome>>>,
}

impl TaskCell {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            state: RefCell::new(TaskState::new()),
            future: RefCell::new(None),
            outcome: Rc::new(RefCell::new(None)),
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.state.borrow().status
    }

    pub(crate) fn is_settling(&self) -> bool {
        self.state.borrow().settling.is_some()
    }

    pub(crate) fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            outcome: self.outcome.clone(),
        }
    }
}

/// Observer of a task's outcome. Outlives the task itself.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    outcome: Rc<RefCell<Option<Outcome>>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    /// The fulfilled value as `T`, if the task fulfilled with one.
    pub fn value<T: Clone + 'static>(&self) -> Option<T> {
        match &*self.outcome.borrow() {
            Some(Ok(payload)) => payload.downcast_ref::<T>().cloned(),
            _ => None,
        }
    }

    /// The rejection cause, if the task was rejected.
    pub fn error(&self) -> Option<TaskError> {
        match &*self.outcome.borrow() {
            Some(Err(cause)) => Some(cause.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
