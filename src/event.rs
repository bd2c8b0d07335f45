//! Events exchanged between tasks, workers and the kernel.
//!
//! An [`Event`] is a plain value: a kind, an opaque payload and the identity of the
//! component that produced it. Events placed on the [`EventQueue`] are consumed once,
//! in FIFO order, by the kernel.

use crate::net::HandleId;
use crate::task::TaskId;

use std::any::Any;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Closed set of event classes known to the runtime, plus application-defined kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A task yielded control.
    Suspend,
    /// The only kind that satisfies a suspended task.
    Resume,
    Exception,
    Timeout,
    Fulfilled,
    Rejected,
    /// Reserved: a worker asks to receive a kind.
    Subscribe,
    /// Reserved: a worker stops receiving a kind.
    Unsubscribe,
    /// A stream started spilling to its overflow file.
    Buffered,
    /// A stream's overflow file was fully drained.
    Unbuffered,
    /// Request to stream a file into a stream.
    TransferFile,
    Custom(Cow<'static, str>),
}

impl EventKind {
    pub fn custom(name: impl Into<Cow<'static, str>>) -> Self {
        Self::Custom(name.into())
    }

    /// Kinds whose payload is a failure cause.
    pub fn is_exceptional(&self) -> bool {
        matches!(self, Self::Exception | Self::Timeout)
    }

    /// Kinds handled by the kernel itself to maintain the subscription table.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Subscribe | Self::Unsubscribe)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Exception => "exception",
            Self::Timeout => "timeout",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
            Self::Subscribe => "event.subscribe",
            Self::Unsubscribe => "event.unsubscribe",
            Self::Buffered => "socket.buffer",
            Self::Unbuffered => "socket.unbuffer",
            Self::TransferFile => "socket.transfer",
            Self::Custom(name) => name.as_ref(),
        };
        f.write_str(name)
    }
}

/// Opaque, cheaply clonable event payload.
#[derive(Clone, Default)]
pub struct Payload(Option<Rc<dyn Any>>);

impl Payload {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Some(Rc::new(value)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Borrows the payload as `T` if that is what it holds.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Payload(..)"),
            None => f.write_str("Payload(empty)"),
        }
    }
}

/// Who produced an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Kernel,
    Task(TaskId),
    Worker(String),
    Handle(HandleId),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Payload,
    pub origin: Origin,
}

impl Event {
    pub fn new(kind: EventKind, payload: Payload, origin: Origin) -> Self {
        Self {
            kind,
            payload,
            origin,
        }
    }

    /// A `Resume` event carrying `payload`.
    pub fn resume(payload: Payload, origin: Origin) -> Self {
        Self::new(EventKind::Resume, payload, origin)
    }

    /// The `Suspend` event a task yields to whoever resumed it.
    pub fn suspend(task: TaskId) -> Self {
        Self::new(EventKind::Suspend, Payload::empty(), Origin::Task(task))
    }
}

/// Payload of the reserved `Subscribe` / `Unsubscribe` kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub worker: String,
    pub kind: EventKind,
}

/// Pending-event queue shared by the kernel, the scheduler and the workers.
#[derive(Clone, Default)]
pub struct EventQueue {
    queue: Rc<RefCell<VecDeque<Event>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.queue.borrow_mut().push_back(event);
    }

    pub fn pop(&self) -> Option<Event> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.queue.borrow_mut().clear();
    }
}
