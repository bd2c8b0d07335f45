//! The task-side view of the scheduler.

use super::core::{Mail, Outcome, Status, TaskHandle, TaskId};
use super::scheduler::{SchedulerInner, Step};
use super::timer::TimerKind;
use crate::error::{Error, TaskError};
use crate::event::{Event, EventKind, Origin, Payload};

use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::warn;

/// How a suspension ended.
#[derive(Debug, Clone)]
pub enum Resumption {
    /// The task was resumed with a value.
    Value(Payload),
    /// Application events were handled and no flag is raised any more, but nothing
    /// resumed the task.
    Drained,
}

impl Resumption {
    pub fn into_value(self) -> Option<Payload> {
        match self {
            Self::Value(payload) => Some(payload),
            Self::Drained => None,
        }
    }
}

/// Handle given to a task body.
///
/// It only holds the task id and a weak reference to the registry, so a body can keep
/// it across suspensions without keeping the registry alive.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    scheduler: Weak<SchedulerInner>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, scheduler: Weak<SchedulerInner>) -> Self {
        Self { id, scheduler }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    fn inner(&self) -> Result<Rc<SchedulerInner>, TaskError> {
        self.scheduler.upgrade().ok_or(TaskError::SchedulerGone)
    }

    fn update(&self, f: impl FnOnce(&mut super::core::TaskState)) {
        let applied = self
            .scheduler
            .upgrade()
            .and_then(|inner| inner.with_state(self.id, f));
        if applied.is_none() {
            warn!(task = %self.id, "task is no longer registered");
        }
    }

    pub fn status(&self) -> Option<Status> {
        self.inner()
            .ok()
            .and_then(|inner| inner.with_state(self.id, |state| state.status))
    }

    /// Yields control until the scheduler resumes this task.
    ///
    /// Only a `Resume` event ends the suspension with a value. Any other event is
    /// routed to this task's handler for its kind. Once the mailbox is empty the task
    /// keeps waiting while flags are raised and returns [`Resumption::Drained`]
    /// otherwise. A cause thrown into the task, even by one of its own handlers, comes
    /// back as `Err`.
    pub fn suspend(&self) -> Suspend {
        Suspend {
            context: self.clone(),
        }
    }

    /// Waits for `other` to finish and returns its outcome.
    ///
    /// A defer is registered on `other` that resumes this task with the outcome, so
    /// the await completes exactly once.
    pub async fn await_task(&self, other: &TaskHandle) -> Outcome {
        if let Some(outcome) = other.outcome() {
            return outcome;
        }

        {
            let inner = self.inner()?;
            let waiter = self.id;
            let scheduler = self.scheduler.clone();
            let origin = other.id();

            let registered = inner.add_defer(
                other.id(),
                Box::new(move |outcome: &Outcome| {
                    if let Some(inner) = scheduler.upgrade() {
                        let event = Event::resume(Payload::new(outcome.clone()), Origin::Task(origin));
                        if let Err(error) = inner.resume(waiter, event) {
                            warn!(task = %waiter, %error, "awaiting task vanished");
                        }
                    }
                }),
            );

            if !registered {
                return other
                    .outcome()
                    .unwrap_or_else(|| Err(TaskError::failed(format!("task {origin} is gone"))));
            }
        }

        self.flag(EventKind::Resume);
        let outcome = loop {
            match self.suspend().await {
                Ok(Resumption::Value(payload)) => {
                    if let Some(outcome) = payload.downcast_ref::<Outcome>() {
                        break outcome.clone();
                    }
                }
                Ok(Resumption::Drained) => {}
                Err(cause) => break Err(cause),
            }
        };
        self.erase(EventKind::Resume, false);

        outcome
    }

    /// Suspends this task for at least `duration`.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        self.inner()?
            .register_timer(Instant::now() + duration, self.id, TimerKind::Wake);

        self.flag(EventKind::Resume);
        let result = loop {
            match self.suspend().await {
                Ok(Resumption::Value(_)) => break Ok(()),
                Ok(Resumption::Drained) => {}
                Err(cause) => break Err(cause),
            }
        };
        self.erase(EventKind::Resume, false);

        result
    }

    /// Sets the handler for `kind`, replacing any previous one.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> &Self
    where
        F: Fn(&Event, &TaskContext) -> Result<(), TaskError> + 'static,
    {
        self.update(|state| {
            state.handlers.insert(kind, Rc::new(handler));
        });
        self
    }

    /// Sets the `Exception` handler.
    pub fn catch<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Event, &TaskContext) -> Result<(), TaskError> + 'static,
    {
        self.on(EventKind::Exception, handler)
    }

    /// Adds a callback run with the value if the task fulfills.
    pub fn then<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&Payload) + 'static,
    {
        self.update(|state| state.then_list.push(Box::new(callback)));
        self
    }

    /// Adds a cleanup callback run once at finalization, whatever the outcome.
    pub fn defer<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&Outcome) + 'static,
    {
        self.update(|state| state.defers.push(Box::new(callback)));
        self
    }

    /// Raises one pending obligation of `kind`.
    pub fn flag(&self, kind: EventKind) -> &Self {
        self.update(|state| state.flags.add(kind));
        self
    }

    /// Lowers one obligation of `kind`, or all of them.
    pub fn erase(&self, kind: EventKind, all: bool) -> &Self {
        self.update(|state| state.flags.erase(&kind, all));
        self
    }

    /// Number of raised obligations of `kind`.
    pub fn flag_count(&self, kind: &EventKind) -> usize {
        self.inner()
            .ok()
            .and_then(|inner| inner.with_state(self.id, |state| state.flags.count(kind)))
            .unwrap_or(0)
    }

    /// Arms a timeout. If the task is still pending when `duration` elapses, one
    /// `Timeout` event is delivered and `callback` handles it. Terminating the task
    /// is up to the callback.
    pub fn timeout<F>(&self, callback: F, duration: Duration) -> &Self
    where
        F: Fn(&Event, &TaskContext) -> Result<(), TaskError> + 'static,
    {
        self.on(EventKind::Timeout, callback);

        let deadline = Instant::now() + duration;
        self.update(|state| state.timeout_deadline = Some(deadline));
        if let Ok(inner) = self.inner() {
            inner.register_timer(deadline, self.id, TimerKind::Timeout);
        }
        self
    }

    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.inner()
            .ok()
            .and_then(|inner| inner.with_state(self.id, |state| state.timeout_deadline))
            .flatten()
    }

    /// Places an event on the kernel's pending queue.
    pub fn publish(&self, kind: EventKind, payload: Payload) {
        if let Ok(inner) = self.inner() {
            inner.events().push(Event::new(kind, payload, Origin::Task(self.id)));
        }
    }

    /// Resumes another task with `payload`.
    pub fn resume(&self, task: TaskId, payload: Payload) -> Result<Step, Error> {
        let inner = self.inner().map_err(|_| Error::UnknownTask(task))?;
        inner.resume(task, Event::resume(payload, Origin::Task(self.id)))
    }

    /// Throws `cause` into a task, this one included.
    pub fn throw(&self, task: TaskId, cause: TaskError) -> Result<Step, Error> {
        let inner = self.inner().map_err(|_| Error::UnknownTask(task))?;
        inner.throw(task, cause)
    }
}

/// Future returned by [`TaskContext::suspend`].
pub struct Suspend {
    context: TaskContext,
}

impl Future for Suspend {
    type Output = Result<Resumption, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(inner) = self.context.scheduler.upgrade() else {
            return Poll::Ready(Err(TaskError::SchedulerGone));
        };
        let id = self.context.id;

        // Handlers may queue more mail (a throw into this task, a resume), so the
        // mailbox is emptied before deciding whether the task drained.
        let mut handled = false;
        while let Some(mail) = inner.next_mail(id) {
            match mail {
                Mail::Throw(cause) => return Poll::Ready(Err(cause)),
                Mail::Event(event) if event.kind == EventKind::Resume => {
                    return Poll::Ready(Ok(Resumption::Value(event.payload)));
                }
                Mail::Event(event) => {
                    inner.dispatch_to(id, &event);
                    handled = true;
                }
            }
        }

        if handled && !inner.has_flags(id) {
            return Poll::Ready(Ok(Resumption::Drained));
        }
        Poll::Pending
    }
}
