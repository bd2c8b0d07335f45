//! Task registry and the suspend/resume driver.
//!
//! The [`Scheduler`] owns every live task by id. Resuming a task pushes an event into
//! its mailbox and polls its future until the next suspension or until it returns.
//! A returned task is settled (status, result, handler events), finalized (defers)
//! and removed from the registry in the same call.

use super::context::TaskContext;
use super::core::{Defer, Mail, Outcome, Status, TaskCell, TaskHandle, TaskId, TaskState};
use super::timer::{TimerKind, TimerList};
use super::waker::{ReadyQueue, task_waker};
use crate::error::{Error, Result, TaskError};
use crate::event::{Event, EventKind, EventQueue, Origin, Payload};

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Result of driving a task once.
#[derive(Debug)]
pub enum Step {
    /// The task yielded; the event is its `Suspend` token.
    Suspended(Event),
    /// The task reached a terminal status during this call, or already had one.
    Terminated(Status),
    /// The task is running further up the stack; the input was queued in its
    /// mailbox and will be observed at its next suspension.
    Deferred,
}

/// Owner of all live tasks.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    tasks: RefCell<BTreeMap<TaskId, Rc<TaskCell>>>,
    ready: Arc<ReadyQueue>,
    timers: RefCell<TimerList>,
    running: RefCell<Vec<TaskId>>,
    events: EventQueue,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler with its own event queue.
    pub fn new() -> Self {
        Self::with_events(EventQueue::new())
    }

    /// Creates a scheduler publishing task events into `events`.
    pub fn with_events(events: EventQueue) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                tasks: RefCell::new(BTreeMap::new()),
                ready: Arc::new(ReadyQueue::default()),
                timers: RefCell::new(TimerList::default()),
                running: RefCell::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn events(&self) -> &EventQueue {
        &self.inner.events
    }

    /// Creates a task and runs it immediately until its first suspension.
    ///
    /// # Example
    /// ```ignore
    /// let scheduler = Scheduler::new();
    /// let handle = scheduler.spawn(|ctx| async move {
    ///     ctx.suspend().await?;
    ///     Ok(42)
    /// });
    /// scheduler.resume(handle.id(), Event::resume(Payload::empty(), Origin::Kernel))?;
    /// assert_eq!(handle.value::<i32>(), Some(42));
    /// ```
    pub fn spawn<F, Fut, T>(&self, body: F) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, TaskError>> + 'static,
        T: 'static,
    {
        let cell = self.inner.create(body);
        let handle = cell.handle();
        self.inner.poll_task(&cell);
        handle
    }

    /// Creates a task and enqueues it; it first runs on the next [`Self::run_ready`].
    pub fn queue<F, Fut, T>(&self, body: F) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, TaskError>> + 'static,
        T: 'static,
    {
        let cell = self.inner.create(body);
        self.inner.ready.push(cell.id);
        cell.handle()
    }

    /// Delivers `event` to a suspended task and runs it until it suspends again or
    /// terminates.
    pub fn resume(&self, task: TaskId, event: Event) -> Result<Step> {
        self.inner.resume(task, event)
    }

    /// Injects `cause` at the task's suspension point.
    pub fn throw(&self, task: TaskId, cause: TaskError) -> Result<Step> {
        self.inner.throw(task, cause)
    }

    /// Cancels a task by throwing [`TaskError::Cancelled`] into it.
    pub fn cancel(&self, task: TaskId, reason: impl Into<String>) -> Result<Step> {
        self.inner.throw(task, TaskError::Cancelled(reason.into()))
    }

    /// Delivers every elapsed timer. Returns how many reached a live task.
    pub fn expire_timeouts(&self) -> usize {
        self.inner.expire_timeouts()
    }

    /// Polls the tasks that were queued or woken since the last call.
    pub fn run_ready(&self) -> usize {
        self.inner.run_ready()
    }

    /// Removes every task whose status is terminal. Returns how many were removed.
    pub fn collect_garbage(&self) -> usize {
        let mut tasks = self.inner.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|_, cell| !cell.status().is_terminal());
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.borrow().is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.inner.tasks.borrow().contains_key(&task)
    }

    pub fn status(&self, task: TaskId) -> Option<Status> {
        self.inner.cell(task).map(|cell| cell.status())
    }

    /// The task being polled right now, if any.
    pub fn current(&self) -> Option<TaskId> {
        self.inner.running.borrow().last().copied()
    }

    /// Time until the next task timer is due.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.timers.borrow().next_remaining()
    }

    pub fn has_ready(&self) -> bool {
        !self.inner.ready.is_empty()
    }

    /// Drops every task without running its defers.
    pub(crate) fn clear(&self) {
        let tasks = mem::take(&mut *self.inner.tasks.borrow_mut());
        self.inner.timers.borrow_mut().clear();
        self.inner.ready.clear();
        drop(tasks);
    }
}

impl SchedulerInner {
    pub(crate) fn cell(&self, task: TaskId) -> Option<Rc<TaskCell>> {
        self.tasks.borrow().get(&task).cloned()
    }

    pub(crate) fn events(&self) -> &EventQueue {
        &self.events
    }

    pub(crate) fn with_state<R>(&self, task: TaskId, f: impl FnOnce(&mut TaskState) -> R) -> Option<R> {
        let cell = self.cell(task)?;
        let mut state = cell.state.borrow_mut();
        Some(f(&mut state))
    }

    pub(crate) fn register_timer(&self, deadline: Instant, task: TaskId, kind: TimerKind) {
        self.timers.borrow_mut().register(deadline, task, kind);
    }

    pub(crate) fn next_mail(&self, task: TaskId) -> Option<Mail> {
        self.with_state(task, |state| state.mailbox.pop_front()).flatten()
    }

    pub(crate) fn has_flags(&self, task: TaskId) -> bool {
        self.with_state(task, |state| !state.flags.is_empty())
            .unwrap_or(false)
    }

    /// Registers `defer` on `task`. Returns `false` if the task is gone.
    pub(crate) fn add_defer(&self, task: TaskId, defer: Defer) -> bool {
        self.with_state(task, |state| state.defers.push(defer)).is_some()
    }

    fn create<F, Fut, T>(self: &Rc<Self>, body: F) -> Rc<TaskCell>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, TaskError>> + 'static,
        T: 'static,
    {
        let id = TaskId::next();
        let cell = Rc::new(TaskCell::new(id));
        self.tasks.borrow_mut().insert(id, cell.clone());

        let future = body(TaskContext::new(id, Rc::downgrade(self)));
        *cell.future.borrow_mut() = Some(Box::pin(async move { future.await.map(Payload::new) }));

        debug!(task = %id, "task created");
        cell
    }

    pub(crate) fn resume(self: &Rc<Self>, task: TaskId, event: Event) -> Result<Step> {
        let cell = self.cell(task).ok_or(Error::UnknownTask(task))?;

        let status = cell.status();
        if status.is_terminal() {
            return Ok(Step::Terminated(status));
        }

        trace!(task = %task, kind = %event.kind, "resume");
        if cell.is_settling() {
            if event.kind != EventKind::Resume {
                self.dispatch(&cell, &event);
            }
            return Ok(self.retry_settle(&cell));
        }

        cell.state.borrow_mut().mailbox.push_back(Mail::Event(event));
        Ok(self.poll_task(&cell))
    }

    pub(crate) fn throw(self: &Rc<Self>, task: TaskId, cause: TaskError) -> Result<Step> {
        let cell = self.cell(task).ok_or(Error::UnknownTask(task))?;

        let status = cell.status();
        if status.is_terminal() {
            return Ok(Step::Terminated(status));
        }

        if cell.is_settling() {
            debug!(task = %task, %cause, "throw into a settling task ignored");
            return Ok(self.retry_settle(&cell));
        }

        cell.state.borrow_mut().mailbox.push_back(Mail::Throw(cause));
        Ok(self.poll_task(&cell))
    }

    /// Dispatches `event` to the handler of `task`, if the task is still alive.
    pub(crate) fn dispatch_to(self: &Rc<Self>, task: TaskId, event: &Event) {
        if let Some(cell) = self.cell(task) {
            self.dispatch(&cell, event);
        }
    }

    fn poll_task(self: &Rc<Self>, cell: &Rc<TaskCell>) -> Step {
        let taken = cell.future.borrow_mut().take();
        let Some(mut future) = taken else {
            let status = cell.status();
            if status.is_terminal() {
                return Step::Terminated(status);
            }
            self.ready.push(cell.id);
            return Step::Deferred;
        };

        self.running.borrow_mut().push(cell.id);
        let waker = task_waker(cell.id, self.ready.clone());
        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        self.running.borrow_mut().pop();

        match polled {
            Ok(Poll::Pending) => {
                *cell.future.borrow_mut() = Some(future);
                trace!(task = %cell.id, "suspended");
                Step::Suspended(Event::suspend(cell.id))
            }
            Ok(Poll::Ready(outcome)) => {
                drop(future);
                self.settle(cell, outcome)
            }
            Err(panic) => {
                drop(future);
                self.settle(cell, Err(TaskError::Panicked(panic_message(panic.as_ref()))))
            }
        }
    }

    /// Completes the task unless flags are still raised, in which case the outcome is
    /// held until the flags clear.
    fn settle(self: &Rc<Self>, cell: &Rc<TaskCell>, outcome: Outcome) -> Step {
        {
            let mut state = cell.state.borrow_mut();
            if !state.flags.is_empty() {
                debug!(task = %cell.id, "body returned with raised flags");
                state.settling = Some(outcome);
                return Step::Suspended(Event::suspend(cell.id));
            }
        }

        self.complete(cell, outcome)
    }

    fn retry_settle(self: &Rc<Self>, cell: &Rc<TaskCell>) -> Step {
        let outcome = {
            let mut state = cell.state.borrow_mut();
            if !state.flags.is_empty() {
                return Step::Suspended(Event::suspend(cell.id));
            }
            state.settling.take()
        };

        match outcome {
            Some(outcome) => self.complete(cell, outcome),
            None => Step::Terminated(cell.status()),
        }
    }

    fn complete(self: &Rc<Self>, cell: &Rc<TaskCell>, outcome: Outcome) -> Step {
        let status = match outcome {
            Ok(_) => Status::Fulfilled,
            Err(_) => Status::Rejected,
        };

        {
            let mut state = cell.state.borrow_mut();
            state.status = status;
            state.result = Some(outcome.clone());
            state.timeout_deadline = None;
            state.mailbox.clear();
        }
        self.timers.borrow_mut().cancel(cell.id);
        *cell.outcome.borrow_mut() = Some(outcome.clone());

        match &outcome {
            Ok(value) => {
                let then_list = mem::take(&mut cell.state.borrow_mut().then_list);
                for callback in then_list {
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
                        self.process_exception(cell, TaskError::Panicked(panic_message(panic.as_ref())));
                    }
                }
                let event = Event::new(EventKind::Fulfilled, value.clone(), Origin::Task(cell.id));
                self.dispatch(cell, &event);
            }
            Err(cause) => {
                let event = Event::new(EventKind::Rejected, Payload::new(cause.clone()), Origin::Task(cell.id));
                self.dispatch(cell, &event);
                self.process_exception(cell, cause.clone());
            }
        }

        self.finalize(cell, &outcome);
        Step::Terminated(status)
    }

    /// Raises the exception flag, routes the cause to the `Exception` (or `Timeout`)
    /// handler and lowers the flag again.
    fn process_exception(self: &Rc<Self>, cell: &Rc<TaskCell>, cause: TaskError) {
        cell.state.borrow_mut().flags.add(EventKind::Exception);

        let kind = if cause.is_timeout() {
            EventKind::Timeout
        } else {
            EventKind::Exception
        };
        self.dispatch(cell, &Event::new(kind, Payload::new(cause), Origin::Task(cell.id)));

        cell.state.borrow_mut().flags.erase(&EventKind::Exception, false);
    }

    fn dispatch(self: &Rc<Self>, cell: &Rc<TaskCell>, event: &Event) {
        let handler = cell.state.borrow().handlers.get(&event.kind).cloned();

        let Some(handler) = handler else {
            if event.kind.is_exceptional() {
                error!(
                    task = %cell.id,
                    kind = %event.kind,
                    cause = ?event.payload.downcast_ref::<TaskError>(),
                    "unhandled task exception"
                );
            } else {
                trace!(task = %cell.id, kind = %event.kind, "no handler");
            }
            return;
        };

        let context = TaskContext::new(cell.id, Rc::downgrade(self));
        let result = match panic::catch_unwind(AssertUnwindSafe(|| handler(event, &context))) {
            Ok(result) => result,
            Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
        };

        if let Err(cause) = result {
            if event.kind.is_exceptional() {
                error!(task = %cell.id, kind = %event.kind, %cause, "task exception handler failed");
            } else {
                self.process_exception(cell, cause);
            }
        }
    }

    /// Runs the defers in registration order, then removes the task.
    fn finalize(self: &Rc<Self>, cell: &Rc<TaskCell>, outcome: &Outcome) {
        loop {
            let defers = mem::take(&mut cell.state.borrow_mut().defers);
            if defers.is_empty() {
                break;
            }

            for defer in defers {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| defer(outcome))) {
                    self.process_exception(cell, TaskError::Panicked(panic_message(panic.as_ref())));
                }
            }
        }

        self.tasks.borrow_mut().remove(&cell.id);
        debug!(task = %cell.id, status = ?cell.status(), "task finalized");
    }

    fn expire_timeouts(self: &Rc<Self>) -> usize {
        let fired = self.timers.borrow_mut().take_expired(Instant::now());
        let mut delivered = 0;

        for (task, kind) in fired {
            let Some(cell) = self.cell(task) else {
                continue;
            };
            if cell.status().is_terminal() {
                continue;
            }

            let event = match kind {
                TimerKind::Timeout => {
                    cell.state.borrow_mut().timeout_deadline = None;
                    Event::new(EventKind::Timeout, Payload::new(TaskError::Timeout), Origin::Kernel)
                }
                TimerKind::Wake => Event::resume(Payload::empty(), Origin::Kernel),
            };

            if self.resume(task, event).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    fn run_ready(self: &Rc<Self>) -> usize {
        let mut polled = 0;

        for _ in 0..self.ready.len() {
            let Some(task) = self.ready.pop() else {
                break;
            };
            let Some(cell) = self.cell(task) else {
                continue;
            };
            if cell.status().is_terminal() || cell.is_settling() {
                continue;
            }
            if self.running.borrow().contains(&task) {
                continue;
            }

            self.poll_task(&cell);
            polled += 1;
        }

        polled
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
