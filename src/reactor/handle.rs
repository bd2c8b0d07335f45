//! Shared runtime context.
//!
//! Every worker receives a [`ReactorHandle`] on each callback; tasks may capture a
//! clone. It replaces process-wide singletons: tests build as many isolated kernels as
//! they need.

use super::poller::{Interest, PollEvent, Poller};
use super::process::Supervisor;
use crate::config::RuntimeConfig;
use crate::event::{Event, EventKind, EventQueue, Origin, Payload, Subscription};
use crate::net::{HandleId, HandleLimiter, IoHandle, SharedStream, Stream};
use crate::task::Scheduler;

use std::cell::{Cell, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct ReactorHandle {
    inner: Rc<Shared>,
}

struct Shared {
    config: RuntimeConfig,
    scheduler: Scheduler,
    events: EventQueue,
    subscriptions: RefCell<BTreeMap<EventKind, Vec<String>>>,
    poller: RefCell<Poller>,
    watches: RefCell<HashMap<HandleId, Watch>>,
    limiter: HandleLimiter,
    supervisor: RefCell<Supervisor>,
    forked: Cell<bool>,
    stopping: Cell<bool>,
}

/// Readiness owners of one descriptor.
#[derive(Debug, Clone)]
struct Watch {
    fd: RawFd,
    reader: Option<String>,
    writer: Option<String>,
}

impl Watch {
    fn interest(&self) -> Interest {
        Interest {
            read: self.reader.is_some(),
            write: self.writer.is_some(),
        }
    }
}

impl ReactorHandle {
    pub(crate) fn new(config: RuntimeConfig) -> io::Result<Self> {
        let events = EventQueue::new();
        let poller = Poller::new(config.poll_capacity)?;
        let limiter = HandleLimiter::new(config.max_open_handles);

        Ok(Self {
            inner: Rc::new(Shared {
                scheduler: Scheduler::with_events(events.clone()),
                events,
                subscriptions: RefCell::new(BTreeMap::new()),
                poller: RefCell::new(poller),
                watches: RefCell::new(HashMap::new()),
                limiter,
                supervisor: RefCell::new(Supervisor::default()),
                forked: Cell::new(false),
                stopping: Cell::new(false),
                config,
            }),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn events(&self) -> &EventQueue {
        &self.inner.events
    }

    pub fn limiter(&self) -> &HandleLimiter {
        &self.inner.limiter
    }

    pub fn supervisor(&self) -> RefMut<'_, Supervisor> {
        self.inner.supervisor.borrow_mut()
    }

    /// `true` in a process created by [`crate::Kernel::fork`].
    pub fn is_fork(&self) -> bool {
        self.inner.forked.get()
    }

    /// Asks the kernel to shut down at the start of its next turn.
    pub fn stop(&self) {
        self.inner.stopping.set(true);
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.get()
    }

    /// Queues `event` for dispatch on the next drain.
    pub fn publish(&self, event: Event) {
        self.inner.events.push(event);
    }

    /// Asks for `kind` to be delivered to `worker`. Takes effect when the kernel drains
    /// the reserved `Subscribe` event, so ordering with other queued events is kept.
    pub fn subscribe(&self, worker: &str, kind: EventKind) {
        self.publish(Event::new(
            EventKind::Subscribe,
            Payload::new(Subscription {
                worker: worker.to_string(),
                kind,
            }),
            Origin::Worker(worker.to_string()),
        ));
    }

    pub fn unsubscribe(&self, worker: &str, kind: EventKind) {
        self.publish(Event::new(
            EventKind::Unsubscribe,
            Payload::new(Subscription {
                worker: worker.to_string(),
                kind,
            }),
            Origin::Worker(worker.to_string()),
        ));
    }

    /// Workers subscribed to `kind`, in subscription order.
    pub fn subscribers(&self, kind: &EventKind) -> Vec<String> {
        self.inner
            .subscriptions
            .borrow()
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn apply_subscription(&self, action: &EventKind, subscription: &Subscription) {
        let mut table = self.inner.subscriptions.borrow_mut();

        match action {
            EventKind::Subscribe => {
                let workers = table.entry(subscription.kind.clone()).or_default();
                if !workers.contains(&subscription.worker) {
                    workers.push(subscription.worker.clone());
                }
                debug!(worker = %subscription.worker, kind = %subscription.kind, "subscribed");
            }
            EventKind::Unsubscribe => {
                if let Some(workers) = table.get_mut(&subscription.kind) {
                    workers.retain(|worker| worker != &subscription.worker);
                    if workers.is_empty() {
                        table.remove(&subscription.kind);
                    }
                }
                debug!(worker = %subscription.worker, kind = %subscription.kind, "unsubscribed");
            }
            _ => {}
        }
    }

    /// Removes `worker` from every subscription list and readiness watch.
    pub(crate) fn forget_worker(&self, worker: &str) {
        let mut table = self.inner.subscriptions.borrow_mut();
        for workers in table.values_mut() {
            workers.retain(|name| name != worker);
        }
        table.retain(|_, workers| !workers.is_empty());
        drop(table);

        let ids: Vec<HandleId> = self
            .inner
            .watches
            .borrow()
            .iter()
            .filter(|(_, watch)| {
                watch.reader.as_deref() == Some(worker) || watch.writer.as_deref() == Some(worker)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let released = self.update_watch(id, None, |watch| {
                if watch.reader.as_deref() == Some(worker) {
                    watch.reader = None;
                }
                if watch.writer.as_deref() == Some(worker) {
                    watch.writer = None;
                }
            });
            if let Err(error) = released {
                trace!(handle = %id, worker, %error, "unwatch failed");
            }
        }
    }

    /// Routes read readiness of `fd` to `owner`.
    pub fn watch_readable(&self, id: HandleId, fd: RawFd, owner: &str) -> io::Result<()> {
        self.update_watch(id, Some(fd), |watch| watch.reader = Some(owner.to_string()))
    }

    /// Routes write readiness of `fd` to `owner`.
    pub fn watch_writable(&self, id: HandleId, fd: RawFd, owner: &str) -> io::Result<()> {
        self.update_watch(id, Some(fd), |watch| watch.writer = Some(owner.to_string()))
    }

    pub fn unwatch_readable(&self, id: HandleId) -> io::Result<()> {
        self.update_watch(id, None, |watch| watch.reader = None)
    }

    pub fn unwatch_writable(&self, id: HandleId) -> io::Result<()> {
        self.update_watch(id, None, |watch| watch.writer = None)
    }

    /// Cancels every readiness subscription of `id`. Call before closing the descriptor.
    pub fn unwatch(&self, id: HandleId) -> io::Result<()> {
        self.update_watch(id, None, |watch| {
            watch.reader = None;
            watch.writer = None;
        })
    }

    pub fn is_watching_readable(&self, id: HandleId) -> bool {
        self.inner
            .watches
            .borrow()
            .get(&id)
            .is_some_and(|watch| watch.reader.is_some())
    }

    pub fn is_watching_writable(&self, id: HandleId) -> bool {
        self.inner
            .watches
            .borrow()
            .get(&id)
            .is_some_and(|watch| watch.writer.is_some())
    }

    /// `(reader, writer)` owners of `id`.
    pub(crate) fn owners(&self, id: HandleId) -> Option<(Option<String>, Option<String>)> {
        self.inner
            .watches
            .borrow()
            .get(&id)
            .map(|watch| (watch.reader.clone(), watch.writer.clone()))
    }

    /// Applies `change` to the watch of `id` and syncs the poller. `fd` is required to
    /// create a new watch; without it a missing watch is left alone.
    fn update_watch(&self, id: HandleId, fd: Option<RawFd>, change: impl FnOnce(&mut Watch)) -> io::Result<()> {
        let mut watches = self.inner.watches.borrow_mut();

        let existed = watches.contains_key(&id);
        if !existed {
            let Some(fd) = fd else {
                return Ok(());
            };
            watches.insert(
                id,
                Watch {
                    fd,
                    reader: None,
                    writer: None,
                },
            );
        }
        let Some(watch) = watches.get_mut(&id) else {
            return Ok(());
        };

        let before = watch.interest();
        change(watch);
        let after = watch.interest();
        let fd = watch.fd;

        if before == after && existed {
            return Ok(());
        }

        let poller = self.inner.poller.borrow();
        if after.is_empty() {
            watches.remove(&id);
            if existed {
                if let Err(error) = poller.deregister(fd) {
                    trace!(handle = %id, %error, "deregister failed");
                }
            }
            return Ok(());
        }

        if existed {
            return poller.reregister(fd, id.token(), after);
        }

        let registered = poller.register(fd, id.token(), after);
        if registered.is_err() {
            watches.remove(&id);
        }
        registered
    }

    pub(crate) fn poll(&self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        self.inner.poller.borrow_mut().poll(timeout, out)
    }

    /// Wraps `handle` in a backpressure stream using this runtime's overflow settings.
    pub fn stream(&self, handle: IoHandle) -> SharedStream {
        Rc::new(RefCell::new(Stream::new(
            handle,
            self.inner.limiter.clone(),
            self.inner.config.runtime_dir.clone(),
        )))
    }

    /// Writes through `stream` and publishes `Buffered` when the write starts an
    /// overflow, so the buffer service drains it on write readiness.
    pub fn write(&self, stream: &SharedStream, data: &[u8]) -> io::Result<usize> {
        let (written, id, started) = {
            let mut guard = stream.borrow_mut();
            let was_buffering = guard.is_buffering();
            let written = guard.write(data)?;
            (written, guard.id(), !was_buffering && guard.is_buffering())
        };

        if started {
            self.publish(Event::new(
                EventKind::Buffered,
                Payload::new(stream.clone()),
                Origin::Handle(id),
            ));
        }
        Ok(written)
    }

    /// Raw descriptor of a shared stream.
    pub fn stream_fd(stream: &SharedStream) -> RawFd {
        stream.borrow().transport().as_raw_fd()
    }

    /// Resets process-local state in a forked child.
    pub(crate) fn after_fork(&self) -> io::Result<()> {
        *self.inner.poller.borrow_mut() = Poller::new(self.inner.config.poll_capacity)?;
        self.inner.watches.borrow_mut().clear();
        self.inner.supervisor.borrow_mut().forget();
        self.inner.forked.set(true);
        Ok(())
    }
}
