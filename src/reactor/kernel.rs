//! The event loop owner.
//!
//! One [`Kernel::turn`] polls readiness, routes it to the owning workers, fires task
//! timers, polls woken tasks and drains the event queue. A heartbeat followed by task
//! garbage collection runs whenever the heartbeat interval elapsed or the poll came
//! back idle.

use super::handle::ReactorHandle;
use super::poller::{PollEvent, Readiness};
use super::process::Fork;
use super::signal::Signals;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Subscription};
use crate::net::HandleId;
use crate::task::Scheduler;
use crate::worker::{BufferWorker, Worker};

use std::fs;
use std::io::{self, Write};
use std::mem;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub struct Kernel {
    reactor: ReactorHandle,
    workers: Vec<Box<dyn Worker>>,
    builtins: Vec<String>,
    ready: Vec<PollEvent>,
    signals: Signals,
    last_heartbeat: Instant,
    stopped: bool,
}

impl Kernel {
    /// Builds a kernel with the built-in services loaded.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        fs::create_dir_all(&config.runtime_dir)?;

        let mut kernel = Self {
            reactor: ReactorHandle::new(config)?,
            workers: Vec::new(),
            builtins: Vec::new(),
            ready: Vec::new(),
            signals: Signals::default(),
            last_heartbeat: Instant::now(),
            stopped: false,
        };

        let buffer = BufferWorker::new();
        kernel.builtins.push(buffer.name().to_string());
        kernel.push(buffer)?;
        kernel.consume();

        Ok(kernel)
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.reactor.scheduler()
    }

    pub fn is_fork(&self) -> bool {
        self.reactor.is_fork()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Names of the loaded workers, built-ins first.
    pub fn workers(&self) -> Vec<&str> {
        self.workers.iter().map(|worker| worker.name()).collect()
    }

    /// Loads `worker` and runs its `init`.
    pub fn push<W: Worker + 'static>(&mut self, worker: W) -> Result<()> {
        let name = worker.name().to_string();
        if self.position(&name).is_some() {
            return Err(Error::DuplicateWorker(name));
        }

        let mut worker = Box::new(worker);
        worker.init(&self.reactor)?;
        self.workers.push(worker);

        info!(worker = %name, "worker loaded");
        Ok(())
    }

    /// Shuts `name` down and removes it with its subscriptions.
    pub fn unload(&mut self, name: &str) -> Result<()> {
        let index = self
            .position(name)
            .ok_or_else(|| Error::UnknownWorker(name.to_string()))?;

        let mut worker = self.workers.remove(index);
        worker.shutdown(&self.reactor);
        self.reactor.forget_worker(name);

        info!(worker = %name, "worker unloaded");
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.workers.iter().position(|worker| worker.name() == name)
    }

    pub fn publish(&self, event: Event) {
        self.reactor.publish(event);
    }

    /// Installs the shutdown signal handlers.
    pub fn install_signal_handlers(&mut self) -> Result<()> {
        self.signals.install()?;
        Ok(())
    }

    /// Drains the event queue completely, including events published while draining.
    pub fn consume(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.reactor.events().pop() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    fn dispatch(&mut self, event: Event) {
        match &event.kind {
            EventKind::Suspend => trace!(origin = ?event.origin, "suspend"),
            action @ (EventKind::Subscribe | EventKind::Unsubscribe) => {
                match event.payload.downcast_ref::<Subscription>() {
                    Some(subscription) => self.reactor.apply_subscription(action, subscription),
                    None => warn!(kind = %action, "subscription event without subscription payload"),
                }
            }
            kind => {
                let subscribers = self.reactor.subscribers(kind);
                if subscribers.is_empty() {
                    trace!(kind = %kind, "event without subscriber");
                }

                for name in subscribers {
                    if let Some(worker) = self.workers.iter_mut().find(|worker| worker.name() == name) {
                        worker.handle_event(&event, &self.reactor);
                    }
                }
            }
        }
    }

    fn dispatch_readiness(&mut self, event: PollEvent) {
        let id = HandleId::from_token(event.token);
        let Some((reader, writer)) = self.reactor.owners(id) else {
            return;
        };

        let ready = event.readiness;
        let mut calls: Vec<(String, Readiness)> = Vec::with_capacity(2);

        if let Some(owner) = reader.filter(|_| ready.readable || ready.hangup) {
            calls.push((
                owner,
                Readiness {
                    readable: true,
                    writable: false,
                    hangup: ready.hangup,
                },
            ));
        }

        if let Some(owner) = writer.filter(|_| ready.writable || ready.hangup) {
            match calls.iter_mut().find(|(name, _)| *name == owner) {
                Some((_, readiness)) => readiness.writable = true,
                None => calls.push((
                    owner,
                    Readiness {
                        readable: false,
                        writable: true,
                        hangup: ready.hangup,
                    },
                )),
            }
        }

        for (owner, readiness) in calls {
            if let Some(worker) = self.workers.iter_mut().find(|worker| worker.name() == owner) {
                worker.handle_readiness(id, readiness, &self.reactor);
            }
        }
    }

    /// Calls every worker's heartbeat once.
    pub fn heartbeat(&mut self) {
        for worker in self.workers.iter_mut() {
            worker.heartbeat(&self.reactor);
        }
        self.last_heartbeat = Instant::now();
    }

    /// One full tick: task timers, woken tasks, event drain, heartbeat, then GC.
    pub fn tick(&mut self) {
        let scheduler = self.reactor.scheduler().clone();
        scheduler.expire_timeouts();
        scheduler.run_ready();
        self.consume();
        self.heartbeat();
        let collected = scheduler.collect_garbage();
        if collected > 0 {
            debug!(collected, "tasks collected");
        }
    }

    /// Runs one loop iteration. Returns `false` once the kernel has shut down.
    pub fn turn(&mut self) -> Result<bool> {
        if self.stopped {
            return Ok(false);
        }
        if let Some(signal) = self.signals.take() {
            self.shutdown(Some(signal));
            return Ok(false);
        }
        if self.reactor.is_stopping() {
            self.shutdown(None);
            return Ok(false);
        }

        let timeout = self.poll_timeout();
        let mut ready = mem::take(&mut self.ready);
        ready.clear();
        let polled = self.reactor.poll(Some(timeout), &mut ready)?;
        for event in &ready {
            self.dispatch_readiness(*event);
        }
        self.ready = ready;

        let scheduler = self.reactor.scheduler().clone();
        scheduler.expire_timeouts();
        scheduler.run_ready();
        self.consume();

        if polled == 0 || self.last_heartbeat.elapsed() >= self.reactor.config().heartbeat_interval {
            self.heartbeat();
            scheduler.collect_garbage();
        }

        Ok(true)
    }

    /// Turns until a shutdown signal arrives or [`ReactorHandle::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        info!(pid = std::process::id(), "kernel running");
        while self.turn()? {}
        Ok(())
    }

    /// Turns until `done` returns `true` or `limit` elapses. Returns whether `done`
    /// was reached.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Kernel) -> bool) -> Result<bool> {
        let deadline = Instant::now() + limit;
        while !done(self) {
            if Instant::now() >= deadline || !self.turn()? {
                return Ok(done(self));
            }
        }
        Ok(true)
    }

    fn poll_timeout(&self) -> Duration {
        if !self.reactor.events().is_empty() || self.reactor.scheduler().has_ready() {
            return Duration::ZERO;
        }

        let heartbeat = self
            .reactor
            .config()
            .heartbeat_interval
            .saturating_sub(self.last_heartbeat.elapsed());

        match self.reactor.scheduler().next_deadline() {
            Some(deadline) => deadline.min(heartbeat),
            None => heartbeat,
        }
    }

    /// Orderly shutdown: relay `signal` to children and reap them, release every
    /// worker's handles, drop pending tasks and flush logs.
    pub fn shutdown(&mut self, signal: Option<i32>) {
        if self.stopped {
            return;
        }
        info!(signal = ?signal, "kernel shutting down");

        {
            let mut supervisor = self.reactor.supervisor();
            if let Some(signal) = signal {
                supervisor.relay(signal);
                for (pid, status) in supervisor.wait_all() {
                    debug!(pid, status, "child reaped");
                }
            } else {
                supervisor.reap();
            }
        }

        for worker in self.workers.iter_mut().rev() {
            worker.shutdown(&self.reactor);
        }
        self.reactor.scheduler().clear();
        self.reactor.events().clear();
        self.stopped = true;

        info!("kernel stopped");
        let _ = io::stderr().flush();
    }

    /// Duplicates the process.
    ///
    /// The event queue is drained first so no event is handled twice. In the child,
    /// the poller is replaced and built-in services plus every worker not listed in
    /// `exclude` run their `after_fork`. In the parent, the child is registered with the
    /// supervisor. A failed fork is returned as an error and the parent carries on.
    pub fn fork(&mut self, exclude: &[&str]) -> Result<Fork> {
        self.consume();
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let error = io::Error::last_os_error();
            error!(%error, "fork failed");
            return Err(Error::Fork(error));
        }

        if pid == 0 {
            self.reactor.after_fork()?;
            for worker in self.workers.iter_mut() {
                let reset = {
                    let name = worker.name();
                    self.builtins.iter().any(|builtin| builtin == name)
                        || !exclude.iter().any(|excluded| *excluded == name)
                };
                if reset {
                    worker.after_fork(&self.reactor);
                }
            }
            debug!(pid = std::process::id(), "running as forked child");
            return Ok(Fork::Child);
        }

        self.reactor.supervisor().adopt(pid);
        info!(pid, "child process started");
        Ok(Fork::Parent(pid))
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if !self.stopped {
            for worker in self.workers.iter_mut().rev() {
                worker.shutdown(&self.reactor);
            }
            self.reactor.scheduler().clear();
        }
    }
}
