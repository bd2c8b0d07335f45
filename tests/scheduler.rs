use ripple::event::{Event, EventKind, Origin, Payload};
use ripple::task::{Resumption, Scheduler, Status, Step};
use ripple::{Error, TaskError};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

fn resume_event() -> Event {
    Event::resume(Payload::empty(), Origin::Kernel)
}

#[test]
fn test_spawn_runs_until_first_suspension() {
    let scheduler = Scheduler::new();
    let reached = Rc::new(Cell::new(0));
    let reached_clone = reached.clone();

    let handle = scheduler.spawn(move |ctx| async move {
        reached_clone.set(1);
        ctx.suspend().await?;
        reached_clone.set(2);
        Ok::<_, TaskError>(())
    });

    assert_eq!(reached.get(), 1, "Body should run up to the suspension point");
    assert_eq!(scheduler.status(handle.id()), Some(Status::Pending));
    assert_eq!(scheduler.len(), 1);

    let step = scheduler.resume(handle.id(), resume_event()).unwrap();
    assert!(matches!(step, Step::Terminated(Status::Fulfilled)));
    assert_eq!(reached.get(), 2);
    assert!(handle.is_finished());
    assert!(!scheduler.contains(handle.id()), "Finalize should deregister the task");
}

#[test]
fn test_resume_value_reaches_the_task() {
    let scheduler = Scheduler::new();

    let handle = scheduler.spawn(|ctx| async move {
        let payload = ctx.suspend().await?.into_value().unwrap_or_else(Payload::empty);
        let word = payload.downcast_ref::<&str>().copied().unwrap_or("nothing");
        Ok::<_, TaskError>(word.len())
    });

    scheduler
        .resume(handle.id(), Event::resume(Payload::new("hello"), Origin::Kernel))
        .unwrap();
    assert_eq!(handle.value::<usize>(), Some(5));
}

#[test]
fn test_queue_waits_for_run_ready() {
    let scheduler = Scheduler::new();
    let started = Rc::new(Cell::new(false));
    let started_clone = started.clone();

    let handle = scheduler.queue(move |_ctx| async move {
        started_clone.set(true);
        Ok::<_, TaskError>(7u8)
    });

    assert!(!started.get(), "Queued task should not run before the ready queue is drained");
    assert!(scheduler.has_ready());

    assert_eq!(scheduler.run_ready(), 1);
    assert!(started.get());
    assert_eq!(handle.value::<u8>(), Some(7));
}

#[test]
fn test_defers_run_once_in_order_on_success() {
    let scheduler = Scheduler::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let log_clone = log.clone();

    let handle = scheduler.spawn(move |ctx| async move {
        for n in 1..=3 {
            let log = log_clone.clone();
            ctx.defer(move |_outcome| log.borrow_mut().push(n));
        }
        ctx.suspend().await?;
        Ok::<_, TaskError>(())
    });

    assert!(log.borrow().is_empty(), "Defers wait for finalization");
    scheduler.resume(handle.id(), resume_event()).unwrap();
    assert_eq!(*log.borrow(), vec![1, 2, 3]);

    let again = scheduler.resume(handle.id(), resume_event());
    assert!(matches!(again, Err(Error::UnknownTask(_))), "Finalized task is gone");
    assert_eq!(*log.borrow(), vec![1, 2, 3], "Defers must not run twice");
}

#[test]
fn test_defers_run_on_failure_with_the_cause() {
    let scheduler = Scheduler::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = seen.clone();

    let handle = scheduler.spawn(move |ctx| async move {
        ctx.defer(move |outcome| seen_clone.borrow_mut().push(outcome.clone().err()));
        ctx.catch(|_event, _ctx| Ok(()));
        ctx.suspend().await?;
        Err::<(), TaskError>(TaskError::failed("boom"))
    });

    let step = scheduler.resume(handle.id(), resume_event()).unwrap();
    assert!(matches!(step, Step::Terminated(Status::Rejected)));
    assert_eq!(*seen.borrow(), vec![Some(TaskError::failed("boom"))]);
    assert_eq!(handle.error(), Some(TaskError::failed("boom")));
}

#[test]
fn test_then_runs_before_defers() {
    let scheduler = Scheduler::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let (then_log, defer_log) = (log.clone(), log.clone());

    scheduler.spawn(move |ctx| async move {
        ctx.defer(move |_| defer_log.borrow_mut().push("defer"));
        ctx.then(move |value| {
            let n = value.downcast_ref::<i32>().copied().unwrap_or_default();
            then_log.borrow_mut().push(if n == 3 { "then" } else { "then?" });
        });
        Ok::<_, TaskError>(3i32)
    });

    assert_eq!(*log.borrow(), vec!["then", "defer"]);
}

#[test]
fn test_exception_handler_receives_the_cause() {
    let scheduler = Scheduler::new();
    let caught = Rc::new(RefCell::new(None));
    let caught_clone = caught.clone();

    let handle = scheduler.spawn(move |ctx| async move {
        ctx.catch(move |event, _ctx| {
            *caught_clone.borrow_mut() = event.payload.downcast_ref::<TaskError>().cloned();
            Ok(())
        });
        Err::<(), TaskError>(TaskError::failed("bad input"))
    });

    assert_eq!(*caught.borrow(), Some(TaskError::failed("bad input")));
    assert_eq!(handle.error(), Some(TaskError::failed("bad input")));
}

#[test]
fn test_panic_becomes_rejection() {
    let scheduler = Scheduler::new();
    let cleaned = Rc::new(Cell::new(false));
    let cleaned_clone = cleaned.clone();

    let handle = scheduler.spawn(move |ctx| async move {
        ctx.defer(move |_| cleaned_clone.set(true));
        ctx.catch(|_event, _ctx| Ok(()));
        ctx.suspend().await?;
        if ctx.id().as_u64() > 0 {
            panic!("exploded");
        }
        Ok::<_, TaskError>(())
    });

    let step = scheduler.resume(handle.id(), resume_event()).unwrap();
    assert!(matches!(step, Step::Terminated(Status::Rejected)));
    assert_eq!(handle.error(), Some(TaskError::Panicked("exploded".to_string())));
    assert!(cleaned.get(), "Defers should still run after a panic");
    assert!(scheduler.is_empty());
}

#[test]
fn test_cancel_throws_into_suspended_task() {
    let scheduler = Scheduler::new();

    let handle = scheduler.spawn(|ctx| async move {
        ctx.catch(|_event, _ctx| Ok(()));
        ctx.suspend().await?;
        Ok::<_, TaskError>(())
    });

    let step = scheduler.cancel(handle.id(), "shutting down").unwrap();
    assert!(matches!(step, Step::Terminated(Status::Rejected)));
    assert_eq!(handle.error(), Some(TaskError::Cancelled("shutting down".to_string())));
}

#[test]
fn test_thrown_error_can_be_recovered_by_the_body() {
    let scheduler = Scheduler::new();

    let handle = scheduler.spawn(|ctx| async move {
        match ctx.suspend().await {
            Err(cause) => Ok::<_, TaskError>(format!("recovered from {cause}")),
            Ok(_) => Ok("not thrown".to_string()),
        }
    });

    scheduler.throw(handle.id(), TaskError::failed("oops")).unwrap();
    assert_eq!(handle.value::<String>(), Some("recovered from oops".to_string()));
}

#[test]
fn test_await_composition_observes_value_once() {
    let scheduler = Scheduler::new();
    let observed = Rc::new(RefCell::new(Vec::new()));
    let observed_clone = observed.clone();

    let b = scheduler.spawn(|ctx| async move {
        ctx.suspend().await?;
        Ok::<_, TaskError>(42i32)
    });

    let b_handle = b.clone();
    let a = scheduler.spawn(move |ctx| async move {
        let payload = ctx.await_task(&b_handle).await?;
        let value = payload
            .downcast_ref::<i32>()
            .copied()
            .ok_or_else(|| TaskError::failed("not an i32"))?;
        observed_clone.borrow_mut().push(value);
        Ok::<_, TaskError>(value)
    });

    assert!(!a.is_finished(), "A should wait for B");
    scheduler.resume(b.id(), resume_event()).unwrap();

    assert_eq!(*observed.borrow(), vec![42], "A should observe 42 exactly once");
    assert_eq!(a.value::<i32>(), Some(42));
    assert!(scheduler.is_empty());
}

#[test]
fn test_await_finished_task_returns_immediately() {
    let scheduler = Scheduler::new();
    let b = scheduler.spawn(|_ctx| async { Err::<(), TaskError>(TaskError::failed("early")) });

    let b_handle = b.clone();
    let a = scheduler.spawn(move |ctx| async move {
        match ctx.await_task(&b_handle).await {
            Err(cause) => Ok::<_, TaskError>(cause.to_string()),
            Ok(_) => Ok("fulfilled".to_string()),
        }
    });

    assert_eq!(a.value::<String>(), Some("early".to_string()));
}

#[test]
fn test_raised_flag_holds_completion() {
    let scheduler = Scheduler::new();
    let done = EventKind::custom("job.done");

    let handle = scheduler.spawn({
        let done = done.clone();
        move |ctx| async move {
            ctx.flag(done.clone());
            let kind = done.clone();
            ctx.on(done, move |_event, ctx| {
                ctx.erase(kind.clone(), false);
                Ok(())
            });
            Ok::<_, TaskError>("finished")
        }
    });

    assert_eq!(scheduler.status(handle.id()), Some(Status::Pending), "Flag keeps the task alive");
    assert!(!handle.is_finished());

    let step = scheduler
        .resume(handle.id(), Event::new(done, Payload::empty(), Origin::Kernel))
        .unwrap();
    assert!(matches!(step, Step::Terminated(Status::Fulfilled)));
    assert_eq!(handle.value::<&str>(), Some("finished"));
}

#[test]
fn test_non_resume_event_drains_to_handler() {
    let scheduler = Scheduler::new();
    let ping = EventKind::custom("ping");
    let handled = Rc::new(Cell::new(0));
    let handled_clone = handled.clone();

    let handle = scheduler.spawn({
        let ping = ping.clone();
        move |ctx| async move {
            ctx.on(ping, move |_event, _ctx| {
                handled_clone.set(handled_clone.get() + 1);
                Ok(())
            });
            let drained = matches!(ctx.suspend().await?, Resumption::Drained);
            Ok::<_, TaskError>(drained)
        }
    });

    scheduler
        .resume(handle.id(), Event::new(ping, Payload::empty(), Origin::Kernel))
        .unwrap();
    assert_eq!(handled.get(), 1);
    assert_eq!(handle.value::<bool>(), Some(true));
}

#[test]
fn test_timeout_fires_exactly_once_without_resume() {
    let scheduler = Scheduler::new();
    let timeouts = Rc::new(Cell::new(0));
    let resumes = Rc::new(Cell::new(0));
    let (timeouts_clone, resumes_clone) = (timeouts.clone(), resumes.clone());

    let handle = scheduler.spawn(move |ctx| async move {
        ctx.timeout(
            move |_event, _ctx| {
                timeouts_clone.set(timeouts_clone.get() + 1);
                Ok(())
            },
            Duration::from_millis(100),
        );
        while resumes_clone.get() == 0 {
            if let Resumption::Value(_) = ctx.suspend().await? {
                resumes_clone.set(resumes_clone.get() + 1);
            }
        }
        Ok::<_, TaskError>(())
    });

    assert_eq!(scheduler.expire_timeouts(), 0, "Nothing is due yet");
    thread::sleep(Duration::from_millis(150));

    assert_eq!(scheduler.expire_timeouts(), 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(scheduler.expire_timeouts(), 0, "A timeout is delivered only once");

    assert_eq!(timeouts.get(), 1);
    assert_eq!(resumes.get(), 0, "A timeout is not a resume");
    assert_eq!(scheduler.status(handle.id()), Some(Status::Pending), "Termination is up to the task");
}

#[test]
fn test_timeout_callback_may_reject_the_task() {
    let scheduler = Scheduler::new();

    let handle = scheduler.spawn(|ctx| async move {
        ctx.timeout(
            |_event, ctx| {
                ctx.throw(ctx.id(), TaskError::Timeout)?;
                Ok(())
            },
            Duration::from_millis(10),
        );
        ctx.suspend().await?;
        Ok::<_, TaskError>("completed normally")
    });

    thread::sleep(Duration::from_millis(30));
    scheduler.expire_timeouts();

    assert_eq!(handle.value::<&str>(), None, "The body must not run past the throw");
    assert_eq!(handle.error(), Some(TaskError::Timeout));
    assert!(scheduler.is_empty());
}

#[test]
fn test_cancel_from_a_handler_is_not_lost() {
    let scheduler = Scheduler::new();
    let ping = EventKind::custom("ping");

    let handle = scheduler.spawn({
        let ping = ping.clone();
        move |ctx| async move {
            ctx.on(ping, |_event, ctx| {
                ctx.throw(ctx.id(), TaskError::Cancelled("from handler".to_string()))?;
                Ok(())
            });
            let resumption = ctx.suspend().await?;
            Ok::<_, TaskError>(matches!(resumption, Resumption::Drained))
        }
    });

    scheduler
        .resume(handle.id(), Event::new(ping, Payload::empty(), Origin::Kernel))
        .unwrap();

    assert_eq!(handle.error(), Some(TaskError::Cancelled("from handler".to_string())));
}

#[test]
fn test_sleep_wakes_on_expiry() {
    let scheduler = Scheduler::new();

    let handle = scheduler.spawn(|ctx| async move {
        ctx.sleep(Duration::from_millis(20)).await?;
        Ok::<_, TaskError>("woke")
    });

    assert!(scheduler.next_deadline().is_some());
    assert_eq!(scheduler.expire_timeouts(), 0);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(scheduler.expire_timeouts(), 1);
    assert_eq!(handle.value::<&str>(), Some("woke"));
}

#[test]
fn test_garbage_collection_keeps_pending_tasks() {
    let scheduler = Scheduler::new();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            scheduler.spawn(|ctx| async move {
                ctx.suspend().await?;
                Ok::<_, TaskError>(())
            })
        })
        .collect();

    scheduler.resume(handles[0].id(), resume_event()).unwrap();
    scheduler.resume(handles[1].id(), resume_event()).unwrap();
    scheduler.collect_garbage();

    assert_eq!(scheduler.len(), 1);
    assert!(scheduler.contains(handles[2].id()));
}
