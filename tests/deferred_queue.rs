//! Deferred-queue scenarios: callbacks submitted from unsafe contexts run
//! on the loop thread, FIFO, exactly once, before the next blocking wait.

use evbridge::{BlockingPolicy, CallbackArgs, EventLoop, LabReactor, LoopConfig, Revents};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

fn lab_loop() -> (EventLoop, Arc<LabReactor>) {
    let reactor = Arc::new(LabReactor::new());
    let event_loop = EventLoop::new(reactor.clone()).expect("loop construction");
    (event_loop, reactor)
}

#[test]
fn simulated_signal_context_enqueues_run_fifo_on_loop_thread() {
    let (event_loop, _reactor) = lab_loop();
    let handle = event_loop.deferred_handle();
    let log: Arc<Mutex<Vec<(String, thread::ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));

    // A foreign thread stands in for the signal context: it may only
    // record that work exists, never execute it.
    let producer_log = Arc::clone(&log);
    let producer = thread::spawn(move || {
        let first_log = Arc::clone(&producer_log);
        handle.enqueue(
            None,
            move |_| {
                first_log
                    .lock()
                    .unwrap()
                    .push(("first".to_string(), thread::current().id()));
                Ok(())
            },
            CallbackArgs::new(),
            Revents::NONE,
        );
        let second_log = Arc::clone(&producer_log);
        handle.enqueue(
            None,
            move |_| {
                second_log
                    .lock()
                    .unwrap()
                    .push(("second".to_string(), thread::current().id()));
                Ok(())
            },
            CallbackArgs::new(),
            Revents::NONE,
        );
    });
    producer.join().expect("producer thread");

    // Nothing ran in the producing context.
    assert!(log.lock().unwrap().is_empty());

    // One iteration drains both, in submission order, on this thread.
    event_loop.run_iteration(BlockingPolicy::Once).unwrap();
    let entries = log.lock().unwrap().clone();
    let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["first", "second"]);
    for (_, tid) in &entries {
        assert_eq!(*tid, thread::current().id());
    }

    // Exactly once: another iteration re-runs nothing.
    event_loop.run_iteration(BlockingPolicy::Once).unwrap();
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn entries_enqueued_by_event_callbacks_drain_in_the_same_tick() {
    let (event_loop, reactor) = lab_loop();
    let ran = Arc::new(AtomicU32::new(0));

    let io = event_loop.io(Revents::READ);
    let deferred = event_loop.deferred_handle();
    let counter = Arc::clone(&ran);
    io.start(
        move |_| {
            let inner = Arc::clone(&counter);
            deferred.enqueue(
                None,
                move |_| {
                    inner.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                CallbackArgs::new(),
                Revents::NONE,
            );
            Ok(())
        },
        CallbackArgs::new(),
    )
    .unwrap();

    reactor.fire(io.id(), Revents::READ);
    event_loop.run_iteration(BlockingPolicy::Once).unwrap();

    // The drain hook runs after the tick's event callbacks and before the
    // loop would block for the next tick.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn drain_budget_bounds_one_tick_and_rewakes() {
    let reactor = Arc::new(LabReactor::new());
    let config = LoopConfig::default().with_drain_budget(2);
    let event_loop = EventLoop::with_config(reactor.clone(), config).expect("loop construction");
    let ran = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let counter = Arc::clone(&ran);
        event_loop.enqueue_deferred(
            None,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            CallbackArgs::new(),
            Revents::NONE,
        );
    }

    event_loop.run_iteration(BlockingPolicy::Once).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    // The remainder must not sit out a blocking poll.
    assert!(reactor.wake_latched());

    event_loop.run_iteration(BlockingPolicy::Once).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    event_loop.run_iteration(BlockingPolicy::Once).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 5);
    assert!(!reactor.wake_latched());
}

#[test]
fn failing_deferred_entry_reports_and_drain_continues() {
    let (event_loop, _reactor) = lab_loop();
    let ran = Arc::new(AtomicU32::new(0));

    event_loop.enqueue_deferred(
        None,
        |_| Err(evbridge::CallbackError::new("deferred boom")),
        CallbackArgs::new(),
        Revents::NONE,
    );
    let counter = Arc::clone(&ran);
    event_loop.enqueue_deferred(
        None,
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        CallbackArgs::new(),
        Revents::NONE,
    );

    event_loop.run_iteration(BlockingPolicy::Once).unwrap();
    // The failure was routed, and the later entry still ran.
    assert_eq!(event_loop.error_reports(), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn deferred_entry_receives_substituted_revents() {
    let (event_loop, _reactor) = lab_loop();
    let seen = Arc::new(Mutex::new(None));

    let sink = Arc::clone(&seen);
    event_loop.enqueue_deferred(
        None,
        move |args| {
            *sink.lock().unwrap() = args.get(0).cloned();
            Ok(())
        },
        CallbackArgs::with_events(),
        Revents::CHILD,
    );
    event_loop.run_iteration(BlockingPolicy::Once).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        Some(evbridge::Arg::Revents(Revents::CHILD))
    );
}

#[test]
fn enqueue_wakes_a_waiting_reactor() {
    let (event_loop, reactor) = lab_loop();
    assert!(!reactor.wake_latched());
    event_loop.enqueue_deferred(None, |_| Ok(()), CallbackArgs::new(), Revents::NONE);
    assert!(reactor.wake_latched());
    event_loop.run_iteration(BlockingPolicy::Once).unwrap();
    assert!(!reactor.wake_latched());
}
