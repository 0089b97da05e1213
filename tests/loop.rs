use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use corio::{Loop, LoopRef};

mod util;
use util::{assert_send, assert_sync, init};

#[test]
fn is_send_and_sync() {
    assert_send::<LoopRef>();
    assert_sync::<LoopRef>();
}

#[test]
fn sleep_accuracy() {
    init();

    let slept = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&slept);

    corio::run(move |lp| {
        let started = Instant::now();
        corio::sleep(250).unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(250), "{:?}", elapsed);
        // Allow the poll granularity slack of an unloaded CI machine.
        assert!(elapsed <= Duration::from_millis(250 + 100), "{:?}", elapsed);

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(slept.load(Ordering::SeqCst));
}

#[test]
fn idle_fires_on_quiet_loop() {
    init();

    let idled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&idled);

    corio::run(move |lp| {
        lp.idle(100).unwrap();
        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(idled.load(Ordering::SeqCst));
}

#[test]
fn stopped_loop_cancels_sleepers() {
    init();

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);

    corio::run(move |lp| {
        let flag = Arc::clone(&flag);
        lp.post(move |_| {
            let err = corio::sleep(60_000).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ECANCELED));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        corio::sleep(50).unwrap();
        lp.stop();
    })
    .unwrap();

    assert!(cancelled.load(Ordering::SeqCst));
}

#[test]
fn cross_thread_posts_keep_fifo_order() {
    init();

    let lp = Loop::start().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel();

    for label in 1..=3u32 {
        let order = Arc::clone(&order);
        lp.post(move |_| {
            order.lock().unwrap().push(label);
        })
        .unwrap();
    }

    lp.post(move |_| {
        tx.send(()).unwrap();
    })
    .unwrap();

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);

    lp.stop();
}

#[test]
fn exec_runs_on_the_target_loop() {
    init();

    let verified = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&verified);

    corio::run(move |lp| {
        let other = Loop::start().unwrap();
        let caller_thread = thread::current().id();

        let observed = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&observed);
        other
            .exec(move |_| {
                *seen.lock().unwrap() = Some(thread::current().id());
            })
            .unwrap();

        // exec returned, so the closure must already have run, elsewhere.
        let there = observed.lock().unwrap().expect("exec closure did not run");
        assert_ne!(there, caller_thread);

        other.stop();
        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(verified.load(Ordering::SeqCst));
}

#[test]
fn post_to_own_loop_is_asynchronous() {
    init();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);

    corio::run(move |lp| {
        let inner = Arc::clone(&seen);
        lp.post(move |lp| {
            inner.lock().unwrap().push("posted");
            lp.stop();
        })
        .unwrap();

        // A self-post never runs inline; we get here first.
        seen.lock().unwrap().push("poster");
        // The posted task stops the loop while we sleep, so the sleep is
        // cancelled; that is expected.
        let _ = corio::sleep(1_000);
    })
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["poster", "posted"]);
}

#[cfg(unix)]
#[test]
fn suspension_preserves_errno() {
    init();

    let checked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&checked);

    corio::run(move |lp| {
        unsafe { *libc::__errno_location() = 42 };
        corio::sleep(50).unwrap();
        assert_eq!(unsafe { *libc::__errno_location() }, 42);

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(checked.load(Ordering::SeqCst));
}
