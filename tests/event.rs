use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use corio::Event;

mod util;
use util::init;

#[test]
fn notify_wakes_the_waiter_after_the_notifier_returns() {
    init();

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);

    corio::run(move |lp| {
        let event = Event::create();

        {
            let event = event.clone();
            let order = Arc::clone(&seen);
            lp.post(move |_| {
                event.wait().unwrap();
                order.lock().unwrap().push("woken");
            })
            .unwrap();
        }

        {
            let event = event.clone();
            let order = Arc::clone(&seen);
            lp.post(move |lp| {
                // Give the wait a head start to the dispatcher.
                corio::sleep(50).unwrap();

                event.notify().unwrap();
                order.lock().unwrap().push("notified");

                // Let the waiter run, then wind down.
                corio::sleep(50).unwrap();
                lp.stop();
            })
            .unwrap();
        }
    })
    .unwrap();

    // The notifier returns from notify before the waiter resumes.
    assert_eq!(*order.lock().unwrap(), vec!["notified", "woken"]);
}

#[test]
fn delete_cancels_waiters() {
    init();

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);

    corio::run(move |lp| {
        let event = Event::create();

        {
            let event = event.clone();
            let flag = Arc::clone(&flag);
            lp.post(move |_| {
                let err = event.wait().unwrap_err();
                assert_eq!(err.raw_os_error(), Some(libc::ECANCELED));
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        }

        lp.post(move |lp| {
            corio::sleep(50).unwrap();
            event.delete().unwrap();

            corio::sleep(50).unwrap();
            lp.stop();
        })
        .unwrap();
    })
    .unwrap();

    assert!(cancelled.load(Ordering::SeqCst));
}

#[test]
fn operations_on_a_deleted_event_are_cancelled() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let event = Event::create();
        let stale = event.clone();

        event.delete().unwrap();

        let err = stale.wait().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECANCELED));
        let err = stale.notify().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECANCELED));

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn notify_reaches_waiters_on_another_loop() {
    init();

    let woken = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&woken);

    corio::run(move |lp| {
        let event = Event::create();
        let other = corio::Loop::start().unwrap();

        {
            let event = event.clone();
            let flag = Arc::clone(&flag);
            other
                .post(move |_| {
                    event.wait().unwrap();
                    flag.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }

        // Let the remote waiter reach the dispatcher first.
        corio::sleep(100).unwrap();
        event.notify().unwrap();
        corio::sleep(100).unwrap();

        other.stop();
        lp.stop();
    })
    .unwrap();

    assert!(woken.load(Ordering::SeqCst));
}
