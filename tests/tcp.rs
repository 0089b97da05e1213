use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use corio::net;

mod util;
use util::init;

#[test]
fn echo_roundtrip() {
    init();

    let server_done = Arc::new(AtomicBool::new(false));
    let client_done = Arc::new(AtomicBool::new(false));
    let server_flag = Arc::clone(&server_done);
    let client_flag = Arc::clone(&client_done);

    corio::run(move |lp| {
        let mut listener = net::listen("127.0.0.1", 0, 16).unwrap();
        let port = listener.port().unwrap();

        let client_flag = Arc::clone(&client_flag);
        lp.post(move |lp| {
            let mut stream = net::connect("127.0.0.1", port, 1_000).unwrap();

            assert_eq!(stream.write(b"PING"), 4);

            let mut reply = [0u8; 4];
            assert_eq!(stream.read(&mut reply, true), 4);
            assert_eq!(&reply, b"PING");

            assert_eq!(stream.info().read.bytes, 4);
            assert_eq!(stream.info().write.bytes, 4);

            stream.close().unwrap();
            client_flag.store(true, Ordering::SeqCst);
            lp.stop();
        })
        .unwrap();

        let mut peer = listener.accept().unwrap();

        let mut buffer = [0u8; 1024];
        let n = peer.read(&mut buffer, false);
        assert_eq!(n, 4);
        assert_eq!(peer.write(&buffer[..n]), 4);

        assert_eq!(peer.info().read.bytes, 4);
        assert_eq!(peer.info().write.bytes, 4);

        peer.close().unwrap();
        listener.shutdown().unwrap();
        server_flag.store(true, Ordering::SeqCst);
    })
    .unwrap();

    assert!(server_done.load(Ordering::SeqCst));
    assert!(client_done.load(Ordering::SeqCst));
}

#[test]
fn connect_times_out_against_a_black_hole() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let started = Instant::now();
        // 192.0.2.0/24 is TEST-NET-1; nothing answers there.
        let err = net::connect("192.0.2.1", 1, 100).unwrap_err();
        let elapsed = started.elapsed();

        match err.raw_os_error() {
            Some(code) if code == libc::ETIMEDOUT => {
                assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
                assert!(elapsed <= Duration::from_millis(100 + 150), "{:?}", elapsed);
            }
            // Some CI networks reject TEST-NET outright instead of
            // black-holing it.
            Some(code) if code == libc::ENETUNREACH || code == libc::EHOSTUNREACH => {}
            other => panic!("unexpected connect outcome: {:?}", other),
        }

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn read_timeout_fires_and_is_absorbing() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let mut listener = net::listen("127.0.0.1", 0, 4).unwrap();
        let port = listener.port().unwrap();

        let flag = Arc::clone(&flag);
        lp.post(move |lp| {
            let mut stream = net::connect("127.0.0.1", port, 1_000).unwrap();
            stream.set_read_timeout(100);

            let started = Instant::now();
            let mut buffer = [0u8; 64];
            let n = stream.read(&mut buffer, false);
            let elapsed = started.elapsed();

            assert_eq!(n, 0);
            assert!(stream.info().status.read_timeout);
            assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
            assert!(elapsed <= Duration::from_millis(100 + 150), "{:?}", elapsed);

            // Terminal status is absorbing: no more reads, instantly.
            let started = Instant::now();
            assert_eq!(stream.read(&mut buffer, false), 0);
            assert!(started.elapsed() < Duration::from_millis(50));

            stream.close().unwrap();
            flag.store(true, Ordering::SeqCst);
            lp.stop();
        })
        .unwrap();

        // Accept the peer and keep the connection silent until shutdown.
        let peer = listener.accept().unwrap();
        let _ = corio::sleep(60_000);
        drop(peer);
        let _ = listener.shutdown();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn accept_after_shutdown_is_cancelled() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let listener = net::listen("127.0.0.1", 0, 4).unwrap();
        listener.shutdown().unwrap();

        // The slot is gone with the listener; a fresh listen still works.
        let mut replacement = net::listen("127.0.0.1", 0, 4).unwrap();
        let port = replacement.port().unwrap();

        lp.post(move |_| {
            let stream = net::connect("127.0.0.1", port, 1_000).unwrap();
            // Hold the connection open until the acceptor saw it.
            let _ = stream;
        })
        .unwrap();

        let stream = replacement.accept().unwrap();
        drop(stream);
        replacement.shutdown().unwrap();

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}
