use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::RngCore;

use corio::net;
use corio::stream::{Filter, NextFilter, Stream};

mod util;
use util::init;

/// XORs every byte with a key, both directions.
struct Scramble {
    key: u8,
}

impl Filter for Scramble {
    fn on_read(&mut self, next: &mut NextFilter<'_>, buffer: &mut [u8]) -> usize {
        let n = next.read(buffer);
        for byte in &mut buffer[..n] {
            *byte ^= self.key;
        }
        n
    }

    fn on_write(&mut self, next: &mut NextFilter<'_>, buffer: &[u8]) -> usize {
        let scrambled: Vec<u8> = buffer.iter().map(|b| b ^ self.key).collect();
        next.write(&scrambled)
    }
}

#[test]
fn filters_transform_tcp_traffic_end_to_end() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let mut listener = net::listen("127.0.0.1", 0, 4).unwrap();
        let port = listener.port().unwrap();

        let flag = Arc::clone(&flag);
        lp.post(move |lp| {
            let mut stream = net::connect("127.0.0.1", port, 1_000).unwrap();
            stream.attach(Box::new(Scramble { key: 0x5a }));

            assert_eq!(stream.write(b"secret"), 6);

            let mut reply = [0u8; 6];
            assert_eq!(stream.read(&mut reply, true), 6);
            assert_eq!(&reply, b"SECRET");

            stream.close().unwrap();
            flag.store(true, Ordering::SeqCst);
            lp.stop();
        })
        .unwrap();

        let mut peer = listener.accept().unwrap();

        // The peer has no filter, so the wire bytes are scrambled.
        let mut wire = [0u8; 6];
        assert_eq!(peer.read(&mut wire, true), 6);
        assert_ne!(&wire, b"secret");

        let plain: Vec<u8> = wire.iter().map(|b| b ^ 0x5a).collect();
        assert_eq!(&plain, b"secret");

        // Uppercase it and scramble it back for the client's filter.
        let reply: Vec<u8> = plain
            .iter()
            .map(|b| (b.to_ascii_uppercase()) ^ 0x5a)
            .collect();
        assert_eq!(peer.write(&reply), 6);

        peer.close().unwrap();
        listener.shutdown().unwrap();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn unread_feeds_the_next_tcp_read() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let mut listener = net::listen("127.0.0.1", 0, 4).unwrap();
        let port = listener.port().unwrap();

        lp.post(move |_| {
            let mut stream = net::connect("127.0.0.1", port, 1_000).unwrap();
            assert_eq!(stream.write(b"payload"), 7);
            stream.close().unwrap();
        })
        .unwrap();

        let mut peer = listener.accept().unwrap();

        let mut header = [0u8; 3];
        assert_eq!(peer.read(&mut header, true), 3);
        assert_eq!(&header, b"pay");

        // Change of mind: push the header back and take the whole thing.
        assert_eq!(peer.unread(&header), 3);

        let mut full = [0u8; 7];
        assert_eq!(peer.read(&mut full, true), 7);
        assert_eq!(&full, b"payload");

        peer.close().unwrap();
        listener.shutdown().unwrap();

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn memory_stream_bridges_tcp_via_pipe() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let mut listener = net::listen("127.0.0.1", 0, 4).unwrap();
        let port = listener.port().unwrap();

        // A payload well past the socket buffers, so the writer has to
        // suspend and the reader drains in many rounds.
        let mut payload = vec![0u8; 192 * 1024];
        rand::rng().fill_bytes(&mut payload);
        let sent = payload.clone();

        lp.post(move |_| {
            let mut stream = net::connect("127.0.0.1", port, 1_000).unwrap();
            assert_eq!(stream.write(&sent), sent.len());
            stream.close().unwrap();
        })
        .unwrap();

        let mut peer = listener.accept().unwrap();
        let mut spool = Stream::memory();

        // Drain the socket into the memory stream until the peer closes.
        let mut transferred = 0;
        corio::stream::pipe(&mut peer, &mut spool, 4096, &mut transferred).unwrap();
        assert_eq!(transferred, payload.len() as u64);

        let mut contents = vec![0u8; payload.len()];
        assert_eq!(spool.read(&mut contents, true), payload.len());
        assert_eq!(contents, payload);

        peer.close().unwrap();
        listener.shutdown().unwrap();

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}
