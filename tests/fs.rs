use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corio::fs::{self, FileOptions};
use corio::stream;

mod util;
use util::{init, temp_path};

const MEBIBYTE: usize = 1024 * 1024;

#[test]
fn file_copy_via_pipe() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let src_path = temp_path("pipe-src.bin");
        let dst_path = temp_path("pipe-dst.bin");

        // Lay down exactly 1 MiB of the index pattern.
        let payload: Vec<u8> = (0..MEBIBYTE).map(|i| (i & 0xff) as u8).collect();
        {
            let mut src = fs::open(&src_path, FileOptions::CREATE | FileOptions::TRUNCATE)
                .unwrap();
            assert_eq!(src.write(&payload), payload.len());
            src.close().unwrap();
        }

        let mut src = fs::open(&src_path, FileOptions::NONE).unwrap();
        let mut dst = fs::open(&dst_path, FileOptions::CREATE | FileOptions::TRUNCATE)
            .unwrap();

        let mut transferred = 0;
        stream::pipe(&mut src, &mut dst, 8192, &mut transferred).unwrap();
        assert_eq!(transferred, MEBIBYTE as u64);

        src.close().unwrap();
        dst.close().unwrap();

        // Byte-for-byte verification of the copy.
        let mut copy = fs::open(&dst_path, FileOptions::NONE).unwrap();
        let mut contents = vec![0u8; MEBIBYTE + 1];
        let n = copy.read(&mut contents, true);
        assert_eq!(n, MEBIBYTE);
        assert!(copy.info().status.eof);
        assert_eq!(&contents[..n], &payload[..]);
        copy.close().unwrap();

        fs::delete_file(&src_path).unwrap();
        fs::delete_file(&dst_path).unwrap();

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn append_continues_at_the_end() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let path = temp_path("append.txt");

        let mut file = fs::open(&path, FileOptions::CREATE | FileOptions::TRUNCATE).unwrap();
        assert_eq!(file.write(b"first,"), 6);
        file.close().unwrap();

        let mut file = fs::open(&path, FileOptions::APPEND).unwrap();
        assert_eq!(file.info().write.position, 6);
        assert_eq!(file.write(b"second"), 6);
        file.close().unwrap();

        let mut file = fs::open(&path, FileOptions::NONE).unwrap();
        let mut contents = [0u8; 32];
        let n = file.read(&mut contents, true);
        assert_eq!(&contents[..n], b"first,second");
        file.close().unwrap();

        fs::delete_file(&path).unwrap();

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn path_info_reports_size_and_kind() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let path = temp_path("stat.bin");

        let mut file = fs::open(&path, FileOptions::CREATE | FileOptions::TRUNCATE).unwrap();
        assert_eq!(file.write(&[7u8; 300]), 300);
        file.close().unwrap();

        let info = fs::path_info(&path).unwrap();
        assert!(info.is_file);
        assert_eq!(info.size, 300);
        assert!(info.time_modified > 0);

        fs::delete_file(&path).unwrap();
        assert!(fs::path_info(&path).is_err());

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn directory_create_enumerate_delete() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let dir = temp_path("walk-dir");
        fs::create_dir(&dir).unwrap();

        for name in ["one", "two", "three"] {
            fs::create_file(&format!("{}/{}", dir, name)).unwrap();
        }

        let mut walker = fs::DirectoryEnum::open(&dir).unwrap();
        let mut names = Vec::new();
        while let Some((name, info)) = walker.next_entry().unwrap() {
            assert!(info.is_file);
            names.push(name);
        }
        drop(walker);

        names.sort();
        assert_eq!(names, vec!["one", "three", "two"]);

        // Not empty, so the plain delete refuses.
        assert!(fs::delete_dir(&dir, false).is_err());
        fs::delete_dir(&dir, true).unwrap();
        assert!(fs::path_info(&dir).is_err());

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn directory_listen_is_not_implemented() {
    init();

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    corio::run(move |lp| {
        let err = fs::listen_dir("/tmp", 100).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));

        flag.store(true, Ordering::SeqCst);
        lp.stop();
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
}
