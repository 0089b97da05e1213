// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// A per-process unique path under the system temp directory.
pub fn temp_path(name: &str) -> String {
    let mut path = std::env::temp_dir();
    path.push(format!("corio-test-{}-{}", std::process::id(), name));
    path.to_string_lossy().into_owned()
}

/// Open descriptor count, for leak assertions.
#[cfg(target_os = "linux")]
pub fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").map(|d| d.count()).unwrap_or(0)
}
