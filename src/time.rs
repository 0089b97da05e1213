use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on the process-wide monotonic clock all loops share.
/// Deadlines are absolute values of this clock; it starts at 1 so 0 stays
/// free as the "no deadline" sentinel.
pub(crate) fn now_ms() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_millis() as u64 + 1
}
