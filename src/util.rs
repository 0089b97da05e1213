use std::io;

/// Type-erased pointer that may be handed to another thread.
///
/// The receiving side is responsible for upholding whatever aliasing and
/// lifetime rules apply to the pointee; this wrapper only silences the
/// auto-trait check for raw pointers.
#[derive(Clone, Copy)]
pub(crate) struct SendPtr(pub(crate) *mut ());

unsafe impl Send for SendPtr {}

pub(crate) fn not_on_loop() -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        "operation requires a task running on a loop",
    )
}
