use std::cell::Cell;
use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject, INFINITE};
use windows_sys::Win32::System::IO::PostQueuedCompletionStatus;

use super::selector::WAKER_TOKEN;

/// Cross-thread loop wakeup: a zero-byte completion posted under the
/// reserved key. Bound to its port by `Selector::register_waker`.
#[derive(Debug)]
pub(crate) struct Waker {
    port: Cell<HANDLE>,
}

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        Ok(Waker {
            port: Cell::new(ptr::null_mut()),
        })
    }

    pub(crate) fn bind(&self, port: HANDLE) {
        self.port.set(port);
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let posted = unsafe {
            PostQueuedCompletionStatus(self.port.get(), 0, WAKER_TOKEN as usize, ptr::null_mut())
        };
        if posted == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Completion-port wakeups are consumed by dequeueing; nothing pends.
    pub(crate) fn drain(&self) {}
}

/// Blocking wakeup primitive for the event dispatcher thread: an
/// auto-reset event.
#[derive(Debug)]
pub(crate) struct Notifier {
    event: HANDLE,
}

unsafe impl Send for Notifier {}
unsafe impl Sync for Notifier {}

impl Notifier {
    pub(crate) fn new() -> io::Result<Notifier> {
        let event = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Notifier { event })
    }

    pub(crate) fn notify(&self) -> io::Result<()> {
        if unsafe { SetEvent(self.event) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until notified. Returns `Err` once the handle is gone, which
    /// is the dispatcher's signal to exit.
    pub(crate) fn wait(&self) -> io::Result<()> {
        match unsafe { WaitForSingleObject(self.event, INFINITE) } {
            WAIT_OBJECT_0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.event) };
    }
}
