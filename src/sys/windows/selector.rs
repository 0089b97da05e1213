use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ABANDONED_WAIT_0, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

/// Completion key reserved for wakeup posts. Every other association
/// carries the address of a dispatch record, which is never null.
pub(crate) const WAKER_TOKEN: u64 = 0;

// Interest masks exist for signature parity with the readiness backend; a
// completion port has nothing to arm.
pub(crate) const INTEREST_BASE: u32 = 0;
pub(crate) const INTEREST_READ: u32 = 1;
pub(crate) const INTEREST_WRITE: u32 = 2;

/// One dequeued completion packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub(crate) key: u64,
    pub(crate) overlapped: *mut OVERLAPPED,
    pub(crate) bytes: u32,
    pub(crate) error: u32,
}

pub(crate) type Events = Vec<Event>;

/// Completion backend of a loop: one I/O completion port, drained one
/// packet per poll step.
#[derive(Debug)]
pub(crate) struct Selector {
    port: HANDLE,
}

unsafe impl Send for Selector {}
unsafe impl Sync for Selector {}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(Selector { port })
    }

    pub(crate) fn port(&self) -> HANDLE {
        self.port
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<u64>) -> io::Result<()> {
        let timeout = timeout
            .map(|ms| ms.min(u32::MAX as u64 - 1) as u32)
            .unwrap_or(u32::MAX); // INFINITE

        events.clear();

        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

        let ok = unsafe {
            GetQueuedCompletionStatus(self.port, &mut bytes, &mut key, &mut overlapped, timeout)
        };

        if ok == 0 {
            let error = unsafe { GetLastError() };
            if overlapped.is_null() {
                // No packet: timeout or a dead port.
                if error == WAIT_TIMEOUT {
                    return Ok(());
                }
                if error == ERROR_ABANDONED_WAIT_0 {
                    return Err(io::Error::from_raw_os_error(error as i32));
                }
                return Err(io::Error::from_raw_os_error(error as i32));
            }

            // A packet for a failed operation still dispatches; the error
            // travels with it.
            events.push(Event {
                key: key as u64,
                overlapped,
                bytes,
                error,
            });
            return Ok(());
        }

        events.push(Event {
            key: key as u64,
            overlapped,
            bytes,
            error: 0,
        });
        Ok(())
    }

    /// Associate a handle with the port under `token`. There is no
    /// dissociation; the handle simply closes.
    pub(crate) fn register(&self, handle: HANDLE, token: u64, _interests: u32) -> io::Result<()> {
        let port = unsafe {
            CreateIoCompletionPort(handle, self.port, token as usize, 0)
        };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Completion ports have no interest to change; operations are armed by
    /// posting overlapped I/O.
    pub(crate) fn rearm(&self, _handle: HANDLE, _token: u64, _interests: u32) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn deregister(&self, _handle: HANDLE) -> io::Result<()> {
        Ok(())
    }

    /// The wakeup primitive posts straight to the port; nothing to wire up.
    pub(crate) fn register_waker(&self, waker: &super::Waker) -> io::Result<()> {
        waker.bind(self.port);
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}

pub(crate) mod event {
    use super::Event;

    pub(crate) fn token(event: &Event) -> u64 {
        event.key
    }

    pub(crate) fn is_readable(_event: &Event) -> bool {
        // Completion packets carry the operation, not a direction mask; the
        // processors match on the overlapped pointer instead.
        false
    }

    pub(crate) fn is_writable(_event: &Event) -> bool {
        false
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        event.error != 0
    }

    pub(crate) fn is_hangup(_event: &Event) -> bool {
        false
    }

    pub(crate) fn is_peer_hangup(_event: &Event) -> bool {
        false
    }
}
