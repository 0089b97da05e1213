use std::cell::Cell;
use std::ffi::c_void;
use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{GetLastError, SetLastError};
use windows_sys::Win32::System::Threading::{
    ConvertThreadToFiberEx, CreateFiberEx, DeleteFiber, IsThreadAFiber, SwitchToFiber,
};

use super::stack::Stack;

/// Saved CPU state of a task, backed by a native fiber: the OS keeps the
/// registers, we keep the fiber handle.
pub(crate) struct Context {
    fiber: Cell<*mut c_void>,
    entry: Cell<Option<extern "C" fn()>>,
    owned: Cell<bool>,
}

unsafe extern "system" fn fiber_entry(parameter: *mut c_void) {
    let context = &*(parameter as *const Context);
    let entry = context
        .entry
        .get()
        .expect("fiber started without an entry");
    // The entry ends in an explicit switch; a fiber routine must never
    // return, that exits the thread.
    entry();
}

impl Context {
    pub(crate) fn new() -> Context {
        Context {
            fiber: Cell::new(ptr::null_mut()),
            entry: Cell::new(None),
            owned: Cell::new(false),
        }
    }

    /// Create the fiber that will run `entry` when first switched to. The
    /// committed/reserved split (and its guard pages) comes from `stack`.
    pub(crate) unsafe fn prepare(
        &self,
        stack: &Stack,
        entry: extern "C" fn(),
    ) -> io::Result<()> {
        self.entry.set(Some(entry));

        let fiber = CreateFiberEx(
            stack.commit(),
            stack.reserve(),
            0,
            Some(fiber_entry),
            self as *const Context as *mut c_void,
        );
        if fiber.is_null() {
            return Err(io::Error::last_os_error());
        }

        self.fiber.set(fiber);
        self.owned.set(true);
        Ok(())
    }

    /// Save the current state into `self` and continue in `to`.
    pub(crate) unsafe fn swap(&self, to: &Context) {
        if self.fiber.get().is_null() {
            // First switch away from a plain thread (a loop's main task):
            // adopt it as a fiber so there is something to switch back to.
            // Each loop thread passes through here exactly once.
            debug_assert!(IsThreadAFiber() == 0);
            self.fiber.set(ConvertThreadToFiberEx(ptr::null(), 0));
        }

        SwitchToFiber(to.fiber.get());
    }

    /// Continue in `to` without saving the current state. Never returns.
    pub(crate) unsafe fn set(to: &Context) -> ! {
        SwitchToFiber(to.fiber.get());
        unreachable!("switched-away fiber resumed through set");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let fiber = self.fiber.get();
        if self.owned.get() && !fiber.is_null() {
            unsafe { DeleteFiber(fiber) };
        }
    }
}

pub(crate) fn errno() -> i32 {
    unsafe { GetLastError() as i32 }
}

pub(crate) fn set_errno(value: i32) {
    unsafe { SetLastError(value as u32) }
}
