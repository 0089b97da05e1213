use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;

use super::stack::Stack;

/// Saved CPU state of a task, including instruction and stack pointers.
///
/// Backed by `ucontext(3)`. The get/make/swap/set quartet gives us stackful
/// coroutines without hand-written assembly; the kernel-visible signal mask
/// round-trip it implies is the price of staying on libc.
pub(crate) struct Context {
    inner: UnsafeCell<libc::ucontext_t>,
}

impl Context {
    pub(crate) fn new() -> Context {
        Context {
            // ucontext_t is plain old data as far as we are concerned; it is
            // fully (re)initialized by `getcontext` or an incoming swap.
            inner: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
        }
    }

    fn as_ptr(&self) -> *mut libc::ucontext_t {
        self.inner.get()
    }

    /// Initialize the context to enter `entry` on `stack` when first
    /// switched to.
    pub(crate) unsafe fn prepare(
        &self,
        stack: &Stack,
        entry: extern "C" fn(),
    ) -> io::Result<()> {
        let ucp = self.as_ptr();

        if libc::getcontext(ucp) == -1 {
            return Err(io::Error::last_os_error());
        }

        (*ucp).uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        (*ucp).uc_stack.ss_size = stack.len();
        (*ucp).uc_stack.ss_flags = 0;
        (*ucp).uc_link = std::ptr::null_mut();

        libc::makecontext(ucp, entry, 0);

        Ok(())
    }

    /// Save the current CPU state into `self` and continue in `to`.
    pub(crate) unsafe fn swap(&self, to: &Context) {
        libc::swapcontext(self.as_ptr(), to.as_ptr());
    }

    /// Continue in `to` without saving the current state. Never returns.
    pub(crate) unsafe fn set(to: &Context) -> ! {
        libc::setcontext(to.as_ptr());
        unreachable!("setcontext returned");
    }
}

pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub(crate) fn set_errno(value: i32) {
    unsafe { *libc::__errno_location() = value }
}
