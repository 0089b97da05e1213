use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Task stack: an anonymous mapping with a `PROT_NONE` guard page at the low
/// end, so running off the stack faults deterministically instead of
/// scribbling over a neighbouring allocation.
///
/// `MAP_NORESERVE` keeps the committed footprint small; pages are faulted in
/// on demand as the stack grows down towards the guard.
pub(crate) struct Stack {
    base: *mut u8,
    size: usize,
    page: usize,
}

// Stacks move between threads exactly once: a task created by a cross-thread
// post carries its stack to the loop that executes it.
unsafe impl Send for Stack {}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

impl Stack {
    pub(crate) fn new(size: usize) -> io::Result<Stack> {
        let page = page_size();

        // Room for the guard page plus at least two usable pages.
        let size = std::cmp::max(size, 3 * page);
        let size = (size + page - 1) & !(page - 1);

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = base as *mut u8;

        if unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base as *mut libc::c_void, size) };
            return Err(err);
        }

        Ok(Stack { base, size, page })
    }

    /// Lowest usable address, just above the guard page.
    pub(crate) fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.page) }
    }

    /// Usable length, excluding the guard page.
    pub(crate) fn len(&self) -> usize {
        self.size - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
    }
}
