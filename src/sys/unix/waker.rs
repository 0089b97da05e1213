use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Cross-thread wakeup channel of a loop: an `eventfd` counter the loop
/// keeps registered under the reserved token. Producers add to the counter;
/// the loop drains it when the readiness shows up and then turns to its
/// inbox for the actual work.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        // SAFETY: eventfd just handed us sole ownership of this descriptor.
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let wrote = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };

        if wrote != mem::size_of::<u64>() as isize {
            let err = io::Error::last_os_error();
            // A saturated counter refuses the add, but saturation means a
            // wakeup is already pending and the loop will drain it; there
            // is nothing further to signal.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }

        Ok(())
    }

    /// Clear the counter after the loop observed the wakeup event.
    pub(crate) fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Wakeup primitive for the event dispatcher thread: the same counter, but
/// blocking, so `wait` parks the dispatcher until a caller rings it.
#[derive(Debug)]
pub(crate) struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub(crate) fn new() -> io::Result<Notifier> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC))?;

        // SAFETY: eventfd just handed us sole ownership of this descriptor.
        Ok(Notifier {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        let wrote = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };

        if wrote != mem::size_of::<u64>() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until rung. An error means the counter is gone, which is the
    /// dispatcher's signal to exit.
    pub(crate) fn wait(&self) -> io::Result<()> {
        let mut value: u64 = 0;
        let read = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };

        if read != mem::size_of::<u64>() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
