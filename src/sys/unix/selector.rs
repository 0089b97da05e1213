use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::slice;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

/// Token value reserved for the loop's own wakeup eventfd. Every other
/// registration carries the address of a dispatch record, which is never
/// null.
pub(crate) const WAKER_TOKEN: u64 = 0;

/// Interest always kept armed for a registered handle; error and hangup
/// conditions are reported even while no operation is in flight.
pub(crate) const INTEREST_BASE: u32 = (EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32;
pub(crate) const INTEREST_READ: u32 = (EPOLLIN | EPOLLPRI) as u32;
pub(crate) const INTEREST_WRITE: u32 = EPOLLOUT as u32;

/// Readiness backend of a loop, one epoll instance per loop.
///
/// Registrations are level-triggered: an operation arms its direction with
/// `rearm` before suspending and disarms it the same way afterwards, so a
/// ready-but-unclaimed handle keeps reporting until the owning task
/// consumes it.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        // SAFETY: freshly created and owned by nobody else yet.
        Ok(Selector {
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
        })
    }

    /// Collect ready events into `events`, waiting at most `timeout`
    /// milliseconds, indefinitely with no timeout. The deadline comes
    /// straight from the loop's timer sets.
    pub(crate) fn select(&self, events: &mut Events, timeout: Option<u64>) -> io::Result<()> {
        let timeout = match timeout {
            Some(ms) => ms.min(libc::c_int::MAX as u64) as libc::c_int,
            None => -1,
        };

        events.count = 0;

        let count = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.list.as_mut_ptr(),
            events.list.len() as libc::c_int,
            timeout,
        ))?;
        events.count = count as usize;

        Ok(())
    }

    fn control(&self, op: libc::c_int, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests,
            u64: token,
        };

        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        self.control(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    /// Change the armed interest of an already registered handle. This is
    /// how operations toggle their direction on and off around a
    /// suspension.
    pub(crate) fn rearm(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        self.control(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // The event argument is ignored for a delete; a dummy keeps the
        // call shape uniform.
        self.control(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Wire the loop's wakeup primitive into the selector under the
    /// reserved `WAKER_TOKEN`, read interest permanently armed.
    pub(crate) fn register_waker(&self, waker: &super::Waker) -> io::Result<()> {
        self.register(
            waker.as_raw_fd(),
            WAKER_TOKEN,
            INTEREST_BASE | INTEREST_READ,
        )
    }
}

pub(crate) type Event = libc::epoll_event;

/// Fixed-size batch of events filled by one poll; the capacity bounds how
/// many the kernel hands over per call.
pub(crate) struct Events {
    list: Box<[Event]>,
    count: usize,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Events {
        Events {
            list: vec![Event { events: 0, u64: 0 }; capacity].into_boxed_slice(),
            count: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn iter(&self) -> slice::Iter<'_, Event> {
        self.list[..self.count].iter()
    }
}

pub(crate) mod event {
    use super::Event;

    pub(crate) fn token(event: &Event) -> u64 {
        event.u64
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLIN) != 0
            || (event.events as libc::c_int & libc::EPOLLPRI) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLOUT) != 0
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLERR) != 0
    }

    pub(crate) fn is_hangup(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLHUP) != 0
    }

    pub(crate) fn is_peer_hangup(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLRDHUP) != 0
    }
}
