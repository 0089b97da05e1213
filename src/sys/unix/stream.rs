//! epoll-side stream operations: the readiness processors dispatched by the
//! loop and the suspending read/write primitives behind the operations
//! filter. File I/O runs `pread`/`pwrite` on the worker pool instead; see
//! the design notes.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Instant;

use log::trace;

use super::net::socket_error;
use super::selector::{event, INTEREST_BASE, INTEREST_READ, INTEREST_WRITE};
use crate::event_loop::Loop;
use crate::pool::{self, Work};
use crate::stream::fire_status;
use crate::stream::StreamInner;
use crate::task::{self, Task};
use crate::time;
use crate::timer::Moment;

pub(crate) const INVALID_HANDLE: RawFd = -1;

#[repr(C)]
struct TcpReadRequest {
    task: *mut Task,
    done: usize,
}

#[repr(C)]
struct TcpWriteRequest {
    task: *mut Task,
    offset: usize,
}

struct FileIoRequest {
    fd: RawFd,
    buffer: *mut u8,
    length: usize,
    offset: u64,
    done: usize,
    error: i32,
}

pub(crate) unsafe fn stream_attach(stream: *mut StreamInner, lp: &Loop) -> io::Result<()> {
    trace!("registering stream fd {} with selector", (*stream).fd);
    lp.selector.register(
        (*stream).fd,
        (*stream).reg.token(),
        INTEREST_BASE | (*stream).armed.get(),
    )
}

pub(crate) unsafe fn stream_deregister(stream: *mut StreamInner) -> io::Result<()> {
    let owner = (*stream).owner.get();
    if owner.is_null() {
        return Ok(());
    }

    trace!("deregistering stream fd {} from selector", (*stream).fd);
    (*owner).selector.deregister((*stream).fd)
}

unsafe fn arm(stream: *mut StreamInner, interest: u32) -> io::Result<()> {
    let owner = &*(*stream).owner.get();
    (*stream).armed.set((*stream).armed.get() | interest);
    owner.selector.rearm(
        (*stream).fd,
        (*stream).reg.token(),
        INTEREST_BASE | (*stream).armed.get(),
    )
}

unsafe fn disarm(stream: *mut StreamInner, interest: u32) {
    let owner = &*(*stream).owner.get();
    (*stream).armed.set((*stream).armed.get() & !interest);
    let _ = owner.selector.rearm(
        (*stream).fd,
        (*stream).reg.token(),
        INTEREST_BASE | (*stream).armed.get(),
    );
}

/// Readiness events for a connected TCP stream: classify failures into
/// status bits, then hand control to whichever operation is suspended.
pub(crate) unsafe fn tcp_processor(data: *mut (), event: &super::Event) {
    let stream = data as *mut StreamInner;

    if event::is_error(event) {
        (*stream).info.status.error = socket_error((*stream).fd);
        fire_status(stream);
    } else if event::is_hangup(event) {
        (*stream).info.status.closed = true;
        fire_status(stream);
    } else if event::is_peer_hangup(event) && !event::is_readable(event) {
        // A FIN while data is still queued stays readable; peer_closed is
        // only raised once there is nothing left to drain.
        (*stream).info.status.peer_closed = true;
        fire_status(stream);
    }

    let read_req = (*stream).read_req.get() as *mut TcpReadRequest;
    let write_req = (*stream).write_req.get() as *mut TcpWriteRequest;

    let mut task = ptr::null_mut();
    if event::is_readable(event) && !read_req.is_null() {
        task = (*read_req).task;
    } else if event::is_writable(event) && !write_req.is_null() {
        task = (*write_req).task;
    }

    // Status-only events wake whoever is parked so it can observe them.
    if task.is_null() && !read_req.is_null() {
        task = (*read_req).task;
    }
    if task.is_null() && !write_req.is_null() {
        task = (*write_req).task;
    }

    if !task.is_null() {
        task::resume(task);
    }
}

/// One logical TCP read: arm read interest, suspend until the processor
/// wakes us, then try the socket. `EAGAIN` readiness is spurious and we
/// simply suspend again. A configured read timeout is a moment in the
/// loop's timeout tree spanning the suspension.
pub(crate) unsafe fn tcp_read(stream: *mut StreamInner, buffer: &mut [u8]) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    if (*stream).info.status.read_terminal() {
        return 0;
    }

    let owner = &*(*stream).owner.get();
    if owner.is_shutdown() {
        (*stream).info.status.shutdown = true;
        fire_status(stream);
        return 0;
    }

    let current = owner.current_task();
    if current == owner.main_task() {
        (*stream).info.status.error = libc::EDEADLK;
        return 0;
    }

    let mut request = TcpReadRequest {
        task: current,
        done: 0,
    };
    (*stream).read_req.set(&mut request as *mut _ as *mut ());

    let timeout = (*stream).info.read.timeout;
    let moment = Moment::new(time::now_ms() + timeout, current);
    if timeout > 0 {
        owner.timeouts.add(moment.as_ptr());
    }

    let started = Instant::now();

    if let Err(err) = arm(stream, INTEREST_READ) {
        if timeout > 0 {
            owner.timeouts.remove(moment.as_ptr());
        }
        (*stream).read_req.set(ptr::null_mut());
        (*stream).info.status.error = err.raw_os_error().unwrap_or(libc::EIO);
        fire_status(stream);
        return 0;
    }

    loop {
        if task::suspend(current).is_err() {
            break;
        }

        if timeout > 0 && moment.reached.get() {
            break;
        }
        if (*stream).info.status.read_terminal() {
            break;
        }

        let n = libc::read(
            (*stream).fd,
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
        );
        if n > 0 {
            request.done = n as usize;
            break;
        }
        if n == 0 {
            (*stream).info.status.eof = true;
            fire_status(stream);
            break;
        }

        let err = super::errno();
        if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
            // Spurious wakeup; stay armed and park again.
            continue;
        }

        (*stream).info.status.error = err;
        fire_status(stream);
        break;
    }

    disarm(stream, INTEREST_READ);
    if timeout > 0 {
        owner.timeouts.remove(moment.as_ptr());
    }
    (*stream).read_req.set(ptr::null_mut());

    (*stream).info.read.bytes += request.done as u64;
    (*stream).info.read.position += request.done as u64;
    (*stream).info.read.period += started.elapsed().as_nanos() as u64;

    if timeout > 0 && moment.reached.get() {
        (*stream).info.status.read_timeout = true;
        fire_status(stream);
        return 0;
    }

    request.done
}

/// One logical TCP write: drain the whole buffer, suspending on `EAGAIN`,
/// until done, a terminal status or the write timeout. Returns the bytes
/// the kernel accepted, which a timeout can leave short.
pub(crate) unsafe fn tcp_write(stream: *mut StreamInner, buffer: &[u8]) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    if (*stream).info.status.write_terminal() {
        return 0;
    }

    let owner = &*(*stream).owner.get();
    if owner.is_shutdown() {
        (*stream).info.status.shutdown = true;
        fire_status(stream);
        return 0;
    }

    let current = owner.current_task();
    if current == owner.main_task() {
        (*stream).info.status.error = libc::EDEADLK;
        return 0;
    }

    let mut request = TcpWriteRequest {
        task: current,
        offset: 0,
    };
    (*stream).write_req.set(&mut request as *mut _ as *mut ());

    let timeout = (*stream).info.write.timeout;
    let moment = Moment::new(time::now_ms() + timeout, current);
    if timeout > 0 {
        owner.timeouts.add(moment.as_ptr());
    }

    let started = Instant::now();

    if let Err(err) = arm(stream, INTEREST_WRITE) {
        if timeout > 0 {
            owner.timeouts.remove(moment.as_ptr());
        }
        (*stream).write_req.set(ptr::null_mut());
        (*stream).info.status.error = err.raw_os_error().unwrap_or(libc::EIO);
        fire_status(stream);
        return 0;
    }

    'wait: loop {
        if task::suspend(current).is_err() {
            break;
        }

        if timeout > 0 && moment.reached.get() {
            break;
        }
        if (*stream).info.status.write_terminal() {
            break;
        }

        loop {
            let n = libc::write(
                (*stream).fd,
                buffer.as_ptr().add(request.offset) as *const libc::c_void,
                buffer.len() - request.offset,
            );
            if n > 0 {
                request.offset += n as usize;
                if request.offset == buffer.len() {
                    break 'wait;
                }
                continue;
            }
            if n == 0 {
                break;
            }

            let err = super::errno();
            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                // Kernel buffer full; wait for the next writable event.
                break;
            }

            (*stream).info.status.error = err;
            fire_status(stream);
            break 'wait;
        }
    }

    disarm(stream, INTEREST_WRITE);
    if timeout > 0 {
        owner.timeouts.remove(moment.as_ptr());
    }
    (*stream).write_req.set(ptr::null_mut());

    (*stream).info.write.bytes += request.offset as u64;
    (*stream).info.write.position += request.offset as u64;
    (*stream).info.write.period += started.elapsed().as_nanos() as u64;

    if timeout > 0 && moment.reached.get() {
        (*stream).info.status.write_timeout = true;
        fire_status(stream);
    }

    request.offset
}

unsafe fn file_read_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut FileIoRequest);

    loop {
        let n = libc::pread(
            request.fd,
            request.buffer as *mut libc::c_void,
            request.length,
            request.offset as libc::off_t,
        );
        if n >= 0 {
            request.done = n as usize;
            break;
        }

        let err = super::errno();
        if err == libc::EINTR {
            continue;
        }
        request.error = err;
        break;
    }

    pool::finish(work);
}

unsafe fn file_write_entry(work: &mut Work) {
    let request = &mut *(work.arg as *mut FileIoRequest);

    loop {
        let n = libc::pwrite(
            request.fd,
            request.buffer as *const libc::c_void,
            request.length,
            request.offset as libc::off_t,
        );
        if n >= 0 {
            request.done = n as usize;
            break;
        }

        let err = super::errno();
        if err == libc::EINTR {
            continue;
        }
        request.error = err;
        break;
    }

    pool::finish(work);
}

/// File read at the stream's read cursor, executed on the worker pool; the
/// calling task suspends until the worker reposts it.
pub(crate) unsafe fn file_read(stream: *mut StreamInner, buffer: &mut [u8]) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    if (*stream).info.status.read_terminal() {
        return 0;
    }

    let owner = &*(*stream).owner.get();
    if owner.is_shutdown() {
        (*stream).info.status.shutdown = true;
        fire_status(stream);
        return 0;
    }

    let current = owner.current_task();
    if current == owner.main_task() {
        (*stream).info.status.error = libc::EDEADLK;
        return 0;
    }

    let mut request = FileIoRequest {
        fd: (*stream).fd,
        buffer: buffer.as_mut_ptr(),
        length: buffer.len(),
        offset: (*stream).info.read.position,
        done: 0,
        error: 0,
    };
    let mut work = Work::new(file_read_entry, &mut request as *mut _ as *mut ());

    let started = Instant::now();

    if let Err(err) = pool::post(&mut work) {
        (*stream).info.status.error = err.raw_os_error().unwrap_or(libc::EIO);
        fire_status(stream);
        return 0;
    }
    let _ = task::suspend(current);

    (*stream).info.read.bytes += request.done as u64;
    (*stream).info.read.position += request.done as u64;
    (*stream).info.read.period += started.elapsed().as_nanos() as u64;

    if request.error != 0 {
        (*stream).info.status.error = request.error;
        fire_status(stream);
    } else if request.done == 0 {
        (*stream).info.status.eof = true;
        fire_status(stream);
    }

    request.done
}

/// File write at the stream's write cursor, looping on the worker pool
/// until the whole buffer is on disk or an error stops it.
pub(crate) unsafe fn file_write(stream: *mut StreamInner, buffer: &[u8]) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    if (*stream).info.status.write_terminal() {
        return 0;
    }

    let owner = &*(*stream).owner.get();
    if owner.is_shutdown() {
        (*stream).info.status.shutdown = true;
        fire_status(stream);
        return 0;
    }

    let current = owner.current_task();
    if current == owner.main_task() {
        (*stream).info.status.error = libc::EDEADLK;
        return 0;
    }

    let started = Instant::now();
    let mut total = 0;

    while total < buffer.len() {
        let mut request = FileIoRequest {
            fd: (*stream).fd,
            buffer: buffer.as_ptr().add(total) as *mut u8,
            length: buffer.len() - total,
            offset: (*stream).info.write.position,
            done: 0,
            error: 0,
        };
        let mut work = Work::new(file_write_entry, &mut request as *mut _ as *mut ());

        if let Err(err) = pool::post(&mut work) {
            (*stream).info.status.error = err.raw_os_error().unwrap_or(libc::EIO);
            fire_status(stream);
            break;
        }
        let _ = task::suspend(current);

        if request.error != 0 {
            (*stream).info.status.error = request.error;
            fire_status(stream);
            break;
        }
        if request.done == 0 {
            break;
        }

        (*stream).info.write.position += request.done as u64;
        total += request.done;

        if owner.is_shutdown() {
            (*stream).info.status.shutdown = true;
            fire_status(stream);
            break;
        }
    }

    (*stream).info.write.bytes += total as u64;
    (*stream).info.write.period += started.elapsed().as_nanos() as u64;

    total
}

/// Close an fd, retrying on `EINTR`.
pub(crate) fn close_fd(fd: RawFd) -> io::Result<()> {
    loop {
        match syscall!(close(fd)) {
            Ok(_) => return Ok(()),
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}
