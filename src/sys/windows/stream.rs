//! IOCP-side stream operations: overlapped reads and writes on sockets and
//! files, and the completion processors dispatched by the loop.
//!
//! Each stream embeds one OVERLAPPED per direction (`StreamState`); the
//! completion packet's overlapped pointer identifies the direction. A
//! timed-out operation is not cancelled; its late completion finds the
//! request slot empty and is dropped, as the timeout contract specifies.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::ptr;
use std::time::Instant;

use log::trace;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_HANDLE_EOF, ERROR_IO_PENDING, HANDLE,
};
use windows_sys::Win32::Networking::WinSock::{
    WSAGetLastError, WSARecv, WSASend, WSABUF,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::OVERLAPPED;

use super::net::Socket;
use super::selector::Event;
use crate::event_loop::Loop;
use crate::stream::fire_status;
use crate::stream::StreamInner;
use crate::task::{self, Task};
use crate::time;
use crate::timer::Moment;

pub(crate) const INVALID_HANDLE: super::FileHandle = ptr::null_mut();

/// Per-stream overlapped state, one slot per direction.
pub(crate) struct StreamState {
    read: UnsafeCell<OVERLAPPED>,
    write: UnsafeCell<OVERLAPPED>,
}

impl StreamState {
    pub(crate) fn new() -> StreamState {
        StreamState {
            read: UnsafeCell::new(unsafe { mem::zeroed() }),
            write: UnsafeCell::new(unsafe { mem::zeroed() }),
        }
    }

    pub(crate) fn read_overlapped(&self) -> *mut OVERLAPPED {
        self.read.get()
    }

    pub(crate) fn write_overlapped(&self) -> *mut OVERLAPPED {
        self.write.get()
    }
}

/// Completed overlapped operation parked in a request slot.
#[repr(C)]
struct IoRequest {
    task: *mut Task,
    done: usize,
    error: u32,
    finished: bool,
}

pub(crate) unsafe fn stream_attach(stream: *mut StreamInner, lp: &Loop) -> io::Result<()> {
    trace!("associating stream handle with completion port");
    lp.selector
        .register((*stream).fd as HANDLE, (*stream).reg.token(), 0)
}

/// Completion ports have no dissociation; the handle just closes.
pub(crate) unsafe fn stream_deregister(_stream: *mut StreamInner) -> io::Result<()> {
    Ok(())
}

/// Completion packets for a connected TCP stream or a file: match the
/// overlapped pointer to a direction and wake the parked operation.
pub(crate) unsafe fn tcp_processor(data: *mut (), event: &Event) {
    let stream = data as *mut StreamInner;

    let request = if event.overlapped == (*stream).platform.read_overlapped() {
        (*stream).read_req.get() as *mut IoRequest
    } else if event.overlapped == (*stream).platform.write_overlapped() {
        (*stream).write_req.get() as *mut IoRequest
    } else {
        ptr::null_mut()
    };

    if request.is_null() {
        // The waiter gave up (timeout); drop the late completion.
        return;
    }

    (*request).done = event.bytes as usize;
    (*request).error = event.error;
    (*request).finished = true;

    task::resume((*request).task);
}

/// One logical TCP read: post an overlapped `WSARecv`, suspend unless it
/// completed inline, then classify. A configured read timeout is a moment
/// in the loop's timeout tree spanning the suspension.
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
        (*stream).info.status.error = super::ecode::EDEADLK;
        return 0;
    }

    let mut request = IoRequest {
        task: current,
        done: 0,
        error: 0,
        finished: false,
    };
    (*stream).read_req.set(&mut request as *mut _ as *mut ());

    let overlapped = (*stream).platform.read_overlapped();
    *overlapped = mem::zeroed();

    let mut wsabuf = WSABUF {
        len: buffer.len().min(u32::MAX as usize) as u32,
        buf: buffer.as_mut_ptr(),
    };
    let mut received = 0u32;
    let mut flags = 0u32;

    let timeout = (*stream).info.read.timeout;
    let moment = Moment::new(time::now_ms() + timeout, current);
    if timeout > 0 {
        owner.timeouts.add(moment.as_ptr());
    }

    let started = Instant::now();

    let rc = WSARecv(
        (*stream).fd as Socket,
        &mut wsabuf,
        1,
        &mut received,
        &mut flags,
        overlapped,
        None,
    );
    if rc != 0 {
        let error = WSAGetLastError();
        if error != ERROR_IO_PENDING as i32 {
            if timeout > 0 {
                owner.timeouts.remove(moment.as_ptr());
            }
            (*stream).read_req.set(ptr::null_mut());
            (*stream).info.status.error = error;
            fire_status(stream);
            return 0;
        }
    }

    // Even inline completions are reported through the port; park until the
    // packet arrives.
    while !request.finished {
        if task::suspend(current).is_err() {
            break;
        }
        if timeout > 0 && moment.reached.get() {
            break;
        }
        if (*stream).info.status.read_terminal() {
            break;
        }
    }

    if timeout > 0 {
        owner.timeouts.remove(moment.as_ptr());
    }
    (*stream).read_req.set(ptr::null_mut());

    (*stream).info.read.bytes += request.done as u64;
    (*stream).info.read.position += request.done as u64;
    (*stream).info.read.period += started.elapsed().as_nanos() as u64;

    if timeout > 0 && moment.reached.get() && !request.finished {
        (*stream).info.status.read_timeout = true;
        fire_status(stream);
        return 0;
    }

    if request.error != 0 {
        (*stream).info.status.error = request.error as i32;
        fire_status(stream);
        return 0;
    }
    if request.done == 0 {
        // Zero-byte completion on a stream socket is the peer's FIN.
        (*stream).info.status.eof = true;
        fire_status(stream);
    }

    request.done
}

/// One logical TCP write: overlapped `WSASend`s until the whole buffer is
/// accepted, a terminal status or the write timeout.
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
        (*stream).info.status.error = super::ecode::EDEADLK;
        return 0;
    }

    let timeout = (*stream).info.write.timeout;
    let moment = Moment::new(time::now_ms() + timeout, current);
    if timeout > 0 {
        owner.timeouts.add(moment.as_ptr());
    }

    let started = Instant::now();
    let mut total = 0usize;

    'sending: while total < buffer.len() {
        let mut request = IoRequest {
            task: current,
            done: 0,
            error: 0,
            finished: false,
        };
        (*stream).write_req.set(&mut request as *mut _ as *mut ());

        let overlapped = (*stream).platform.write_overlapped();
        *overlapped = mem::zeroed();

        let remaining = buffer.len() - total;
        let mut wsabuf = WSABUF {
            len: remaining.min(u32::MAX as usize) as u32,
            buf: buffer.as_ptr().add(total) as *mut u8,
        };
        let mut sent = 0u32;

        let rc = WSASend(
            (*stream).fd as Socket,
            &mut wsabuf,
            1,
            &mut sent,
            0,
            overlapped,
            None,
        );
        if rc != 0 {
            let error = WSAGetLastError();
            if error != ERROR_IO_PENDING as i32 {
                (*stream).info.status.error = error;
                fire_status(stream);
                (*stream).write_req.set(ptr::null_mut());
                break;
            }
        }

        while !request.finished {
            if task::suspend(current).is_err() {
                break 'sending;
            }
            if timeout > 0 && moment.reached.get() {
                break 'sending;
            }
            if (*stream).info.status.write_terminal() {
                break 'sending;
            }
        }

        (*stream).write_req.set(ptr::null_mut());

        if request.error != 0 {
            (*stream).info.status.error = request.error as i32;
            fire_status(stream);
            break;
        }
        if request.done == 0 {
            break;
        }

        total += request.done;
    }

    (*stream).write_req.set(ptr::null_mut());
    if timeout > 0 {
        owner.timeouts.remove(moment.as_ptr());
    }

    (*stream).info.write.bytes += total as u64;
    (*stream).info.write.position += total as u64;
    (*stream).info.write.period += started.elapsed().as_nanos() as u64;

    if timeout > 0 && moment.reached.get() {
        (*stream).info.status.write_timeout = true;
        fire_status(stream);
    }

    total
}

/// File read at the stream's read cursor via overlapped `ReadFile`;
/// `ERROR_HANDLE_EOF` is the end-of-file signal.
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
        (*stream).info.status.error = super::ecode::EDEADLK;
        return 0;
    }

    let mut request = IoRequest {
        task: current,
        done: 0,
        error: 0,
        finished: false,
    };
    (*stream).read_req.set(&mut request as *mut _ as *mut ());

    let offset = (*stream).info.read.position;
    let overlapped = (*stream).platform.read_overlapped();
    *overlapped = mem::zeroed();
    (*overlapped).Anonymous.Anonymous.Offset = offset as u32;
    (*overlapped).Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;

    let started = Instant::now();

    let ok = ReadFile(
        (*stream).fd as HANDLE,
        buffer.as_mut_ptr(),
        buffer.len().min(u32::MAX as usize) as u32,
        ptr::null_mut(),
        overlapped,
    );
    if ok == 0 {
        let error = super::errno() as u32;
        if error == ERROR_HANDLE_EOF {
            (*stream).read_req.set(ptr::null_mut());
            (*stream).info.status.eof = true;
            fire_status(stream);
            return 0;
        }
        if error != ERROR_IO_PENDING {
            (*stream).read_req.set(ptr::null_mut());
            (*stream).info.status.error = error as i32;
            fire_status(stream);
            return 0;
        }
    }

    while !request.finished {
        if task::suspend(current).is_err() {
            break;
        }
    }
    (*stream).read_req.set(ptr::null_mut());

    (*stream).info.read.bytes += request.done as u64;
    (*stream).info.read.position += request.done as u64;
    (*stream).info.read.period += started.elapsed().as_nanos() as u64;

    if request.error == ERROR_HANDLE_EOF || (request.error == 0 && request.done == 0) {
        (*stream).info.status.eof = true;
        fire_status(stream);
        return request.done;
    }
    if request.error != 0 {
        (*stream).info.status.error = request.error as i32;
        fire_status(stream);
        return 0;
    }

    request.done
}

/// File write at the stream's write cursor via overlapped `WriteFile`.
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
        (*stream).info.status.error = super::ecode::EDEADLK;
        return 0;
    }

    let started = Instant::now();
    let mut total = 0usize;

    while total < buffer.len() {
        let mut request = IoRequest {
            task: current,
            done: 0,
            error: 0,
            finished: false,
        };
        (*stream).write_req.set(&mut request as *mut _ as *mut ());

        let offset = (*stream).info.write.position;
        let overlapped = (*stream).platform.write_overlapped();
        *overlapped = mem::zeroed();
        (*overlapped).Anonymous.Anonymous.Offset = offset as u32;
        (*overlapped).Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;

        let remaining = buffer.len() - total;
        let ok = WriteFile(
            (*stream).fd as HANDLE,
            buffer.as_ptr().add(total),
            remaining.min(u32::MAX as usize) as u32,
            ptr::null_mut(),
            overlapped,
        );
        if ok == 0 {
            let error = super::errno() as u32;
            if error != ERROR_IO_PENDING {
                (*stream).write_req.set(ptr::null_mut());
                (*stream).info.status.error = error as i32;
                fire_status(stream);
                break;
            }
        }

        while !request.finished {
            if task::suspend(current).is_err() {
                break;
            }
        }
        (*stream).write_req.set(ptr::null_mut());

        if request.error != 0 {
            (*stream).info.status.error = request.error as i32;
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

/// Close a kernel handle.
pub(crate) fn close_fd(handle: super::FileHandle) -> io::Result<()> {
    if unsafe { CloseHandle(handle as HANDLE) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn handle_to_socket(handle: super::FileHandle) -> Socket {
    handle as Socket
}

pub(crate) fn socket_to_handle(socket: Socket) -> super::FileHandle {
    socket as super::FileHandle
}
