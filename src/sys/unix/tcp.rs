//! epoll-side accept and connect machinery behind the portable TCP layer.

use std::io;

use log::warn;

use super::net::{socket_error, Socket};
use super::selector::{event, INTEREST_BASE, INTEREST_READ, INTEREST_WRITE};
use crate::event_loop::Loop;
use crate::net::tcp::ListenerInner;
use crate::stream::StreamInner;
use crate::sys;
use crate::task::{self, Task};

pub(crate) const INVALID_SOCKET: Socket = -1;

/// Per-platform listener scratch; readiness needs none.
pub(crate) struct ListenerState;

impl ListenerState {
    pub(crate) fn new() -> ListenerState {
        ListenerState
    }
}

pub(crate) fn socket_to_handle(socket: Socket) -> super::FileHandle {
    socket
}

pub(crate) fn handle_to_socket(handle: super::FileHandle) -> Socket {
    handle
}

pub(crate) fn close_socket(socket: Socket) -> io::Result<()> {
    super::close_fd(socket)
}

pub(crate) unsafe fn listener_register(
    listener: &ListenerInner,
    lp: &Loop,
) -> io::Result<()> {
    lp.selector
        .register(listener.socket, listener.reg.token(), INTEREST_BASE)
}

pub(crate) unsafe fn listener_deregister(
    listener: &ListenerInner,
    lp: &Loop,
) -> io::Result<()> {
    lp.selector.deregister(listener.socket)
}

/// Readiness events for a listening socket: accept into the pending slot
/// and wake the acceptor. `EAGAIN` readiness is spurious and ignored.
pub(crate) unsafe fn listener_processor(data: *mut (), event: &super::Event) {
    let listener = data as *mut ListenerInner;

    let request = (*listener).accept.get();
    if request.is_null() {
        return;
    }

    if event::is_error(event) {
        (*request).error = socket_error((*listener).socket);
    } else if event::is_hangup(event) {
        (*request).error = sys::ecode::ECANCELED;
    } else if event::is_readable(event) {
        match super::net::accept((*listener).socket) {
            Ok(socket) => {
                if let Err(err) = super::net::apply_socket_options(socket) {
                    warn!("accepted socket option failed: {}", err);
                }
                (*request).socket = socket;
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Someone else took the connection; stay armed, stay parked.
                return;
            }
            Err(err) => {
                (*request).error = err.raw_os_error().unwrap_or(sys::ecode::EIO);
            }
        }
    } else {
        (*request).error = socket_error((*listener).socket);
    }

    task::resume((*request).task);
}

/// Arm read interest for the pending accept.
pub(crate) unsafe fn accept_begin(listener: &ListenerInner, lp: &Loop) -> io::Result<()> {
    lp.selector.rearm(
        listener.socket,
        listener.reg.token(),
        INTEREST_BASE | INTEREST_READ,
    )
}

/// Disarm after the accept concluded, however it concluded.
pub(crate) unsafe fn accept_end(listener: &ListenerInner, lp: &Loop) {
    let _ = lp
        .selector
        .rearm(listener.socket, listener.reg.token(), INTEREST_BASE);
}

/// Issue the non-blocking connect. `Ok(false)` means it completed inline;
/// `Ok(true)` means it is pending with the socket registered for writable
/// readiness and the caller should suspend.
pub(crate) unsafe fn connect_begin(
    stream: *mut StreamInner,
    socket: Socket,
    address: &super::net::RawAddr,
    lp: &Loop,
) -> io::Result<bool> {
    match super::net::connect(socket, address) {
        Ok(()) => Ok(false),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
            lp.selector.register(
                socket,
                (*stream).reg.token(),
                INTEREST_BASE | INTEREST_WRITE,
            )?;
            Ok(true)
        }
        Err(err) => Err(err),
    }
}

/// Settle a successful connect into plain base-interest registration.
pub(crate) unsafe fn connect_finish(
    stream: *mut StreamInner,
    socket: Socket,
    registered: bool,
    lp: &Loop,
) -> io::Result<()> {
    if registered {
        lp.selector
            .rearm(socket, (*stream).reg.token(), INTEREST_BASE)
    } else {
        lp.selector
            .register(socket, (*stream).reg.token(), INTEREST_BASE)
    }
}

/// Tear a failed connect down without leaking the descriptor.
pub(crate) unsafe fn connect_abort(
    _stream: *mut StreamInner,
    socket: Socket,
    registered: bool,
    lp: &Loop,
) {
    if registered {
        let _ = lp.selector.deregister(socket);
    }
    let _ = close_socket(socket);
}

/// Events for a socket with a connect in flight. The connecting task parks
/// itself in the read request slot.
pub(crate) unsafe fn connect_processor(data: *mut (), event: &super::Event) {
    let stream = data as *mut StreamInner;

    if event::is_error(event) {
        (*stream).info.status.error = socket_error(handle_to_socket((*stream).fd));
    } else if event::is_hangup(event) {
        (*stream).info.status.closed = true;
    } else if !event::is_writable(event) {
        (*stream).info.status.error = socket_error(handle_to_socket((*stream).fd));
    }

    let task = (*stream).read_req.get() as *mut Task;
    if !task.is_null() {
        task::resume(task);
    }
}
