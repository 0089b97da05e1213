//! IOCP-side accept and connect machinery behind the portable TCP layer:
//! overlapped `AcceptEx` on a pre-created socket, `ConnectEx` loaded by
//! GUID at first use.

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::mem;
use std::ptr;

use log::warn;

use windows_sys::Win32::Foundation::{ERROR_IO_PENDING, HANDLE};
use windows_sys::Win32::Networking::WinSock::{
    setsockopt, AcceptEx, WSAGetLastError, WSAIoctl, SIO_GET_EXTENSION_FUNCTION_POINTER,
    SOCKADDR, SOCKADDR_STORAGE, SOCKET_ERROR, SOL_SOCKET, SO_UPDATE_ACCEPT_CONTEXT,
    SO_UPDATE_CONNECT_CONTEXT, WSAID_CONNECTEX,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

use super::net::{
    apply_socket_options, bind_any, close_socket, new_socket, RawAddr, Socket,
};
use super::selector::Event;
use crate::event_loop::Loop;
use crate::net::tcp::ListenerInner;
use crate::stream::StreamInner;
use crate::task::{self, Task};

pub(crate) const INVALID_SOCKET: Socket =
    windows_sys::Win32::Networking::WinSock::INVALID_SOCKET;

const ADDRESS_SLOT: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;

/// Per-listener overlapped accept state: the pre-created socket `AcceptEx`
/// fills and the address scratch it insists on.
pub(crate) struct ListenerState {
    pending: Cell<Socket>,
    overlapped: UnsafeCell<OVERLAPPED>,
    addresses: UnsafeCell<[u8; 2 * ADDRESS_SLOT]>,
}

impl ListenerState {
    pub(crate) fn new() -> ListenerState {
        ListenerState {
            pending: Cell::new(INVALID_SOCKET),
            overlapped: UnsafeCell::new(unsafe { mem::zeroed() }),
            addresses: UnsafeCell::new([0; 2 * ADDRESS_SLOT]),
        }
    }
}

pub(crate) unsafe fn listener_register(
    listener: &ListenerInner,
    lp: &Loop,
) -> io::Result<()> {
    lp.selector
        .register(listener.socket as HANDLE, listener.reg.token(), 0)
}

pub(crate) unsafe fn listener_deregister(
    _listener: &ListenerInner,
    _lp: &Loop,
) -> io::Result<()> {
    Ok(())
}

/// Post the overlapped accept on a freshly created socket.
pub(crate) unsafe fn accept_begin(listener: &ListenerInner, _lp: &Loop) -> io::Result<()> {
    let socket = new_socket(listener.family)?;
    listener.platform.pending.set(socket);

    let overlapped = listener.platform.overlapped.get();
    *overlapped = mem::zeroed();

    let mut received = 0u32;
    let ok = AcceptEx(
        listener.socket,
        socket,
        listener.platform.addresses.get() as *mut core::ffi::c_void,
        0,
        ADDRESS_SLOT as u32,
        ADDRESS_SLOT as u32,
        &mut received,
        overlapped,
    );
    if ok == 0 {
        let error = WSAGetLastError();
        if error != ERROR_IO_PENDING as i32 {
            listener.platform.pending.set(INVALID_SOCKET);
            let _ = close_socket(socket);
            return Err(io::Error::from_raw_os_error(error));
        }
    }

    Ok(())
}

/// Release a pending accept socket that was never handed over.
pub(crate) unsafe fn accept_end(listener: &ListenerInner, _lp: &Loop) {
    let socket = listener.platform.pending.replace(INVALID_SOCKET);
    if socket != INVALID_SOCKET {
        let _ = close_socket(socket);
    }
}

/// Accept completion: adopt the pre-created socket and wake the acceptor.
pub(crate) unsafe fn listener_processor(data: *mut (), event: &Event) {
    let listener = data as *mut ListenerInner;

    let request = (*listener).accept.get();
    if request.is_null() {
        return;
    }

    if event.error != 0 {
        (*request).error = event.error as i32;
    } else {
        let socket = (*listener).platform.pending.replace(INVALID_SOCKET);

        let parent = (*listener).socket;
        if setsockopt(
            socket,
            SOL_SOCKET as i32,
            SO_UPDATE_ACCEPT_CONTEXT as i32,
            &parent as *const Socket as *const u8,
            mem::size_of::<Socket>() as i32,
        ) == SOCKET_ERROR
        {
            (*request).error = WSAGetLastError();
            let _ = close_socket(socket);
        } else {
            if let Err(err) = apply_socket_options(socket) {
                warn!("accepted socket option failed: {}", err);
            }
            (*request).socket = socket;
        }
    }

    task::resume((*request).task);
}

type ConnectExFn = unsafe extern "system" fn(
    Socket,
    *const SOCKADDR,
    i32,
    *const core::ffi::c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

unsafe fn load_connect_ex(socket: Socket) -> io::Result<ConnectExFn> {
    let guid = WSAID_CONNECTEX;
    let mut function: Option<ConnectExFn> = None;
    let mut bytes = 0u32;

    let rc = WSAIoctl(
        socket,
        SIO_GET_EXTENSION_FUNCTION_POINTER,
        &guid as *const _ as *const core::ffi::c_void,
        mem::size_of_val(&guid) as u32,
        &mut function as *mut _ as *mut core::ffi::c_void,
        mem::size_of_val(&function) as u32,
        &mut bytes,
        ptr::null_mut(),
        None,
    );
    if rc == SOCKET_ERROR {
        return Err(io::Error::from_raw_os_error(WSAGetLastError()));
    }

    function.ok_or_else(|| io::Error::from(io::ErrorKind::Unsupported))
}

/// Issue the overlapped connect. `ConnectEx` requires the socket bound and
/// associated with the port first; the completion always arrives as a
/// packet, so this never reports inline success.
pub(crate) unsafe fn connect_begin(
    stream: *mut StreamInner,
    socket: Socket,
    address: &RawAddr,
    lp: &Loop,
) -> io::Result<bool> {
    bind_any(socket, address.family)?;

    lp.selector
        .register(socket as HANDLE, (*stream).reg.token(), 0)?;

    let connect_ex = load_connect_ex(socket)?;

    let overlapped = (*stream).platform.read_overlapped();
    *overlapped = mem::zeroed();

    let mut sent = 0u32;
    let ok = connect_ex(
        socket,
        address.as_ptr(),
        address.len(),
        ptr::null(),
        0,
        &mut sent,
        overlapped,
    );
    if ok == 0 {
        let error = WSAGetLastError();
        if error != ERROR_IO_PENDING as i32 {
            return Err(io::Error::from_raw_os_error(error));
        }
    }

    // Completed-inline still posts a packet; the caller parks either way.
    Ok(true)
}

/// Settle a successful connect: adopt the default socket context.
pub(crate) unsafe fn connect_finish(
    _stream: *mut StreamInner,
    socket: Socket,
    _registered: bool,
    _lp: &Loop,
) -> io::Result<()> {
    if setsockopt(
        socket,
        SOL_SOCKET as i32,
        SO_UPDATE_CONNECT_CONTEXT as i32,
        ptr::null(),
        0,
    ) == SOCKET_ERROR
    {
        return Err(io::Error::from_raw_os_error(WSAGetLastError()));
    }
    Ok(())
}

/// Tear a failed connect down; closing the socket drops the association
/// and aborts anything still in flight.
pub(crate) unsafe fn connect_abort(
    _stream: *mut StreamInner,
    socket: Socket,
    _registered: bool,
    _lp: &Loop,
) {
    let _ = close_socket(socket);
}

/// Connect completion: record the outcome and wake the connecting task,
/// which parks itself in the read request slot.
pub(crate) unsafe fn connect_processor(data: *mut (), event: &Event) {
    let stream = data as *mut StreamInner;

    if event.error != 0 {
        (*stream).info.status.error = event.error as i32;
    }

    let task = (*stream).read_req.get() as *mut Task;
    if !task.is_null() {
        task::resume(task);
    }
}
