mod context;
mod net;
mod selector;
mod stack;
mod stream;
mod tcp;
mod waker;

pub(crate) use self::context::{errno, set_errno, Context};
pub(crate) use self::net::{
    apply_socket_options, bind as bind_socket, close_socket, connect as connect_socket, listen,
    local_port, net_cleanup, net_init, new_socket, socket_address, socket_error, RawAddr, Socket,
};
pub(crate) use self::selector::{
    event, Event, Events, Selector, INTEREST_BASE, INTEREST_READ, INTEREST_WRITE, WAKER_TOKEN,
};
pub(crate) use self::stack::Stack;
pub(crate) use self::stream::{
    close_fd, file_read, file_write, handle_to_socket, socket_to_handle, stream_attach,
    stream_deregister, tcp_processor, tcp_read, tcp_write, StreamState, INVALID_HANDLE,
};
pub(crate) use self::tcp::{
    accept_begin, accept_end, connect_abort, connect_begin, connect_finish, connect_processor,
    listener_deregister, listener_processor, listener_register, ListenerState, INVALID_SOCKET,
};
pub(crate) use self::waker::{Notifier, Waker};

/// Platform error codes surfaced through `io::Error::raw_os_error`. The
/// names follow the POSIX taxonomy used by the portable layer; the values
/// are the closest Windows equivalents.
pub(crate) mod ecode {
    use windows_sys::Win32::Foundation::{
        ERROR_CALL_NOT_IMPLEMENTED, ERROR_GEN_FAILURE, ERROR_IO_PENDING,
        ERROR_OPERATION_ABORTED, ERROR_POSSIBLE_DEADLOCK,
    };
    use windows_sys::Win32::Networking::WinSock::{WSAEALREADY, WSAETIMEDOUT};

    pub(crate) const ECANCELED: i32 = ERROR_OPERATION_ABORTED as i32;
    pub(crate) const EDEADLK: i32 = ERROR_POSSIBLE_DEADLOCK as i32;
    pub(crate) const EALREADY: i32 = WSAEALREADY;
    pub(crate) const ETIMEDOUT: i32 = WSAETIMEDOUT;
    pub(crate) const EIO: i32 = ERROR_GEN_FAILURE as i32;
    pub(crate) const ENOSYS: i32 = ERROR_CALL_NOT_IMPLEMENTED as i32;
    pub(crate) const EINPROGRESS: i32 = ERROR_IO_PENDING as i32;
}

/// Raw handle to a file opened for stream I/O.
pub(crate) type FileHandle = windows_sys::Win32::Foundation::HANDLE;

pub(crate) fn file_into_handle(file: std::fs::File) -> FileHandle {
    use std::os::windows::io::IntoRawHandle;
    file.into_raw_handle() as FileHandle
}
