mod context;
mod net;
mod selector;
mod stack;
mod stream;
mod tcp;
mod waker;

pub(crate) use self::context::{errno, set_errno, Context};
pub(crate) use self::net::{
    apply_socket_options, bind as bind_socket, connect as connect_socket, listen, local_port,
    net_cleanup, net_init, new_socket, socket_address, socket_error, RawAddr, Socket,
};
pub(crate) use self::selector::{
    event, Event, Events, Selector, INTEREST_BASE, INTEREST_READ, INTEREST_WRITE, WAKER_TOKEN,
};
pub(crate) use self::stack::Stack;
pub(crate) use self::stream::{
    close_fd, file_read, file_write, stream_attach, stream_deregister, tcp_processor, tcp_read,
    tcp_write, INVALID_HANDLE,
};
pub(crate) use self::tcp::{
    accept_begin, accept_end, close_socket, connect_abort, connect_begin, connect_finish,
    connect_processor, handle_to_socket, listener_deregister, listener_processor,
    listener_register, socket_to_handle, ListenerState, INVALID_SOCKET,
};
pub(crate) use self::waker::{Notifier, Waker};

/// Platform error codes surfaced through `io::Error::raw_os_error`.
pub(crate) mod ecode {
    pub(crate) use libc::{
        EALREADY, ECANCELED, EDEADLK, EINPROGRESS, EIO, ENOSYS, ETIMEDOUT,
    };
}

/// Raw handle to a file opened for stream I/O.
pub(crate) type FileHandle = std::os::unix::io::RawFd;

pub(crate) fn file_into_handle(file: std::fs::File) -> FileHandle {
    use std::os::unix::io::IntoRawFd;
    file.into_raw_fd()
}
