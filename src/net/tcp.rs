//! TCP listener and connector.
//!
//! A listener holds a single accept slot: one outstanding accept at a time,
//! the accept loop lives in one task by design. Connects classify their
//! outcome from the status bits and the timeout moment after resuming. The
//! platform side (readiness arming on epoll, overlapped AcceptEx/ConnectEx
//! on IOCP) lives behind the `sys` accept/connect hooks.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use log::{trace, warn};

use crate::event_loop::{Loop, Registration};
use crate::stream::{Stream, StreamKind};
use crate::sys;
use crate::task::{self, Task};
use crate::time;
use crate::timer::Moment;
use crate::util::not_on_loop;

/// Bring the TCP subsystem up. Part of the run harness's init sequence.
pub(crate) fn init() -> io::Result<()> {
    sys::net_init()
}

/// Symmetric teardown of [`init`].
pub(crate) fn cleanup() {
    sys::net_cleanup();
}

pub(crate) struct AcceptRequest {
    pub(crate) task: *mut Task,
    pub(crate) socket: sys::Socket,
    pub(crate) error: i32,
}

pub(crate) struct ListenerInner {
    pub(crate) reg: Registration,
    pub(crate) socket: sys::Socket,
    pub(crate) owner: *const Loop,
    pub(crate) accept: Cell<*mut AcceptRequest>,
    pub(crate) family: i32,
    pub(crate) error: Cell<i32>,
    pub(crate) closed: Cell<bool>,
    pub(crate) shutdown: Cell<bool>,
    // Scratch for the overlapped accept; empty on the readiness backend.
    #[allow(dead_code)]
    pub(crate) platform: sys::ListenerState,
}

/// A listening TCP socket bound to the creating task's loop.
pub struct TcpListener {
    inner: NonNull<ListenerInner>,
}

/// Bind and listen on `ip:port`. The address family follows the literal:
/// IPv6 when `ip` contains `:`, IPv4 otherwise.
pub fn listen(ip: &str, port: u16, backlog: i32) -> io::Result<TcpListener> {
    let lp = Loop::current().ok_or_else(not_on_loop)?;
    if lp.is_shutdown() {
        return Err(io::Error::from_raw_os_error(sys::ecode::ECANCELED));
    }

    let address = sys::socket_address(ip, port)?;
    let socket = sys::new_socket(address.family)?;

    if let Err(err) = sys::apply_socket_options(socket) {
        warn!("listener socket option failed: {}", err);
    }

    if let Err(err) = sys::bind_socket(socket, &address).and_then(|()| sys::listen(socket, backlog))
    {
        let _ = sys::close_socket(socket);
        return Err(err);
    }

    let inner = Box::into_raw(Box::new(ListenerInner {
        reg: Registration::new(sys::listener_processor),
        socket,
        owner: lp,
        accept: Cell::new(ptr::null_mut()),
        family: address.family,
        error: Cell::new(0),
        closed: Cell::new(false),
        shutdown: Cell::new(false),
        platform: sys::ListenerState::new(),
    }));

    unsafe {
        (*inner).reg.set_data(inner as *mut ());

        if let Err(err) = sys::listener_register(&*inner, lp) {
            let _ = sys::close_socket(socket);
            drop(Box::from_raw(inner));
            return Err(err);
        }
    }

    lp.ref_();
    trace!("listening on {}:{}", ip, port);

    Ok(TcpListener {
        inner: unsafe { NonNull::new_unchecked(inner) },
    })
}

impl TcpListener {
    /// Address family of the listening socket (`AF_INET` / `AF_INET6`).
    pub fn family(&self) -> i32 {
        unsafe { (*self.inner.as_ptr()).family }
    }

    /// Port the socket is bound to; the kernel's pick when listening on 0.
    pub fn port(&self) -> io::Result<u16> {
        sys::local_port(unsafe { (*self.inner.as_ptr()).socket })
    }

    /// Wait for one inbound connection and return it as a stream. One
    /// accept may be in flight at a time.
    pub fn accept(&mut self) -> io::Result<Stream> {
        let listener = self.inner.as_ptr();

        unsafe {
            let sticky = (*listener).error.get();
            if sticky != 0 {
                return Err(io::Error::from_raw_os_error(sticky));
            }
            if (*listener).closed.get() || (*listener).shutdown.get() {
                return Err(io::Error::from_raw_os_error(sys::ecode::ECANCELED));
            }

            let lp = &*(*listener).owner;
            if lp.is_shutdown() {
                (*listener).shutdown.set(true);
                return Err(io::Error::from_raw_os_error(sys::ecode::ECANCELED));
            }

            if !(*listener).accept.get().is_null() {
                return Err(io::Error::from_raw_os_error(sys::ecode::EALREADY));
            }

            let current = lp.current_task();
            if current == lp.main_task() {
                return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
            }

            let mut request = AcceptRequest {
                task: current,
                socket: sys::INVALID_SOCKET,
                error: 0,
            };
            (*listener).accept.set(&mut request);

            // Arm readiness / post the overlapped accept.
            if let Err(err) = sys::accept_begin(&*listener, lp) {
                (*listener).accept.set(ptr::null_mut());
                return Err(err);
            }

            let suspended = task::suspend(current);

            sys::accept_end(&*listener, lp);
            (*listener).accept.set(ptr::null_mut());

            suspended?;

            if request.error != 0 {
                return Err(io::Error::from_raw_os_error(request.error));
            }

            // The accepted stream binds to a loop lazily, on its first
            // operation.
            let stream = Stream::allocate(
                StreamKind::Tcp,
                sys::socket_to_handle(request.socket),
                sys::tcp_processor,
            );
            Ok(Stream::from_inner(stream))
        }
    }

    /// Close the listening socket. An in-flight accept observes
    /// `ECANCELED`.
    pub fn shutdown(self) -> io::Result<()> {
        let inner = self.inner;
        mem::forget(self);
        unsafe { shutdown_inner(inner.as_ptr()) }
    }
}

unsafe fn shutdown_inner(listener: *mut ListenerInner) -> io::Result<()> {
    let lp = &*(*listener).owner;

    (*listener).closed.set(true);

    let deregistered = sys::listener_deregister(&*listener, lp);
    let closed = sys::close_socket((*listener).socket);

    // Whoever is parked in accept learns about the shutdown now.
    let request = (*listener).accept.get();
    if !request.is_null() {
        (*request).error = sys::ecode::ECANCELED;
        (*listener).accept.set(ptr::null_mut());
        task::resume((*request).task);
    }

    lp.unref();
    drop(Box::from_raw(listener));

    deregistered.and(closed)
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let _ = unsafe { shutdown_inner(self.inner.as_ptr()) };
    }
}

impl fmt::Debug for TcpListener {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpListener").finish()
    }
}

/// Connect to `ip:port`, waiting at most `timeout` milliseconds when
/// positive. Returns the connected stream, or `ETIMEDOUT` / `ECANCELED` /
/// the connection error; the socket never leaks on failure.
pub fn connect(ip: &str, port: u16, timeout: u64) -> io::Result<Stream> {
    let lp = Loop::current().ok_or_else(not_on_loop)?;
    if lp.is_shutdown() {
        return Err(io::Error::from_raw_os_error(sys::ecode::ECANCELED));
    }

    let current = lp.current_task();
    if current == lp.main_task() {
        return Err(io::Error::from_raw_os_error(sys::ecode::EDEADLK));
    }

    let address = sys::socket_address(ip, port)?;
    let socket = sys::new_socket(address.family)?;

    if let Err(err) = sys::apply_socket_options(socket) {
        warn!("connecting socket option failed: {}", err);
    }

    let inner = Stream::allocate(
        StreamKind::Tcp,
        sys::socket_to_handle(socket),
        sys::connect_processor,
    );
    let stream = inner.as_ptr();

    let mut error = 0;
    let mut registered = false;

    unsafe {
        (*stream).owner.set(lp);

        match sys::connect_begin(stream, socket, &address, lp) {
            Ok(false) => {
                // Completed immediately (loopback does this); nothing to
                // wait for.
            }
            Ok(true) => {
                registered = true;
                (*stream).read_req.set(current as *mut ());

                let moment = Moment::new(time::now_ms() + timeout, current);
                if timeout > 0 {
                    lp.timeouts.add(moment.as_ptr());
                }

                let _ = task::suspend(current);

                if timeout > 0 {
                    lp.timeouts.remove(moment.as_ptr());
                }
                if timeout > 0 && moment.reached.get() {
                    error = sys::ecode::ETIMEDOUT;
                }

                (*stream).read_req.set(ptr::null_mut());
            }
            Err(err) => {
                error = err.raw_os_error().unwrap_or(sys::ecode::EIO);
            }
        }

        let status = (*stream).info.status;
        if error == 0 && status.error != 0 {
            error = status.error;
        }
        if error == 0 && (status.closed || status.shutdown) {
            error = sys::ecode::ECANCELED;
        }

        // Settle into regular stream dispatch with no operation armed.
        if error == 0 {
            if let Err(err) = sys::connect_finish(stream, socket, registered, lp) {
                error = err.raw_os_error().unwrap_or(sys::ecode::EIO);
            }
        }

        if error != 0 {
            sys::connect_abort(stream, socket, registered, lp);
            (*stream).owner.set(ptr::null());
            drop(Box::from_raw(stream));
            return Err(io::Error::from_raw_os_error(error));
        }

        (*stream).reg.set_dispatch(sys::tcp_processor);
        lp.ref_();
    }

    trace!("connected to {}:{}", ip, port);
    Ok(Stream::from_inner(inner))
}
