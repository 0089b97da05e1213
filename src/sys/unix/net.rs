use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;

pub(crate) type Socket = RawFd;

/// A resolved socket address, opaque to the portable layer.
pub(crate) struct RawAddr {
    storage: libc::sockaddr_storage,
    length: libc::socklen_t,
    pub(crate) family: libc::c_int,
}

/// Parse `ip` into a socket address. IPv6 is recognized by the presence of
/// `:` in the literal, everything else is treated as IPv4 dotted quad.
pub(crate) fn socket_address(ip: &str, port: u16) -> io::Result<RawAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    if !ip.contains(':') {
        let addr: Ipv4Addr = ip
            .parse()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(addr).to_be(),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in).write(sin)
        };

        Ok(RawAddr {
            storage,
            length: mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            family: libc::AF_INET,
        })
    } else {
        let addr: Ipv6Addr = ip
            .parse()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let sin6 = libc::sockaddr_in6 {
            sin6_family: libc::AF_INET6 as libc::sa_family_t,
            sin6_port: port.to_be(),
            sin6_flowinfo: 0,
            sin6_addr: libc::in6_addr {
                s6_addr: addr.octets(),
            },
            sin6_scope_id: 0,
        };
        unsafe {
            (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6).write(sin6)
        };

        Ok(RawAddr {
            storage,
            length: mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            family: libc::AF_INET6,
        })
    }
}

pub(crate) fn new_socket(family: libc::c_int) -> io::Result<Socket> {
    syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP,
    ))
}

/// Options applied to every stream socket, listening, accepted or
/// connecting: defer the send/receive buffer sizing to the kernel and
/// disable Nagle.
pub(crate) fn apply_socket_options(socket: Socket) -> io::Result<()> {
    let zero: libc::c_int = 0;
    syscall!(setsockopt(
        socket,
        libc::SOL_SOCKET,
        libc::SO_SNDBUF,
        &zero as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    syscall!(setsockopt(
        socket,
        libc::SOL_SOCKET,
        libc::SO_RCVBUF,
        &zero as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;

    let enable: libc::c_int = 1;
    syscall!(setsockopt(
        socket,
        libc::IPPROTO_TCP,
        libc::TCP_NODELAY,
        &enable as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;

    Ok(())
}

pub(crate) fn bind(socket: Socket, address: &RawAddr) -> io::Result<()> {
    syscall!(bind(
        socket,
        &address.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
        address.length,
    ))
    .map(|_| ())
}

pub(crate) fn listen(socket: Socket, backlog: i32) -> io::Result<()> {
    syscall!(listen(socket, backlog as libc::c_int)).map(|_| ())
}

/// Begin a non-blocking connect; `EINPROGRESS` comes back as an error for
/// the caller to classify.
pub(crate) fn connect(socket: Socket, address: &RawAddr) -> io::Result<()> {
    syscall!(connect(
        socket,
        &address.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
        address.length,
    ))
    .map(|_| ())
}

/// Accept one pending connection, non-blocking and close-on-exec.
pub(crate) fn accept(socket: Socket) -> io::Result<Socket> {
    let mut address: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    syscall!(accept4(
        socket,
        &mut address as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut length,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))
}

/// Local port a bound socket ended up with, for `listen(.., 0, ..)`.
pub(crate) fn local_port(socket: Socket) -> io::Result<u16> {
    let mut address: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    syscall!(getsockname(
        socket,
        &mut address as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut length,
    ))?;

    match address.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin =
                unsafe { &*(&address as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Ok(u16::from_be(sin.sin_port))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(&address as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            Ok(u16::from_be(sin6.sin6_port))
        }
        _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
    }
}

/// TCP subsystem bring-up; nothing to do on this platform.
pub(crate) fn net_init() -> io::Result<()> {
    Ok(())
}

/// Mirror of `net_init`, called by the run harness on the way out.
pub(crate) fn net_cleanup() {}

/// Pending error on a socket, consumed by reading `SO_ERROR`.
pub(crate) fn socket_error(socket: Socket) -> i32 {
    let mut error: libc::c_int = 0;
    let mut length = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let res = unsafe {
        libc::getsockopt(
            socket,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut libc::c_void,
            &mut length,
        )
    };
    if res == -1 {
        return super::errno();
    }

    error
}
