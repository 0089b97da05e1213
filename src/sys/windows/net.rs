use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};

use windows_sys::Win32::Networking::WinSock::{
    bind as wsa_bind, closesocket, connect as wsa_connect, getsockname, getsockopt, htons,
    listen as wsa_listen, setsockopt, WSACleanup, WSAGetLastError, WSASocketW, WSAStartup,
    AF_INET, AF_INET6, IN6_ADDR, INVALID_SOCKET as WSA_INVALID_SOCKET, IN_ADDR, IPPROTO_TCP,
    SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOCK_STREAM,
    SOL_SOCKET, SO_ERROR, SO_RCVBUF, SO_SNDBUF, TCP_NODELAY, WSADATA,
    WSA_FLAG_NO_HANDLE_INHERIT, WSA_FLAG_OVERLAPPED,
};

pub(crate) type Socket = SOCKET;

/// A resolved socket address, opaque to the portable layer.
pub(crate) struct RawAddr {
    storage: SOCKADDR_STORAGE,
    length: i32,
    pub(crate) family: i32,
}

impl RawAddr {
    pub(crate) fn as_ptr(&self) -> *const SOCKADDR {
        &self.storage as *const SOCKADDR_STORAGE as *const SOCKADDR
    }

    pub(crate) fn len(&self) -> i32 {
        self.length
    }
}

fn wsa_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

/// Parse `ip` into a socket address. IPv6 is recognized by the presence of
/// `:` in the literal, everything else is treated as IPv4 dotted quad.
pub(crate) fn socket_address(ip: &str, port: u16) -> io::Result<RawAddr> {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };

    if !ip.contains(':') {
        let addr: Ipv4Addr = ip
            .parse()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let mut sin: SOCKADDR_IN = unsafe { mem::zeroed() };
        sin.sin_family = AF_INET;
        sin.sin_port = unsafe { htons(port) };
        sin.sin_addr = IN_ADDR {
            S_un: unsafe { mem::transmute(u32::from(addr).to_be()) },
        };
        unsafe {
            (&mut storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR_IN).write(sin);
        }

        Ok(RawAddr {
            storage,
            length: mem::size_of::<SOCKADDR_IN>() as i32,
            family: AF_INET as i32,
        })
    } else {
        let addr: Ipv6Addr = ip
            .parse()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let mut sin6: SOCKADDR_IN6 = unsafe { mem::zeroed() };
        sin6.sin6_family = AF_INET6;
        sin6.sin6_port = unsafe { htons(port) };
        sin6.sin6_addr = IN6_ADDR {
            u: unsafe { mem::transmute(addr.octets()) },
        };
        unsafe {
            (&mut storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR_IN6).write(sin6);
        }

        Ok(RawAddr {
            storage,
            length: mem::size_of::<SOCKADDR_IN6>() as i32,
            family: AF_INET6 as i32,
        })
    }
}

/// An overlapped-capable, non-inheritable stream socket.
pub(crate) fn new_socket(family: i32) -> io::Result<Socket> {
    let socket = unsafe {
        WSASocketW(
            family,
            SOCK_STREAM as i32,
            IPPROTO_TCP,
            std::ptr::null(),
            0,
            WSA_FLAG_OVERLAPPED | WSA_FLAG_NO_HANDLE_INHERIT,
        )
    };
    if socket == WSA_INVALID_SOCKET {
        return Err(wsa_error());
    }
    Ok(socket)
}

/// Options applied to every stream socket, listening, accepted or
/// connecting: defer the send/receive buffer sizing to the kernel and
/// disable Nagle.
pub(crate) fn apply_socket_options(socket: Socket) -> io::Result<()> {
    let zero: i32 = 0;
    let enable: i32 = 1;

    unsafe {
        for (level, name, value) in [
            (SOL_SOCKET as i32, SO_SNDBUF as i32, &zero),
            (SOL_SOCKET as i32, SO_RCVBUF as i32, &zero),
            (IPPROTO_TCP, TCP_NODELAY as i32, &enable),
        ] {
            if setsockopt(
                socket,
                level,
                name,
                value as *const i32 as *const u8,
                mem::size_of::<i32>() as i32,
            ) == SOCKET_ERROR
            {
                return Err(wsa_error());
            }
        }
    }

    Ok(())
}

pub(crate) fn bind(socket: Socket, address: &RawAddr) -> io::Result<()> {
    if unsafe { wsa_bind(socket, address.as_ptr(), address.len()) } == SOCKET_ERROR {
        return Err(wsa_error());
    }
    Ok(())
}

/// Bind to the wildcard address of `family`; `ConnectEx` requires a bound
/// socket.
pub(crate) fn bind_any(socket: Socket, family: i32) -> io::Result<()> {
    let address = if family == AF_INET6 as i32 {
        socket_address("::", 0)?
    } else {
        socket_address("0.0.0.0", 0)?
    };
    bind(socket, &address)
}

pub(crate) fn listen(socket: Socket, backlog: i32) -> io::Result<()> {
    if unsafe { wsa_listen(socket, backlog) } == SOCKET_ERROR {
        return Err(wsa_error());
    }
    Ok(())
}

/// Plain (non-overlapped) connect; only used to classify immediate
/// failures, the overlapped path goes through `ConnectEx`.
pub(crate) fn connect(socket: Socket, address: &RawAddr) -> io::Result<()> {
    if unsafe { wsa_connect(socket, address.as_ptr(), address.len()) } == SOCKET_ERROR {
        return Err(wsa_error());
    }
    Ok(())
}

/// Local port a bound socket ended up with, for `listen(.., 0, ..)`.
pub(crate) fn local_port(socket: Socket) -> io::Result<u16> {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let mut length = mem::size_of::<SOCKADDR_STORAGE>() as i32;

    let res = unsafe {
        getsockname(
            socket,
            &mut storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR,
            &mut length,
        )
    };
    if res == SOCKET_ERROR {
        return Err(wsa_error());
    }

    if storage.ss_family == AF_INET6 {
        let sin6 = unsafe { &*(&storage as *const SOCKADDR_STORAGE as *const SOCKADDR_IN6) };
        Ok(u16::from_be(sin6.sin6_port))
    } else {
        let sin = unsafe { &*(&storage as *const SOCKADDR_STORAGE as *const SOCKADDR_IN) };
        Ok(u16::from_be(sin.sin_port))
    }
}

/// Pending error on a socket, consumed by reading `SO_ERROR`.
pub(crate) fn socket_error(socket: Socket) -> i32 {
    let mut error: i32 = 0;
    let mut length = mem::size_of::<i32>() as i32;

    let res = unsafe {
        getsockopt(
            socket,
            SOL_SOCKET as i32,
            SO_ERROR as i32,
            &mut error as *mut i32 as *mut u8,
            &mut length,
        )
    };
    if res == SOCKET_ERROR {
        return unsafe { WSAGetLastError() };
    }

    error
}

pub(crate) fn close_socket(socket: Socket) -> io::Result<()> {
    if unsafe { closesocket(socket) } == SOCKET_ERROR {
        return Err(wsa_error());
    }
    Ok(())
}

/// `WSAStartup`, once per process via the run harness.
pub(crate) fn net_init() -> io::Result<()> {
    let mut data: WSADATA = unsafe { mem::zeroed() };
    let code = unsafe { WSAStartup(0x0202, &mut data) };
    if code != 0 {
        return Err(io::Error::from_raw_os_error(code));
    }
    Ok(())
}

/// Mirror of `net_init`, called by the run harness on the way out.
pub(crate) fn net_cleanup() {
    unsafe { WSACleanup() };
}
