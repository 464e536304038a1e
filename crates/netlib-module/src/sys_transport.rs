//! `SysTransport` — default `Transport` implementation.
//!
//! Thin libc wrappers over IPv4 stream sockets. Would-block and in-progress
//! error codes are classified here; everything else comes back as the raw
//! `Errno`.
//!
//! Address resolution tries a numeric IPv4 parse first and falls back to
//! the system resolver, which blocks the calling thread.

use std::mem;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use netlib_core::transport::{is_in_progress, is_would_block};
use netlib_core::{AcceptOutcome, ConnectOutcome, Endpoint, Errno, Handle, SendOutcome, Transport};
use tracing::{debug, warn};

// FIONREAD: bytes queued for reading.
nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SOCKET_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        const SOCKET_FLAGS: libc::c_int = 0;
        const SEND_FLAGS: libc::c_int = 0;
    }
}

/// Real sockets via libc.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysTransport;

impl SysTransport {
    pub fn new() -> Self {
        Self
    }
}

fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(ip).to_be(),
    };
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    {
        addr.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    addr
}

fn resolve(endpoint: &Endpoint) -> Result<Ipv4Addr, Errno> {
    if endpoint.is_wildcard() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    if let Ok(ip) = endpoint.address.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (endpoint.address.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|e| {
            warn!(endpoint = %endpoint, error = %e, "name resolution failed");
            Errno::EADDRNOTAVAIL
        })?;
    addrs
        .filter_map(|a| match a {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| {
            warn!(endpoint = %endpoint, "no IPv4 address for host");
            Errno::EADDRNOTAVAIL
        })
}

fn endpoint_of(addr: &libc::sockaddr_in) -> Endpoint {
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    Endpoint::from((ip, u16::from_be(addr.sin_port)))
}

fn setsockopt_int(
    handle: Handle,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> Result<(), Errno> {
    let ret = unsafe {
        libc::setsockopt(
            handle.raw(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    Errno::result(ret).map(drop)
}

impl Transport for SysTransport {
    fn create_stream_socket(&self) -> Result<Handle, Errno> {
        let fd = Errno::result(unsafe {
            libc::socket(libc::AF_INET, libc::SOCK_STREAM | SOCKET_FLAGS, 0)
        })?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            // No MSG_NOSIGNAL here; suppress SIGPIPE per socket instead.
            let _ = setsockopt_int(Handle(fd), libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
        }
        Ok(Handle(fd))
    }

    fn set_non_blocking(&self, handle: Handle) -> Result<(), Errno> {
        let flags = Errno::result(unsafe { libc::fcntl(handle.raw(), libc::F_GETFL) })?;
        Errno::result(unsafe { libc::fcntl(handle.raw(), libc::F_SETFL, flags | libc::O_NONBLOCK) })
            .map(drop)
    }

    fn set_reuse_addr(&self, handle: Handle) -> Result<(), Errno> {
        setsockopt_int(handle, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
    }

    fn set_no_delay(&self, handle: Handle) -> Result<(), Errno> {
        setsockopt_int(handle, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
    }

    fn set_send_buf(&self, handle: Handle, size: u32) -> Result<(), Errno> {
        setsockopt_int(handle, libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
    }

    fn set_recv_buf(&self, handle: Handle, size: u32) -> Result<(), Errno> {
        setsockopt_int(handle, libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
    }

    fn bind(&self, handle: Handle, endpoint: &Endpoint) -> Result<(), Errno> {
        let addr = sockaddr_in(resolve(endpoint)?, endpoint.port);
        let ret = unsafe {
            libc::bind(
                handle.raw(),
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        Errno::result(ret).map(drop)
    }

    fn listen(&self, handle: Handle, backlog: i32) -> Result<(), Errno> {
        Errno::result(unsafe { libc::listen(handle.raw(), backlog) }).map(drop)
    }

    fn connect(&self, handle: Handle, endpoint: &Endpoint) -> Result<ConnectOutcome, Errno> {
        let addr = sockaddr_in(resolve(endpoint)?, endpoint.port);
        let ret = unsafe {
            libc::connect(
                handle.raw(),
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            return Ok(ConnectOutcome::Connected);
        }
        let errno = Errno::last();
        if is_in_progress(errno) {
            Ok(ConnectOutcome::InProgress)
        } else {
            debug!(handle = %handle, endpoint = %endpoint, errno = %errno, "connect(2) failed");
            Err(errno)
        }
    }

    fn accept(&self, handle: Handle) -> Result<AcceptOutcome, Errno> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                handle.raw(),
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            let errno = Errno::last();
            if is_would_block(errno) {
                return Ok(AcceptOutcome::WouldBlock);
            }
            debug!(handle = %handle, errno = %errno, "accept(2) failed");
            return Err(errno);
        }
        Ok(AcceptOutcome::Accepted(Handle(fd), endpoint_of(&addr)))
    }

    fn send(&self, handle: Handle, data: &[u8]) -> Result<SendOutcome, Errno> {
        let n = unsafe {
            libc::send(
                handle.raw(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                SEND_FLAGS,
            )
        };
        if n >= 0 {
            return Ok(SendOutcome::Written(n as usize));
        }
        let errno = Errno::last();
        if is_would_block(errno) {
            Ok(SendOutcome::WouldBlock)
        } else {
            debug!(handle = %handle, errno = %errno, "send(2) failed");
            Err(errno)
        }
    }

    fn recv(&self, handle: Handle, max_len: usize) -> Result<Vec<u8>, Errno> {
        let mut buf = vec![0u8; max_len];
        let n = unsafe {
            libc::recv(
                handle.raw(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(buf);
        }
        let errno = Errno::last();
        if is_would_block(errno) {
            Ok(Vec::new())
        } else {
            debug!(handle = %handle, errno = %errno, "recv(2) failed");
            Err(errno)
        }
    }

    fn available_bytes(&self, handle: Handle) -> Result<usize, Errno> {
        let mut avail: libc::c_int = 0;
        unsafe { fionread(handle.raw(), &mut avail) }?;
        Ok(avail.max(0) as usize)
    }

    fn socket_error(&self, handle: Handle) -> Result<(), Errno> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                handle.raw(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        Errno::result(ret)?;
        if err == 0 {
            Ok(())
        } else {
            Err(Errno::from_raw(err))
        }
    }

    fn local_endpoint(&self, handle: Handle) -> Result<Endpoint, Errno> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        Errno::result(unsafe {
            libc::getsockname(
                handle.raw(),
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok(endpoint_of(&addr))
    }

    fn close(&self, handle: Handle) {
        if unsafe { libc::close(handle.raw()) } < 0 {
            debug!(handle = %handle, errno = %Errno::last(), "close(2) failed");
        }
    }
}
