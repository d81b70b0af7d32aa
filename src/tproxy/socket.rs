//! TPROXY socket utilities
//!
//! This module provides low-level socket operations for TPROXY transparent proxying.
//! Key capabilities:
//! - `IP_TRANSPARENT`: Allows binding to non-local addresses and accepting
//!   connections addressed to any destination
//! - `SO_MARK`: Tags outbound packets so policy routing does not send them
//!   back into the TPROXY table
//!
//! # Socket Ops Trait
//!
//! For testability, every syscall the listener and dialer issue goes through
//! the [`SocketOps`] trait. Production code uses [`RealSocketOps`], while
//! tests substitute a recording implementation that does not need
//! `CAP_NET_ADMIN`.

use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use super::addr::AddressFamily;

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level)
/// Allows the socket to:
/// 1. Bind to non-local addresses
/// 2. Accept TPROXY-redirected connections
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `SO_MARK` socket option (`SOL_SOCKET` level)
pub const SO_MARK: libc::c_int = libc::SO_MARK;

// =============================================================================
// Socket Ops Trait
// =============================================================================

/// The socket syscalls issued while building TPROXY sockets.
///
/// Implementations must not reorder or merge calls: the listener and dialer
/// depend on each call reaching the kernel in the order it is made.
pub trait SocketOps: Send + Sync {
    /// Create a new TCP stream socket.
    fn open_stream(&self, family: AddressFamily) -> io::Result<Socket>;

    /// Set `SO_MARK`.
    fn set_mark(&self, socket: &Socket, mark: u32) -> io::Result<()>;

    /// Set `SO_REUSEADDR`.
    fn set_reuse_address(&self, socket: &Socket) -> io::Result<()>;

    /// Set `IP_TRANSPARENT`.
    fn set_transparent(&self, socket: &Socket) -> io::Result<()>;

    /// Switch between blocking and non-blocking mode.
    fn set_nonblocking(&self, socket: &Socket, nonblocking: bool) -> io::Result<()>;

    /// Bind the socket to a local address.
    fn bind(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()>;

    /// Start listening.
    fn listen(&self, socket: &Socket, backlog: i32) -> io::Result<()>;

    /// Connect the socket. A non-blocking socket may fail with `EINPROGRESS`.
    fn connect(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()>;
}

/// Socket ops that issue the real syscalls.
///
/// Setting `IP_TRANSPARENT` and `SO_MARK` requires `CAP_NET_ADMIN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealSocketOps;

impl RealSocketOps {
    /// Create a new real socket ops handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SocketOps for RealSocketOps {
    fn open_stream(&self, family: AddressFamily) -> io::Result<Socket> {
        Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))
    }

    fn set_mark(&self, socket: &Socket, mark: u32) -> io::Result<()> {
        set_routing_mark(socket, mark)
    }

    fn set_reuse_address(&self, socket: &Socket) -> io::Result<()> {
        socket.set_reuse_address(true)
    }

    fn set_transparent(&self, socket: &Socket) -> io::Result<()> {
        set_ip_transparent(socket)
    }

    fn set_nonblocking(&self, socket: &Socket, nonblocking: bool) -> io::Result<()> {
        socket.set_nonblocking(nonblocking)
    }

    fn bind(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()> {
        socket.bind(addr)
    }

    fn listen(&self, socket: &Socket, backlog: i32) -> io::Result<()> {
        socket.listen(backlog)
    }

    fn connect(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()> {
        socket.connect(addr)
    }
}

/// Get the default socket ops (production implementation).
#[must_use]
pub fn default_socket_ops() -> Arc<dyn SocketOps> {
    Arc::new(RealSocketOps::new())
}

// =============================================================================
// Raw socket options
// =============================================================================

/// Set `IP_TRANSPARENT` on a socket.
///
/// # Errors
///
/// Returns the OS error; `EPERM` means `CAP_NET_ADMIN` is missing.
pub fn set_ip_transparent(socket: &Socket) -> io::Result<()> {
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            IP_TRANSPARENT,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Read back `IP_TRANSPARENT` from a socket.
///
/// # Errors
///
/// Returns the OS error if getsockopt fails.
pub fn ip_transparent_enabled(socket: &Socket) -> io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            IP_TRANSPARENT,
            std::ptr::addr_of_mut!(value).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(value != 0)
}

/// Set `SO_MARK` for policy routing.
///
/// # Errors
///
/// Returns the OS error; `EPERM` means `CAP_NET_ADMIN` is missing.
pub fn set_routing_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    debug!("Set routing mark: {}", mark);
    Ok(())
}

/// Check if the current process has `CAP_NET_ADMIN` capability.
///
/// Probes by setting `IP_TRANSPARENT` on a throwaway socket.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    let Ok(socket) = RealSocketOps.open_stream(AddressFamily::Ipv4) else {
        // Can't tell without a socket; let the real setup report the error
        return true;
    };

    match set_ip_transparent(&socket) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() != Some(libc::EPERM),
    }
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check whether `ip` is assigned to this host.
///
/// Binds a plain socket, without `IP_TRANSPARENT`, to `ip:0`. The kernel
/// refuses addresses it does not own with `EADDRNOTAVAIL`.
///
/// # Errors
///
/// Returns the OS error if the scratch socket cannot be created, or if bind
/// fails for any reason other than the address being foreign.
pub fn is_local_address(ip: IpAddr) -> io::Result<bool> {
    let socket = Socket::new(Domain::for_address(SocketAddr::new(ip, 0)), Type::STREAM, None)?;
    match socket.bind(&SocketAddr::new(ip, 0).into()) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) => Ok(false),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Recording Socket Ops (for testing)
// =============================================================================

/// A socket call observed by [`RecordingSocketOps`].
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCall {
    Open(AddressFamily),
    SetMark(u32),
    SetReuseAddress,
    SetTransparent,
    SetNonblocking(bool),
    Bind(std::net::SocketAddr),
    Listen(i32),
    Connect(std::net::SocketAddr),
}

#[cfg(test)]
impl SocketCall {
    /// Name used to select a call for failure injection
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "socket",
            Self::SetMark(_) => "SO_MARK",
            Self::SetReuseAddress => "SO_REUSEADDR",
            Self::SetTransparent => "IP_TRANSPARENT",
            Self::SetNonblocking(_) => "O_NONBLOCK",
            Self::Bind(_) => "bind",
            Self::Listen(_) => "listen",
            Self::Connect(_) => "connect",
        }
    }
}

/// Socket ops for tests without `CAP_NET_ADMIN`.
///
/// Records every call. `SO_MARK` and `IP_TRANSPARENT` are recorded but not
/// issued; all other calls go to the real syscalls, so tests must use
/// locally owned (loopback) addresses. A single call can be made to fail with
/// a chosen errno.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSocketOps {
    calls: std::sync::Mutex<Vec<SocketCall>>,
    fail: Option<(&'static str, i32)>,
}

#[cfg(test)]
impl RecordingSocketOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the call named `name` (see [`SocketCall::name`]) with `errno`.
    pub fn failing(name: &'static str, errno: i32) -> Self {
        Self {
            calls: std::sync::Mutex::default(),
            fail: Some((name, errno)),
        }
    }

    /// Calls recorded so far
    pub fn calls(&self) -> Vec<SocketCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of the calls recorded so far
    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().iter().map(SocketCall::name).collect()
    }

    fn record(&self, call: SocketCall) -> io::Result<()> {
        let name = call.name();
        self.calls.lock().unwrap().push(call);
        match self.fail {
            Some((failing, errno)) if failing == name => Err(io::Error::from_raw_os_error(errno)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
impl SocketOps for RecordingSocketOps {
    fn open_stream(&self, family: AddressFamily) -> io::Result<Socket> {
        self.record(SocketCall::Open(family))?;
        RealSocketOps.open_stream(family)
    }

    fn set_mark(&self, _socket: &Socket, mark: u32) -> io::Result<()> {
        self.record(SocketCall::SetMark(mark))
    }

    fn set_reuse_address(&self, socket: &Socket) -> io::Result<()> {
        self.record(SocketCall::SetReuseAddress)?;
        RealSocketOps.set_reuse_address(socket)
    }

    fn set_transparent(&self, _socket: &Socket) -> io::Result<()> {
        self.record(SocketCall::SetTransparent)
    }

    fn set_nonblocking(&self, socket: &Socket, nonblocking: bool) -> io::Result<()> {
        self.record(SocketCall::SetNonblocking(nonblocking))?;
        RealSocketOps.set_nonblocking(socket, nonblocking)
    }

    fn bind(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()> {
        let std_addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.record(SocketCall::Bind(std_addr))?;
        RealSocketOps.bind(socket, addr)
    }

    fn listen(&self, socket: &Socket, backlog: i32) -> io::Result<()> {
        self.record(SocketCall::Listen(backlog))?;
        RealSocketOps.listen(socket, backlog)
    }

    fn connect(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()> {
        let std_addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.record(SocketCall::Connect(std_addr))?;
        RealSocketOps.connect(socket, addr)
    }
}
