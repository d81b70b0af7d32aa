//! Address translation between `std::net` and kernel socket addresses
//!
//! Only `AF_INET` socket addresses are built. IPv4-mapped IPv6 addresses
//! (`::ffff:a.b.c.d`) are IPv4-representable and translate to their IPv4
//! form; every other IPv6 address is rejected.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, SockAddr};

use crate::error::TproxyError;

/// Address family of a socket to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// `AF_INET`
    Ipv4,
    /// `AF_INET6`
    Ipv6,
}

impl AddressFamily {
    /// The `socket2` domain for this family
    #[must_use]
    pub const fn domain(self) -> Domain {
        match self {
            Self::Ipv4 => Domain::IPV4,
            Self::Ipv6 => Domain::IPV6,
        }
    }
}

impl From<AddressFamily> for Domain {
    fn from(family: AddressFamily) -> Self {
        family.domain()
    }
}

/// Return the IPv4 form of `ip` if it has one.
#[must_use]
pub fn ipv4_of(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Translate a transport address into an `AF_INET` kernel socket address.
///
/// Address bytes and port are carried over unchanged.
///
/// # Errors
///
/// Returns `TproxyError::UnsupportedFamily` if `addr` is not
/// IPv4-representable.
pub fn to_socket_addr(addr: SocketAddr) -> Result<SockAddr, TproxyError> {
    let ip = ipv4_of(addr.ip()).ok_or(TproxyError::UnsupportedFamily { addr })?;
    Ok(SockAddr::from(SocketAddrV4::new(ip, addr.port())))
}

/// Pick the address family for a new socket connecting `local` to `remote`.
///
/// An explicit family suffix on `network` (`"tcp4"`, `"tcp6"`) wins.
/// Otherwise IPv4 is chosen if either endpoint is IPv4-representable, with a
/// missing endpoint counting as IPv4; IPv6 only when both are IPv6-only.
#[must_use]
pub fn family_for(
    network: &str,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
) -> AddressFamily {
    match network.as_bytes().last() {
        Some(b'4') => return AddressFamily::Ipv4,
        Some(b'6') => return AddressFamily::Ipv6,
        _ => {}
    }

    let is_v4 = |addr: Option<SocketAddr>| addr.map_or(true, |a| ipv4_of(a.ip()).is_some());

    if is_v4(local) || is_v4(remote) {
        AddressFamily::Ipv4
    } else {
        AddressFamily::Ipv6
    }
}
