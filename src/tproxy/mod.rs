//! TPROXY module for transparent proxying
//!
//! This module provides the socket-level half of the relay: the transparent
//! listener, the intercepted connection type, and the dialer that reopens
//! each connection towards its original destination.
//!
//! # Overview
//!
//! TPROXY (transparent proxy) is a Linux kernel feature that allows a proxy
//! to intercept connections destined for any address without requiring any
//! client-side configuration. An accepted connection keeps its addresses:
//! the local address is the destination the client dialed and the peer
//! address is the client.
//!
//! # IPv4 Only
//!
//! Only `AF_INET` socket addresses are built. IPv4-mapped IPv6 addresses are
//! accepted; any other IPv6 address fails with
//! [`TproxyError::UnsupportedFamily`](crate::error::TproxyError::UnsupportedFamily).
//!
//! # Requirements
//!
//! - Linux kernel with TPROXY support (`xt_TPROXY`, `xt_socket`)
//! - `CAP_NET_ADMIN` capability (or root) for `IP_TRANSPARENT` and `SO_MARK`
//!
//! ## Example iptables Setup
//!
//! Outbound sockets carry `SO_MARK` 123 by default. The policy rules must
//! route that mark through the main table, otherwise the relay's own traffic
//! is intercepted again.
//!
//! ```bash
//! # Deliver TPROXY-marked packets locally
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//!
//! # Let the relay's own connections out
//! iptables -t mangle -A PREROUTING -m mark --mark 123 -j RETURN
//! iptables -t mangle -A OUTPUT -m mark --mark 123 -j RETURN
//!
//! # Established transparent sockets
//! iptables -t mangle -N DIVERT
//! iptables -t mangle -A DIVERT -j MARK --set-mark 0x1
//! iptables -t mangle -A DIVERT -j ACCEPT
//! iptables -t mangle -A PREROUTING -p tcp -m socket --transparent -j DIVERT
//!
//! # New connections
//! iptables -t mangle -A PREROUTING -p tcp --dport 80 -j TPROXY \
//!     --on-port 9000 --tproxy-mark 0x1
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use tproxy_relay::config::{DialConfig, ListenConfig};
//! use tproxy_relay::tproxy::{OriginalDestinationDialer, TransparentListener};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TransparentListener::bind(&ListenConfig::default(), 123)?;
//! let dialer = OriginalDestinationDialer::new(&DialConfig::default());
//!
//! let conn = listener.accept().await?;
//! let outbound = dialer.dial(&conn, true).await?;
//! println!("{} -> {} via {}", conn.client_addr(), conn.original_dst(), outbound.local_addr);
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod connection;
pub mod dialer;
pub mod listener;
pub mod socket;

pub use addr::{family_for, ipv4_of, to_socket_addr, AddressFamily};
pub use connection::InterceptedConnection;
pub use dialer::{OriginalDestinationDialer, OutboundConnection};
pub use listener::TransparentListener;
pub use socket::{
    default_socket_ops, has_net_admin_capability, ip_transparent_enabled, is_local_address,
    is_root, set_ip_transparent, set_routing_mark, RealSocketOps, SocketOps, IP_TRANSPARENT,
    SO_MARK,
};
