//! Error types for tproxy-relay
//!
//! This module defines the error hierarchy for the transparent relay.
//! Errors are grouped by subsystem and classified so that callers can tell
//! a misconfigured host apart from an unreachable destination.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for tproxy-relay
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TPROXY listener and dialer errors
    #[error("TPROXY error: {0}")]
    Tproxy(#[from] TproxyError),

    /// Relay errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// Check if this error is recoverable (the service can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Tproxy(e) => e.is_recoverable(),
            Self::Relay(_) => true,
            Self::Io(e) => is_transient_io(e),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Coarse classification of [`TproxyError`]s.
///
/// Each category maps to a distinct operational cause: a host that lacks
/// privileges or routing setup, a destination that cannot be reached, or a
/// listener that was shut down on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A kernel option or socket could not be set up
    Configuration,
    /// The address is not IPv4-representable
    UnsupportedAddressFamily,
    /// Connect to the original destination failed
    DestinationUnreachable,
    /// The listener was closed
    ListenerClosed,
    /// Accepting a connection failed
    Accept,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::UnsupportedAddressFamily => write!(f, "unsupported-address-family"),
            Self::DestinationUnreachable => write!(f, "destination-unreachable"),
            Self::ListenerClosed => write!(f, "listener-closed"),
            Self::Accept => write!(f, "accept"),
        }
    }
}

/// TPROXY listener and dialer errors
#[derive(Debug, Error)]
pub enum TproxyError {
    /// Failed to create socket
    #[error("Failed to create TPROXY socket: {0}")]
    SocketCreation(String),

    /// Failed to set socket option (IP_TRANSPARENT, SO_MARK, ...)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to connect to the original destination
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectError { addr: SocketAddr, reason: String },

    /// Address is not IPv4-representable
    #[error("Unsupported address family for {addr}: only IPv4 is supported")]
    UnsupportedFamily { addr: SocketAddr },

    /// Failed to accept connection
    #[error("Accept error: {0}")]
    AcceptError(#[source] io::Error),

    /// Listener was closed
    #[error("Listener closed")]
    ListenerClosed,

    /// Permission denied (CAP_NET_ADMIN required)
    #[error("Permission denied setting {option}: TPROXY requires CAP_NET_ADMIN capability")]
    PermissionDenied { option: String },

    /// I/O error
    #[error("TPROXY I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TproxyError {
    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::SocketCreation(_)
            | Self::SocketOption { .. }
            | Self::BindError { .. }
            | Self::PermissionDenied { .. }
            | Self::IoError(_) => ErrorCategory::Configuration,
            Self::UnsupportedFamily { .. } => ErrorCategory::UnsupportedAddressFamily,
            Self::ConnectError { .. } => ErrorCategory::DestinationUnreachable,
            Self::ListenerClosed => ErrorCategory::ListenerClosed,
            Self::AcceptError(_) => ErrorCategory::Accept,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Accept errors are recoverable only when the OS reports a transient
    /// condition; everything else on the listener path is fatal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AcceptError(e) => is_transient_accept(e),
            Self::ConnectError { .. } | Self::UnsupportedFamily { .. } => true,
            Self::SocketCreation(_)
            | Self::SocketOption { .. }
            | Self::BindError { .. }
            | Self::ListenerClosed
            | Self::PermissionDenied { .. } => false,
            Self::IoError(e) => is_transient_io(e),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a socket option error, mapping `EPERM` to [`TproxyError::PermissionDenied`]
    pub fn from_option_error(option: &str, err: &io::Error) -> Self {
        if err.raw_os_error() == Some(libc::EPERM) {
            return Self::PermissionDenied {
                option: option.into(),
            };
        }
        Self::socket_option(option, err.to_string())
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a connect error
    pub fn connect(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Relay direction, used to tag relay errors and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Intercepted client -> original destination
    ClientToUpstream,
    /// Original destination -> intercepted client
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => write!(f, "client->upstream"),
            Self::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Errors raised by one direction of a relay session
#[derive(Debug, Error)]
pub enum RelayError {
    /// No read or write progress within the idle timeout
    #[error("{direction}: idle for {:.1}s", .idle.as_secs_f64())]
    Timeout { direction: Direction, idle: Duration },

    /// Read or write failure
    #[error("{direction}: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// The copy task panicked or was cancelled
    #[error("{direction}: copy task aborted: {reason}")]
    Aborted { direction: Direction, reason: String },
}

impl RelayError {
    /// Direction this error happened on
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Timeout { direction, .. }
            | Self::Io { direction, .. }
            | Self::Aborted { direction, .. } => *direction,
        }
    }

    /// Whether this error is an idle timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

/// Accept failures that do not mean the listening socket is broken
fn is_transient_accept(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Type alias for Result with RouterError
pub type Result<T> = std::result::Result<T, RouterError>;
