//! I/O utilities for tproxy-relay
//!
//! This module provides the relay session that pipes an intercepted
//! connection to its upstream, and the idle-bounded copy loop it runs in
//! each direction.

mod copy;
mod session;

pub use copy::{copy_with_idle_timeout, CopyResult, DirectionReport, DEFAULT_BUFFER_SIZE};
pub use session::{RelaySession, SessionReport, SessionState};
