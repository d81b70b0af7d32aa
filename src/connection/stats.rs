//! Relay statistics tracking
//!
//! Lock-free counters shared by every connection handler. A connection is
//! counted once when accepted and once more when it ends, with a
//! [`SessionEnd`] saying how.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::io::CopyResult;

/// How an accepted connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Both directions reached EOF
    Completed,
    /// At least one direction failed or timed out
    Errored,
    /// The original destination could not be dialed
    DialFailed,
}

/// Atomic relay statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    accepted: AtomicU64,
    /// Accepted and not yet ended
    active: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    dial_failed: AtomicU64,
    /// Dropped before accepting; never counted as active
    rejected: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl ConnectionStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection handed to a handler
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection the server refused to relay
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the end of an accepted connection and the bytes it relayed.
    ///
    /// Bytes moved before an error still count.
    pub fn record_end(&self, end: SessionEnd, bytes: CopyResult) {
        let counter = match end {
            SessionEnd::Completed => &self.completed,
            SessionEnd::Errored => &self.errored,
            SessionEnd::DialFailed => &self.dial_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(bytes.client_to_upstream, Ordering::Relaxed);
        self.bytes_down.fetch_add(bytes.upstream_to_client, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Connections accepted and not yet ended
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Copy every counter
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            total_accepted: load(&self.accepted),
            active: load(&self.active),
            completed: load(&self.completed),
            errored: load(&self.errored),
            dial_failed: load(&self.dial_failed),
            rejected: load(&self.rejected),
            bytes_up: load(&self.bytes_up),
            bytes_down: load(&self.bytes_down),
            timestamp_ms: unix_millis(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_accepted: u64,
    pub active: u64,
    pub completed: u64,
    pub errored: u64,
    pub dial_failed: u64,
    pub rejected: u64,
    /// Bytes relayed client -> upstream
    pub bytes_up: u64,
    /// Bytes relayed upstream -> client
    pub bytes_down: u64,
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Bytes relayed in both directions
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Connections that have ended, however they ended
    #[must_use]
    pub const fn ended(&self) -> u64 {
        self.completed + self.errored + self.dial_failed
    }

    /// Percentage (0-100) of ended connections that completed cleanly
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        match self.ended() {
            0 => 100.0,
            ended => self.completed as f64 * 100.0 / ended as f64,
        }
    }
}
