//! One-way copy with an idle timeout
//!
//! This module provides the per-direction copy loop used by relay sessions.
//! Every read and every write is bounded by the idle timeout, so a peer that
//! stops sending or stops draining its receive window ends the direction
//! instead of pinning the task forever.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Direction, RelayError};

/// Default copy buffer size (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Result of a bidirectional copy operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Outcome of one relay direction
#[derive(Debug)]
pub struct DirectionReport {
    /// Which way the bytes flowed
    pub direction: Direction,
    /// Bytes written to the destination
    pub bytes: u64,
    /// Why the direction stopped early, if it did
    pub error: Option<RelayError>,
}

impl DirectionReport {
    /// Whether the direction ran to EOF
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Copy from `reader` to `writer` until EOF, an error, or an idle timeout.
///
/// On EOF the writer is shut down so the peer sees the half-close. On error
/// the writer is left as is; the caller owns closing it.
pub async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    idle: Duration,
    buf_size: usize,
) -> DirectionReport
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buf_size].into_boxed_slice();
    let mut bytes = 0u64;

    let error = loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break None,
            Ok(Ok(n)) => n,
            Ok(Err(source)) => break Some(RelayError::Io { direction, source }),
            Err(_) => break Some(RelayError::Timeout { direction, idle }),
        };

        if let Err(e) = write_all_with_idle_timeout(writer, &buf[..n], direction, idle).await {
            break Some(e);
        }
        bytes += n as u64;
        trace!("{}: relayed {} bytes", direction, n);
    };

    if error.is_none() {
        match timeout(idle, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: shutdown after EOF failed: {}", direction, e),
            Err(_) => debug!("{}: shutdown after EOF timed out", direction),
        }
    }

    DirectionReport {
        direction,
        bytes,
        error,
    }
}

async fn write_all_with_idle_timeout<W>(
    writer: &mut W,
    mut data: &[u8],
    direction: Direction,
    idle: Duration,
) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while !data.is_empty() {
        match timeout(idle, writer.write(data)).await {
            Ok(Ok(0)) => {
                return Err(RelayError::Io {
                    direction,
                    source: io::Error::new(io::ErrorKind::WriteZero, "write zero bytes"),
                });
            }
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(source)) => return Err(RelayError::Io { direction, source }),
            Err(_) => return Err(RelayError::Timeout { direction, idle }),
        }
    }
    Ok(())
}
