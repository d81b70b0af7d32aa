//! Relay session between an intercepted client and its upstream
//!
//! A session owns both streams. Each direction runs in its own task over
//! split halves; the session joins both tasks, reunites the halves and drops
//! each stream once.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::copy::{copy_with_idle_timeout, CopyResult, DirectionReport, DEFAULT_BUFFER_SIZE};
use crate::error::{Direction, RelayError};

/// Lifecycle of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet running
    Idle,
    /// Both directions are copying
    Relaying,
    /// One direction has finished, waiting for the other
    Draining,
    /// Both directions finished and both streams are closed
    Closed,
}

/// Outcome of a finished session
#[derive(Debug)]
pub struct SessionReport {
    /// Client -> upstream direction
    pub client_to_upstream: DirectionReport,
    /// Upstream -> client direction
    pub upstream_to_client: DirectionReport,
    /// Wall time from start to close
    pub duration: Duration,
}

impl SessionReport {
    /// Bytes relayed in each direction
    #[must_use]
    pub const fn copy_result(&self) -> CopyResult {
        CopyResult {
            client_to_upstream: self.client_to_upstream.bytes,
            upstream_to_client: self.upstream_to_client.bytes,
        }
    }

    /// Whether both directions ran to EOF
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.client_to_upstream.is_ok() && self.upstream_to_client.is_ok()
    }

    /// Errors recorded by either direction
    pub fn errors(&self) -> impl Iterator<Item = &RelayError> {
        self.client_to_upstream
            .error
            .iter()
            .chain(self.upstream_to_client.error.iter())
    }

    /// Convert into a `Result`, returning the first direction's error if any.
    ///
    /// # Errors
    ///
    /// Returns the client -> upstream error first, then the upstream -> client one.
    pub fn into_result(self) -> Result<CopyResult, RelayError> {
        let result = self.copy_result();
        match (self.client_to_upstream.error, self.upstream_to_client.error) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Ok(result),
        }
    }
}

/// A bidirectional relay between two streams
#[derive(Debug)]
pub struct RelaySession<A, B> {
    client: A,
    upstream: B,
    idle_timeout: Duration,
    buffer_size: usize,
    state: watch::Sender<SessionState>,
}

type DirectionTask<R, W> = JoinHandle<(R, W, DirectionReport)>;

impl<A, B> RelaySession<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session over `client` and `upstream`.
    pub fn new(client: A, upstream: B, idle_timeout: Duration) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            client,
            upstream,
            idle_timeout,
            buffer_size: DEFAULT_BUFFER_SIZE,
            state,
        }
    }

    /// Set the copy buffer size per direction.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Watch the session state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Relay until both directions finish, then close both streams.
    ///
    /// A failure in one direction does not cancel the other.
    pub async fn run(self) -> SessionReport {
        let Self {
            client,
            upstream,
            idle_timeout,
            buffer_size,
            state,
        } = self;

        let started = Instant::now();
        state.send_replace(SessionState::Relaying);

        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let mut c2u = spawn_direction(
            client_read,
            upstream_write,
            Direction::ClientToUpstream,
            idle_timeout,
            buffer_size,
        );
        let mut u2c = spawn_direction(
            upstream_read,
            client_write,
            Direction::UpstreamToClient,
            idle_timeout,
            buffer_size,
        );

        let ((c2u_halves, client_to_upstream), (u2c_halves, upstream_to_client)) = tokio::select! {
            res = &mut c2u => {
                let first = finish_direction(res, Direction::ClientToUpstream);
                state.send_replace(SessionState::Draining);
                (first, finish_direction((&mut u2c).await, Direction::UpstreamToClient))
            }
            res = &mut u2c => {
                let first = finish_direction(res, Direction::UpstreamToClient);
                state.send_replace(SessionState::Draining);
                (finish_direction((&mut c2u).await, Direction::ClientToUpstream), first)
            }
        };

        // Reunite and close each stream once. Halves of a panicked task were
        // already dropped with it.
        if let (Some((client_read, upstream_write)), Some((upstream_read, client_write))) =
            (c2u_halves, u2c_halves)
        {
            drop(client_read.unsplit(client_write));
            drop(upstream_read.unsplit(upstream_write));
        }

        state.send_replace(SessionState::Closed);

        SessionReport {
            client_to_upstream,
            upstream_to_client,
            duration: started.elapsed(),
        }
    }
}

fn spawn_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    idle: Duration,
    buf_size: usize,
) -> DirectionTask<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let report = copy_with_idle_timeout(&mut reader, &mut writer, direction, idle, buf_size).await;
        (reader, writer, report)
    })
}

#[allow(clippy::type_complexity)]
fn finish_direction<R, W>(
    res: Result<(R, W, DirectionReport), tokio::task::JoinError>,
    direction: Direction,
) -> (Option<(R, W)>, DirectionReport) {
    match res {
        Ok((reader, writer, report)) => {
            match &report.error {
                None => debug!("{} finished: {} bytes", direction, report.bytes),
                Some(e) if e.is_timeout() => debug!("{} ({} bytes)", e, report.bytes),
                Some(e) => warn!("Relay error: {} ({} bytes)", e, report.bytes),
            }
            (Some((reader, writer)), report)
        }
        Err(e) => {
            let error = RelayError::Aborted {
                direction,
                reason: e.to_string(),
            };
            warn!("Relay error: {}", error);
            (
                None,
                DirectionReport {
                    direction,
                    bytes: 0,
                    error: Some(error),
                },
            )
        }
    }
}
