//! One-directional byte relay
//!
//! A connection is served by two relays, client to upstream and upstream to
//! client. They share a [`ConnectionLink`], which is the only way one
//! direction can stop the other: shutting down both sockets makes the paired
//! relay's pending read or write return, and it winds down on its own.
//!
//! When an idle timeout is configured every read and every write gets a
//! deadline of `now + idle`. Activity in either direction counts, so a
//! long download with a silent client is not cut off.

use socket2::SockRef;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::accounting::SlotUnit;
use crate::registry::RuleRegistry;
use crate::TIMEOUT_TARGET;

/// Copy buffer size per direction
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// State shared by the two relay directions of one connection
#[derive(Debug)]
pub struct ConnectionLink {
    /// Duplicated handles used only to shut the sockets down
    sockets: Vec<socket2::Socket>,
    closed: AtomicBool,
    created: Instant,
    /// Milliseconds after `created` of the latest completed read or write
    last_activity_ms: AtomicU64,
}

impl ConnectionLink {
    /// Link the inbound and upstream sockets of a connection
    pub fn new(inbound: &TcpStream, upstream: &TcpStream) -> io::Result<Self> {
        let sockets = vec![
            SockRef::from(inbound).try_clone()?,
            SockRef::from(upstream).try_clone()?,
        ];
        Ok(Self::with_sockets(sockets))
    }

    fn with_sockets(sockets: Vec<socket2::Socket>) -> Self {
        Self {
            sockets,
            closed: AtomicBool::new(false),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Shut down both sockets. Safe to call from both relays and more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for socket in &self.sockets {
            // The peer may already be gone; NotConnected is expected here
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record activity now
    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the latest read or write in either direction
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.created.elapsed().saturating_sub(last)
    }
}

/// Why a relay stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// Source reached end of stream
    Eof,
    /// No activity for the idle timeout
    TimedOut,
    /// The socket was shut down under us, usually by the paired relay
    Closed(io::Error),
    /// Any other I/O failure
    Io(io::Error),
}

impl RelayEnd {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => RelayEnd::TimedOut,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => RelayEnd::Closed(err),
            _ => RelayEnd::Io(err),
        }
    }
}

/// Result of one relay direction
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes successfully written to the destination
    pub written: u64,
    pub end: RelayEnd,
}

/// Relay direction, used in log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Everything a relay task needs besides its two socket halves
pub(crate) struct RelayContext {
    pub registry: Arc<RuleRegistry>,
    pub link: Arc<ConnectionLink>,
    pub unit: SlotUnit,
    pub idle_timeout: Option<Duration>,
    pub direction: Direction,
    pub peer: SocketAddr,
}

/// Run one direction to completion and settle its accounting
///
/// Whatever ended the copy, both sockets are shut down, the written bytes are
/// charged to the rule and this direction's live unit is released.
pub(crate) async fn run_relay<R, W>(source: R, destination: W, ctx: RelayContext) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outcome = copy_with_deadline(source, destination, &ctx.link, ctx.idle_timeout).await;

    ctx.link.close();

    let index = ctx.unit.rule_index();
    let remaining = ctx.registry.consume(index, outcome.written);

    match &outcome.end {
        RelayEnd::Eof => trace!(
            peer = %ctx.peer,
            direction = %ctx.direction,
            "Source reached end of stream"
        ),
        RelayEnd::TimedOut => info!(
            target: TIMEOUT_TARGET,
            peer = %ctx.peer,
            direction = %ctx.direction,
            "A connection timed out"
        ),
        RelayEnd::Closed(e) => trace!(
            peer = %ctx.peer,
            direction = %ctx.direction,
            "Connection closed: {}",
            e
        ),
        RelayEnd::Io(e) => debug!(
            peer = %ctx.peer,
            direction = %ctx.direction,
            "Error while relaying: {}",
            e
        ),
    }

    // Quota is charged before the unit frees up room for a new connection
    drop(ctx.unit);

    debug!(
        rule = index,
        peer = %ctx.peer,
        direction = %ctx.direction,
        bytes = outcome.written,
        remaining_quota = ?remaining,
        "Relay finished"
    );

    outcome
}

/// Copy `source` into `destination` until end of stream or failure
pub(crate) async fn copy_with_deadline<R, W>(
    mut source: R,
    mut destination: W,
    link: &ConnectionLink,
    idle_timeout: Option<Duration>,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = match with_deadline(link, idle_timeout, source.read(&mut buffer)).await {
            Ok(0) => {
                return RelayOutcome {
                    written,
                    end: RelayEnd::Eof,
                }
            }
            Ok(n) => n,
            Err(end) => return RelayOutcome { written, end },
        };

        // Partial writes are counted one by one so a failure mid-chunk
        // still charges what the destination accepted.
        let mut pending = &buffer[..n];
        while !pending.is_empty() {
            match with_deadline(link, idle_timeout, destination.write(pending)).await {
                Ok(0) => {
                    return RelayOutcome {
                        written,
                        end: RelayEnd::Io(io::ErrorKind::WriteZero.into()),
                    }
                }
                Ok(nw) => {
                    written += nw as u64;
                    pending = &pending[nw..];
                }
                Err(end) => return RelayOutcome { written, end },
            }
        }
    }
}

/// Await an I/O call under the connection's idle deadline
///
/// When the deadline passes the shared activity time is checked again: if the
/// other direction moved data meanwhile the wait is re-armed for the rest of
/// the window.
async fn with_deadline<T, F>(
    link: &ConnectionLink,
    idle_timeout: Option<Duration>,
    io: F,
) -> Result<T, RelayEnd>
where
    F: Future<Output = io::Result<T>>,
{
    let Some(idle) = idle_timeout else {
        return io.await.map_err(RelayEnd::from_io);
    };

    tokio::pin!(io);
    loop {
        let window = idle.saturating_sub(link.idle_for());
        if window.is_zero() {
            return Err(RelayEnd::TimedOut);
        }

        if let Ok(result) = tokio::time::timeout(window, &mut io).await {
            link.touch();
            return result.map_err(RelayEnd::from_io);
        }
    }
}
