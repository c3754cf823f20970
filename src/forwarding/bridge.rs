//! Per-connection bridging
//!
//! One accepted local connection is paired with one remote stream and two
//! copy tasks, local→remote and remote→local. Whichever direction ends
//! first cancels the connection token, the other task then returns, and
//! both endpoints close as their halves drop.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::session::ForwardStats;
use crate::transport::TunnelStream;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

type SharedStats = Arc<parking_lot::RwLock<ForwardStats>>;

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// local -> remote
    Sent,
    /// remote -> local
    Received,
}

/// Counts a connection as active until dropped
pub(crate) struct ConnectionGuard {
    stats: SharedStats,
}

impl ConnectionGuard {
    pub(crate) fn new(stats: SharedStats) -> Self {
        {
            let mut s = stats.write();
            s.connection_count += 1;
            s.active_connections += 1;
        }
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut s = self.stats.write();
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

/// Spawn the two copy tasks for one connection on `tracker`
pub(crate) fn spawn_bridge(
    tracker: &TaskTracker,
    local: TcpStream,
    remote: TunnelStream,
    token: CancellationToken,
    stats: SharedStats,
    guard: ConnectionGuard,
) {
    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = tokio::io::split(remote);
    let guard = Arc::new(guard);

    {
        let token = token.clone();
        let stats = stats.clone();
        let guard = guard.clone();
        tracker.spawn(async move {
            pump(local_read, remote_write, &token, &stats, Direction::Sent).await;
            drop(guard);
        });
    }

    tracker.spawn(async move {
        pump(remote_read, local_write, &token, &stats, Direction::Received).await;
        drop(guard);
    });
}

/// Copy until EOF, an error or cancellation, then cancel the peer task
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    token: &CancellationToken,
    stats: &SharedStats,
    direction: Direction,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{:?}: EOF", direction);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("{:?}: read error: {}", direction, e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = token.cancelled() => break,
            written = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => written,
        };
        if let Err(e) = written {
            debug!("{:?}: write error: {}", direction, e);
            break;
        }

        let mut s = stats.write();
        match direction {
            Direction::Sent => s.bytes_sent += n as u64,
            Direction::Received => s.bytes_received += n as u64,
        }
    }

    token.cancel();
}
