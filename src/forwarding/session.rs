//! Forwarding Session
//!
//! Exposes one remote port on one local listener. The session owns the
//! listener, the tunnel it bridges through and every task it spawns:
//!
//! - one accept loop, waiting at most `accept_poll` per accept so it
//!   observes the stop signal promptly
//! - a setup task per accepted connection that opens the remote side
//! - two copy tasks per bridged connection
//!
//! All of them run on one [`TaskTracker`] and under one stop token (each
//! connection gets a child token). `stop` cancels the token, tears the
//! tunnel down and waits on the tracker, so it returns only once every
//! connection has drained.
//!
//! Start and stop are serialized by a `tokio::sync::Mutex` held across
//! their await points. A session is never restarted; a new forward always
//! gets a new session.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::bridge::{spawn_bridge, ConnectionGuard};
use super::error::ForwardError;
use crate::transport::{Tunnel, TunnelTransport};

/// Back-off after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Session lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Statistics for a forwarding session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections accepted
    pub connection_count: u64,
    /// Connections open right now
    pub active_connections: u64,
    /// Total bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> local)
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Address the local listener binds to
    pub bind_ip: IpAddr,
    /// Upper bound on a single wait for an incoming connection
    pub accept_poll: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_poll: Duration::from_secs(1),
        }
    }
}

/// Where a running session forwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub host: String,
    pub local_addr: SocketAddr,
    pub remote_port: u16,
}

pub struct ForwardingSession {
    id: String,
    transport: Arc<dyn TunnelTransport>,
    options: SessionOptions,
    /// Held across the awaits of start and stop
    tunnel: tokio::sync::Mutex<Option<Arc<dyn Tunnel>>>,
    /// Written only while `tunnel` is locked
    state: parking_lot::RwLock<SessionState>,
    mapping: parking_lot::RwLock<Option<Mapping>>,
    stop_reason: parking_lot::RwLock<Option<String>>,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    stop: CancellationToken,
    stopped: CancellationToken,
    tracker: TaskTracker,
}

impl ForwardingSession {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn TunnelTransport>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            transport,
            options,
            tunnel: tokio::sync::Mutex::new(None),
            state: parking_lot::RwLock::new(SessionState::Idle),
            mapping: parking_lot::RwLock::new(None),
            stop_reason: parking_lot::RwLock::new(None),
            stats: Arc::new(parking_lot::RwLock::new(ForwardStats::default())),
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    /// Bound listener address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mapping.read().as_ref().map(|m| m.local_addr)
    }

    pub fn mapping(&self) -> Option<Mapping> {
        self.mapping.read().clone()
    }

    /// Why the session stopped, when it was not a plain `stop`
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.read().clone()
    }

    /// Resolves once the session is `Stopped`
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session {}: {:?}", self.id, state);
        *self.state.write() = state;
    }

    fn finish(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            self.stop_reason.write().get_or_insert(reason);
        }
        self.set_state(SessionState::Stopped);
        self.stopped.cancel();
    }

    /// Establish the tunnel, bind `bind_ip:local_port` and start accepting.
    /// Legal only on an `Idle` session; any failure leaves it `Stopped`.
    pub async fn start(
        self: &Arc<Self>,
        host: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<SocketAddr, ForwardError> {
        let mut slot = self.tunnel.lock().await;

        let state = self.state();
        if state != SessionState::Idle {
            return Err(ForwardError::InvalidState {
                operation: "start",
                state,
            });
        }
        self.set_state(SessionState::Starting);

        let tunnel = match self.transport.establish(local_port, remote_port).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Session {}: tunnel to {}:{} failed: {}", self.id, host, remote_port, e);
                self.finish(Some(e.to_string()));
                return Err(e.into());
            }
        };

        let addr = SocketAddr::new(self.options.bind_ip, local_port);
        let bound = match TcpListener::bind(addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                tunnel.shutdown().await;
                let err = ForwardError::from_bind(addr, e);
                self.finish(Some(err.to_string()));
                return Err(err);
            }
        };

        *self.mapping.write() = Some(Mapping {
            host: host.to_string(),
            local_addr,
            remote_port,
        });
        *slot = Some(tunnel.clone());
        self.set_state(SessionState::Running);

        info!(
            "Session {}: forwarding {} -> {}:{}",
            self.id, local_addr, host, remote_port
        );

        let session = Arc::clone(self);
        self.tracker
            .spawn(async move { session.accept_loop(listener, tunnel).await });

        Ok(local_addr)
    }

    /// Stop accepting, close every bridged connection, tear the tunnel down
    /// and wait until all tasks have exited. No-op unless `Starting` or
    /// `Running`; an `Idle` session just becomes `Stopped`.
    pub async fn stop(&self) {
        self.stop_with_reason(None).await
    }

    async fn stop_with_reason(&self, reason: Option<String>) {
        let mut slot = self.tunnel.lock().await;

        match self.state() {
            SessionState::Idle => {
                self.finish(reason);
                return;
            }
            SessionState::Starting | SessionState::Running => {}
            SessionState::Stopping | SessionState::Stopped => return,
        }

        self.set_state(SessionState::Stopping);
        self.stop.cancel();

        if let Some(tunnel) = slot.take() {
            tunnel.shutdown().await;
        }

        self.tracker.close();
        self.tracker.wait().await;

        let stats = self.stats();
        if let Some(mapping) = self.mapping() {
            info!(
                "Session {} stopped forwarding {} -> {}:{} ({} connections, {} bytes sent, {} bytes received)",
                self.id,
                mapping.local_addr,
                mapping.host,
                mapping.remote_port,
                stats.connection_count,
                stats.bytes_sent,
                stats.bytes_received
            );
        }
        self.finish(reason);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, tunnel: Arc<dyn Tunnel>) {
        loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => break,

                _ = tunnel.closed() => {
                    let reason = tunnel
                        .close_reason()
                        .unwrap_or_else(|| "transport lost".to_string());
                    warn!("Session {}: {}", self.id, reason);
                    // Stop waits on this task, so it has to run elsewhere
                    let session = Arc::clone(&self);
                    tokio::spawn(async move { session.stop_with_reason(Some(reason)).await });
                    break;
                }

                accepted = timeout(self.options.accept_poll, listener.accept()) => match accepted {
                    Err(_) => continue,
                    Ok(Ok((stream, peer))) => self.handle_connection(stream, peer, &tunnel),
                    Ok(Err(e)) => {
                        warn!("Session {}: accept error: {}", self.id, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        debug!("Session {}: accept loop exited", self.id);
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, tunnel: &Arc<dyn Tunnel>) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        debug!("Session {}: accepted {}", self.id, peer);

        let guard = ConnectionGuard::new(self.stats.clone());
        let token = self.stop.child_token();
        let tunnel = Arc::clone(tunnel);
        let stats = self.stats.clone();
        let tracker = self.tracker.clone();
        let id = self.id.clone();

        self.tracker.spawn(async move {
            let remote = tokio::select! {
                _ = token.cancelled() => return,
                remote = tunnel.connect() => remote,
            };
            match remote {
                Ok(remote) => spawn_bridge(&tracker, stream, remote, token, stats, guard),
                Err(e) => {
                    drop(guard);
                    drop(stream);
                    warn!("Session {}: dropping {}: {}", id, peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{spawn_echo_server, LoopbackTransport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options() -> SessionOptions {
        SessionOptions {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_poll: Duration::from_millis(50),
        }
    }

    async fn closed_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    async fn echo_once(addr: SocketAddr, payload: &[u8]) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        {
            let (mut reader, mut writer) = client.split();
            let (written, read) = timeout(
                Duration::from_secs(5),
                async { tokio::join!(writer.write_all(payload), reader.read_exact(&mut buf)) },
            )
            .await
            .unwrap();
            written.unwrap();
            read.unwrap();
        }
        assert_eq!(buf, payload);
        client
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (remote_port, _server) = spawn_echo_server().await;
        let session = ForwardingSession::new("s-1", Arc::new(LoopbackTransport::new()), options());

        let addr = session.start("web", 0, remote_port).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.local_addr(), Some(addr));
        assert_eq!(
            session.mapping(),
            Some(Mapping {
                host: "web".to_string(),
                local_addr: addr,
                remote_port,
            })
        );

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let _client = echo_once(addr, &payload).await;

        let stats = session.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.bytes_sent, payload.len() as u64);
        assert_eq!(stats.bytes_received, payload.len() as u64);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_connections() {
        let (remote_port, _server) = spawn_echo_server().await;
        let session = ForwardingSession::new("s-2", Arc::new(LoopbackTransport::new()), options());
        let addr = session.start("web", 0, remote_port).await.unwrap();

        let mut clients = Vec::new();
        for i in 0..3u8 {
            clients.push(echo_once(addr, &[i; 16]).await);
        }
        assert_eq!(session.stats().active_connections, 3);

        timeout(Duration::from_secs(5), session.stop()).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stats().active_connections, 0);
        assert_eq!(session.stop_reason(), None);

        // Bridged connections are closed
        for client in clients.iter_mut() {
            let mut buf = [0u8; 1];
            let read = timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        // Listener is gone
        assert!(TcpStream::connect(addr).await.is_err());

        // Second stop is a no-op
        timeout(Duration::from_secs(1), session.stop()).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    /// Write continuously while draining the echo, until the forward closes
    async fn stream_until_closed(mut client: TcpStream) {
        let (mut reader, mut writer) = client.split();
        let chunk = [7u8; 8192];
        let mut buf = [0u8; 8192];
        tokio::select! {
            _ = async { while writer.write_all(&chunk).await.is_ok() {} } => {}
            _ = async { while matches!(reader.read(&mut buf).await, Ok(n) if n > 0) {} } => {}
        }
    }

    #[tokio::test]
    async fn test_stop_drains_streaming_connections() {
        let (remote_port, _server) = spawn_echo_server().await;
        let session = ForwardingSession::new("s-2b", Arc::new(LoopbackTransport::new()), options());
        let addr = session.start("web", 0, remote_port).await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let client = TcpStream::connect(addr).await.unwrap();
            clients.push(tokio::spawn(stream_until_closed(client)));
        }

        // Every connection is moving data when stop begins
        timeout(Duration::from_secs(5), async {
            loop {
                let stats = session.stats();
                if stats.active_connections == 3 && stats.bytes_received >= 256 * 1024 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        timeout(Duration::from_secs(5), session.stop()).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stats().active_connections, 0);

        // Writers see the forward close instead of streaming forever
        for client in clients {
            timeout(Duration::from_secs(5), client).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_only_from_idle() {
        let (remote_port, _server) = spawn_echo_server().await;
        let session = ForwardingSession::new("s-3", Arc::new(LoopbackTransport::new()), options());
        session.start("web", 0, remote_port).await.unwrap();

        assert!(matches!(
            session.start("web", 0, remote_port).await,
            Err(ForwardError::InvalidState {
                state: SessionState::Running,
                ..
            })
        ));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_on_idle_is_terminal() {
        let session = ForwardingSession::new("s-4", Arc::new(LoopbackTransport::new()), options());
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        timeout(Duration::from_secs(1), session.stopped()).await.unwrap();

        assert!(matches!(
            session.start("web", 0, 80).await,
            Err(ForwardError::InvalidState {
                state: SessionState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_stops_session() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let session = ForwardingSession::new("s-5", Arc::new(LoopbackTransport::new()), options());
        let err = session.start("web", port, 80).await.unwrap_err();
        assert!(matches!(err, ForwardError::AddrInUse(_)), "{}", err);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.stop_reason().is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_stops_session() {
        let session = ForwardingSession::new("s-6", Arc::new(LoopbackTransport::failing()), options());
        let err = session.start("web", 0, 80).await.unwrap_err();
        assert!(matches!(err, ForwardError::Transport(_)));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_remote_refusal_drops_only_that_connection() {
        let session = ForwardingSession::new("s-7", Arc::new(LoopbackTransport::new()), options());
        let addr = session.start("web", 0, closed_port().await).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(session.state(), SessionState::Running);
        let stats = session.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.active_connections, 0);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_transport_loss_stops_session() {
        let (remote_port, _server) = spawn_echo_server().await;
        let transport = Arc::new(LoopbackTransport::new());
        let session = ForwardingSession::new("s-8", transport.clone(), options());
        let addr = session.start("web", 0, remote_port).await.unwrap();
        let _client = echo_once(addr, b"ping").await;

        transport.drop_connection().await;

        timeout(Duration::from_secs(5), session.stopped()).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stats().active_connections, 0);
        assert_eq!(session.stop_reason().as_deref(), Some("terminated"));
    }

    #[tokio::test]
    async fn test_sessions_to_same_remote_port_are_independent() {
        let (remote_port, _server) = spawn_echo_server().await;
        let a = ForwardingSession::new("a", Arc::new(LoopbackTransport::new()), options());
        let b = ForwardingSession::new("b", Arc::new(LoopbackTransport::new()), options());

        let (addr_a, addr_b) = tokio::join!(
            a.start("alpha", 0, remote_port),
            b.start("beta", 0, remote_port)
        );
        let (addr_a, addr_b) = (addr_a.unwrap(), addr_b.unwrap());
        assert_ne!(addr_a, addr_b);

        let _ca = echo_once(addr_a, b"from a").await;
        a.stop().await;

        let _cb = echo_once(addr_b, b"from b").await;
        assert_eq!(b.state(), SessionState::Running);
        assert_eq!(b.stats().connection_count, 1);
        b.stop().await;
    }
}
