//! Process transport over the operator's `ssh` binary
//!
//! Authentication, host keys and everything else `ssh` is configured to do
//! stay with `ssh`. Commands run as `ssh host -- cmd`. A forwarding session
//! gets its own `ssh -N -L` worker listening on a private relay port, and
//! the session bridges each accepted connection to that relay.

use std::net::SocketAddr;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use super::worker::Worker;
use super::{
    HostTransport, RemoteCommandRunner, TransportFactory, Tunnel, TunnelStream, TunnelTransport,
};
use crate::config::{HostDescriptor, Settings};
use crate::ssh::SshError;

/// How long a `ssh -W` dial must survive before it counts as connected
const DIAL_SETTLE: Duration = Duration::from_millis(750);

/// Interval between relay readiness checks
const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the stderr of an exited dial helper
const STDERR_READ_LIMIT: Duration = Duration::from_millis(200);

#[derive(Clone)]
struct SshInvocation {
    program: String,
    host: HostDescriptor,
    connect_timeout_secs: u64,
}

impl SshInvocation {
    /// `ssh` with non-interactive options and the host's connection
    /// parameters, without the destination
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg("-p")
            .arg(self.host.port.to_string())
            .arg("-l")
            .arg(&self.host.user);
        if let Some(identity) = &self.host.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn destination(&self) -> &str {
        &self.host.address
    }
}

pub struct ProcessTransportFactory {
    program: String,
    connect_timeout_secs: u64,
    command_timeout: Duration,
    terminate_grace: Duration,
}

impl ProcessTransportFactory {
    pub fn new(settings: &Settings) -> Self {
        Self {
            program: settings.ssh_program.clone(),
            connect_timeout_secs: settings.connect_timeout_secs,
            command_timeout: settings.command_timeout(),
            terminate_grace: settings.terminate_grace(),
        }
    }
}

#[async_trait]
impl TransportFactory for ProcessTransportFactory {
    async fn connect(&self, host: &HostDescriptor) -> Result<HostTransport, SshError> {
        // Nothing to connect up front; every use spawns its own ssh
        let invocation = SshInvocation {
            program: self.program.clone(),
            host: host.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
        };

        Ok(HostTransport {
            host: host.clone(),
            runner: Arc::new(ProcessCommandRunner {
                invocation: invocation.clone(),
                timeout: Duration::from_secs(self.connect_timeout_secs) + self.command_timeout,
            }),
            transport: Arc::new(ProcessTransport {
                invocation,
                terminate_grace: self.terminate_grace,
            }),
        })
    }
}

/// Runs `ssh host -- command`
pub struct ProcessCommandRunner {
    invocation: SshInvocation,
    timeout: Duration,
}

#[async_trait]
impl RemoteCommandRunner for ProcessCommandRunner {
    async fn execute(&self, command: &str) -> Result<Vec<u8>, SshError> {
        let mut cmd = self.invocation.command();
        cmd.arg(self.invocation.destination()).arg("--").arg(command);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "'{}' did not finish within {}s",
                    command,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                SshError::ProcessFailed(format!("Failed to run {}: {}", self.invocation.program, e))
            })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SshError::command_failed(output.status, stderr.lines().last()))
        }
    }
}

/// Tunnels through `ssh` child processes
pub struct ProcessTransport {
    invocation: SshInvocation,
    terminate_grace: Duration,
}

#[async_trait]
impl TunnelTransport for ProcessTransport {
    /// `ssh -W localhost:port` with the child's stdio as the stream. ssh
    /// exits quickly when the remote side refuses the connection, so a
    /// child still running after a short settle window counts as connected.
    ///
    /// The window also covers the SSH handshake. On a host whose handshake
    /// alone outlasts it, a refused port can be reported as open.
    async fn dial(&self, remote_port: u16) -> Result<TunnelStream, SshError> {
        let mut cmd = self.invocation.command();
        cmd.arg("-W")
            .arg(format!("localhost:{}", remote_port))
            .arg(self.invocation.destination())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            SshError::ProcessFailed(format!("Failed to run {}: {}", self.invocation.program, e))
        })?;

        // Taken before `wait`, which would otherwise close the child's stdin
        let (Some(stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SshError::ProcessFailed("ssh stdio not captured".to_string()));
        };

        if let Ok(status) = timeout(DIAL_SETTLE, child.wait()).await {
            let mut message = String::new();
            let _ = timeout(STDERR_READ_LIMIT, stderr.read_to_string(&mut message)).await;
            let status = status.map_err(SshError::IoError)?;
            return Err(SshError::ChannelError(format!(
                "localhost:{} unreachable ({}): {}",
                remote_port,
                status,
                message.lines().last().unwrap_or("").trim()
            )));
        }

        tokio::spawn(log_stderr(remote_port, stderr));
        Ok(Box::new(ChildStream {
            _child: child,
            stdin,
            stdout,
        }))
    }

    async fn establish(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Arc<dyn Tunnel>, SshError> {
        let relay_port = find_free_port().await?;
        let relay_addr = SocketAddr::from(([127, 0, 0, 1], relay_port));

        let mut cmd = self.invocation.command();
        cmd.args(["-N", "-o", "ExitOnForwardFailure=yes"])
            .arg("-L")
            .arg(format!("127.0.0.1:{}:localhost:{}", relay_port, remote_port))
            .arg(self.invocation.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            SshError::ProcessFailed(format!("Failed to run {}: {}", self.invocation.program, e))
        })?;

        let worker = Worker::process(
            format!("ssh -L {}:{}", relay_port, remote_port),
            child,
            self.terminate_grace,
        );

        let max_wait = Duration::from_secs(self.invocation.connect_timeout_secs) + Duration::from_secs(5);
        if let Err(e) = wait_for_relay_ready(relay_addr, &worker, max_wait).await {
            worker.terminate().await;
            return Err(e);
        }

        info!(
            "Forwarding process ready: relay {} -> {}:{} (local {})",
            relay_addr,
            self.invocation.destination(),
            remote_port,
            local_port
        );

        Ok(Arc::new(ProcessTunnel { relay_addr, worker }))
    }
}

/// Keep a live dial's stderr pipe drained
async fn log_stderr(remote_port: u16, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("ssh -W localhost:{}: {}", remote_port, line);
    }
}

/// Ask the OS for a free loopback port
async fn find_free_port() -> Result<u16, SshError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Wait until the relay accepts connections, failing early if the worker
/// exits first.
async fn wait_for_relay_ready(
    relay_addr: SocketAddr,
    worker: &Worker,
    max_wait: Duration,
) -> Result<(), SshError> {
    let deadline = Instant::now() + max_wait;

    loop {
        if worker.has_exited() {
            return Err(SshError::ProcessFailed(format!(
                "{} {}",
                worker.name(),
                worker.exit_reason().unwrap_or_else(|| "exited".to_string())
            )));
        }
        if Instant::now() >= deadline {
            return Err(SshError::Timeout(format!(
                "Relay {} not ready after {}s",
                relay_addr,
                max_wait.as_secs()
            )));
        }

        match timeout(Duration::from_millis(500), TcpStream::connect(relay_addr)).await {
            Ok(Ok(_probe)) => return Ok(()),
            _ => {
                tokio::select! {
                    _ = worker.exited() => {}
                    _ = sleep(RELAY_POLL_INTERVAL) => {}
                }
            }
        }
    }
}

struct ProcessTunnel {
    relay_addr: SocketAddr,
    worker: Worker,
}

#[async_trait]
impl Tunnel for ProcessTunnel {
    async fn connect(&self) -> Result<TunnelStream, SshError> {
        let stream = TcpStream::connect(self.relay_addr).await?;
        debug!("Connected to relay {}", self.relay_addr);
        Ok(Box::new(stream))
    }

    async fn closed(&self) {
        self.worker.exited().await
    }

    fn close_reason(&self) -> Option<String> {
        self.worker
            .exit_reason()
            .map(|reason| format!("forwarding process `{}` {}", self.worker.name(), reason))
    }

    async fn shutdown(&self) {
        self.worker.terminate().await
    }
}

/// stdin/stdout of a `ssh -W` child as one stream. Dropping it kills the
/// child.
struct ChildStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ChildStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
