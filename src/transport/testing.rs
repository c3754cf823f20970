//! In-process fakes for tests: a loopback transport that dials
//! 127.0.0.1 directly and a scripted command runner.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::worker::Worker;
use super::{
    HostTransport, RemoteCommandRunner, TransportFactory, Tunnel, TunnelStream, TunnelTransport,
};
use crate::config::HostDescriptor;
use crate::ssh::SshError;

/// Runner answering by command prefix; unknown commands fail
#[derive(Default)]
pub struct FakeRunner {
    responses: Vec<(String, Result<String, String>)>,
    calls: parking_lot::Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, prefix: &str, stdout: &str) -> Self {
        self.responses
            .push((prefix.to_string(), Ok(stdout.to_string())));
        self
    }

    pub fn fail(mut self, prefix: &str, reason: &str) -> Self {
        self.responses
            .push((prefix.to_string(), Err(reason.to_string())));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RemoteCommandRunner for FakeRunner {
    async fn execute(&self, command: &str) -> Result<Vec<u8>, SshError> {
        self.calls.lock().push(command.to_string());
        match self
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            Some((_, Ok(stdout))) => Ok(stdout.clone().into_bytes()),
            Some((_, Err(reason))) => Err(SshError::command_failed(1, Some(reason.as_str()))),
            None => Err(SshError::command_failed(127, Some("command not found"))),
        }
    }
}

/// "Remote" host is the local machine: remote port N is 127.0.0.1:N
#[derive(Default)]
pub struct LoopbackTransport {
    fail_establish: AtomicBool,
    dials: AtomicUsize,
    tunnels: parking_lot::Mutex<Vec<Worker>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let transport = Self::default();
        transport.fail_establish.store(true, Ordering::SeqCst);
        transport
    }

    /// Number of `dial` calls so far
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Kill every established tunnel, as if the connection dropped
    pub async fn drop_connection(&self) {
        let workers: Vec<Worker> = self.tunnels.lock().clone();
        for worker in workers {
            worker.terminate().await;
        }
    }
}

#[async_trait]
impl TunnelTransport for LoopbackTransport {
    async fn dial(&self, remote_port: u16) -> Result<TunnelStream, SshError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect(("127.0.0.1", remote_port)).await?;
        Ok(Box::new(stream))
    }

    async fn establish(
        &self,
        _local_port: u16,
        remote_port: u16,
    ) -> Result<Arc<dyn Tunnel>, SshError> {
        if self.fail_establish.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionFailed("loopback refused".to_string()));
        }
        let worker = Worker::task(
            format!("loopback:{}", remote_port),
            std::future::pending(),
        );
        self.tunnels.lock().push(worker.clone());
        Ok(Arc::new(LoopbackTunnel {
            remote_port,
            worker,
        }))
    }
}

struct LoopbackTunnel {
    remote_port: u16,
    worker: Worker,
}

#[async_trait]
impl Tunnel for LoopbackTunnel {
    async fn connect(&self) -> Result<TunnelStream, SshError> {
        if self.worker.has_exited() {
            return Err(SshError::Disconnected);
        }
        let stream = TcpStream::connect(("127.0.0.1", self.remote_port)).await?;
        Ok(Box::new(stream))
    }

    async fn closed(&self) {
        self.worker.exited().await
    }

    fn close_reason(&self) -> Option<String> {
        self.worker.exit_reason()
    }

    async fn shutdown(&self) {
        self.worker.terminate().await
    }
}

/// Factory handing out the same runner and transport for every host
pub struct FakeFactory {
    pub runner: Arc<FakeRunner>,
    pub transport: Arc<LoopbackTransport>,
    pub connects: AtomicUsize,
}

impl FakeFactory {
    pub fn new(runner: FakeRunner, transport: LoopbackTransport) -> Self {
        Self {
            runner: Arc::new(runner),
            transport: Arc::new(transport),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn connect(&self, host: &HostDescriptor) -> Result<HostTransport, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(HostTransport {
            host: host.clone(),
            runner: self.runner.clone(),
            transport: self.transport.clone(),
        })
    }
}

pub fn host(name: &str) -> HostDescriptor {
    HostDescriptor {
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        user: "tester".to_string(),
        port: 22,
        identity: None,
    }
}

/// Echo server on an ephemeral port, standing in for the remote service
pub async fn spawn_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, handle)
}
