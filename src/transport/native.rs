//! Native transport over a russh session
//!
//! One authenticated SSH connection per host. Commands run on exec
//! channels; every dial or bridged connection opens its own `direct-tcpip`
//! channel through the handle owner task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    HostTransport, RemoteCommandRunner, TransportFactory, Tunnel, TunnelStream, TunnelTransport,
};
use crate::config::{HostDescriptor, Settings};
use crate::ssh::{exec_command, HandleController, SshClient, SshConfig, SshError};

/// Host the remote side connects to, as seen from the server
const TARGET_HOST: &str = "localhost";

pub struct NativeTransportFactory {
    connect_timeout_secs: u64,
    command_timeout: Duration,
}

impl NativeTransportFactory {
    pub fn new(settings: &Settings) -> Self {
        Self {
            connect_timeout_secs: settings.connect_timeout_secs,
            command_timeout: settings.command_timeout(),
        }
    }
}

#[async_trait]
impl TransportFactory for NativeTransportFactory {
    async fn connect(&self, host: &HostDescriptor) -> Result<HostTransport, SshError> {
        let config = SshConfig::for_host(host, self.connect_timeout_secs);
        let controller = SshClient::new(config)
            .connect(format!("{}@{}", host.user, host.name))
            .await?;

        Ok(HostTransport {
            host: host.clone(),
            runner: Arc::new(SshCommandRunner {
                controller: controller.clone(),
                timeout: self.command_timeout,
            }),
            transport: Arc::new(SshTransport { controller }),
        })
    }
}

/// Runs commands on exec channels
pub struct SshCommandRunner {
    controller: HandleController,
    timeout: Duration,
}

#[async_trait]
impl RemoteCommandRunner for SshCommandRunner {
    async fn execute(&self, command: &str) -> Result<Vec<u8>, SshError> {
        exec_command(&self.controller, command, self.timeout).await
    }
}

/// Dials remote ports over `direct-tcpip` channels
pub struct SshTransport {
    controller: HandleController,
}

async fn open_stream(controller: &HandleController, remote_port: u16) -> Result<TunnelStream, SshError> {
    let channel = controller
        .open_direct_tcpip(TARGET_HOST, u32::from(remote_port), "127.0.0.1", 0)
        .await?;
    debug!("Opened direct-tcpip channel to {}:{}", TARGET_HOST, remote_port);
    Ok(Box::new(channel.into_stream()))
}

#[async_trait]
impl TunnelTransport for SshTransport {
    async fn dial(&self, remote_port: u16) -> Result<TunnelStream, SshError> {
        open_stream(&self.controller, remote_port).await
    }

    async fn establish(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Arc<dyn Tunnel>, SshError> {
        if !self.controller.is_connected() {
            return Err(SshError::Disconnected);
        }
        debug!(
            "Native tunnel ready: local {} -> remote {}",
            local_port, remote_port
        );
        Ok(Arc::new(SshTunnel {
            controller: self.controller.clone(),
            remote_port,
        }))
    }
}

/// Channels are opened on demand, so the tunnel lives exactly as long as
/// the SSH connection. Each forward gets its own connection, which
/// `shutdown` closes.
struct SshTunnel {
    controller: HandleController,
    remote_port: u16,
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn connect(&self) -> Result<TunnelStream, SshError> {
        open_stream(&self.controller, self.remote_port).await
    }

    async fn closed(&self) {
        self.controller.disconnected().await
    }

    fn close_reason(&self) -> Option<String> {
        (!self.controller.is_connected()).then(|| "SSH connection lost".to_string())
    }

    async fn shutdown(&self) {
        debug!("Closing SSH connection of tunnel to remote {}", self.remote_port);
        self.controller.disconnect().await
    }
}
