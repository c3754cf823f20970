//! Transport seams
//!
//! The core never talks to SSH directly. Discovery runs commands through a
//! [`RemoteCommandRunner`]; forwarding sessions open per-connection streams
//! through a [`Tunnel`] obtained from a [`TunnelTransport`]. Two
//! implementations exist side by side:
//!
//! - [`native`]: one russh session per host, one `direct-tcpip` channel per
//!   connection
//! - [`process`]: the operator's `ssh` binary, one `ssh -N -L` worker per
//!   forwarding session

pub mod native;
pub mod process;
pub mod worker;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{HostDescriptor, Settings, TransportKind};
use crate::ssh::SshError;

pub use native::NativeTransportFactory;
pub use process::ProcessTransportFactory;
pub use worker::Worker;

/// Bidirectional byte stream to a remote port
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Runs a shell command on one remote host
#[async_trait]
pub trait RemoteCommandRunner: Send + Sync {
    /// Execute `command` and return its stdout
    async fn execute(&self, command: &str) -> Result<Vec<u8>, SshError>;
}

/// Opens byte streams to ports on one remote host
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Connect to `localhost:remote_port` as seen from the remote host
    async fn dial(&self, remote_port: u16) -> Result<TunnelStream, SshError>;

    /// Set up the tunnel a forwarding session bridges through
    async fn establish(&self, local_port: u16, remote_port: u16)
        -> Result<Arc<dyn Tunnel>, SshError>;
}

/// A tunnel to one remote port, owned by one forwarding session
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Open the remote side for one accepted local connection
    async fn connect(&self) -> Result<TunnelStream, SshError>;

    /// Resolves when the tunnel is lost
    async fn closed(&self);

    /// Why the tunnel was lost, if it was
    fn close_reason(&self) -> Option<String>;

    /// Tear the tunnel down. Safe to call more than once.
    async fn shutdown(&self);
}

/// Runner and transport bound to a single host
#[derive(Clone)]
pub struct HostTransport {
    pub host: HostDescriptor,
    pub runner: Arc<dyn RemoteCommandRunner>,
    pub transport: Arc<dyn TunnelTransport>,
}

/// Builds a [`HostTransport`] for a host
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, host: &HostDescriptor) -> Result<HostTransport, SshError>;
}

/// Factory for the transport selected in `settings`
pub fn factory_for(settings: &Settings) -> Arc<dyn TransportFactory> {
    match settings.transport {
        TransportKind::Native => Arc::new(NativeTransportFactory::new(settings)),
        TransportKind::Process => Arc::new(ProcessTransportFactory::new(settings)),
    }
}
