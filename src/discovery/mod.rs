//! Remote Port Discovery
//!
//! Finds which TCP ports a remote host is listening on. Enumeration
//! commands are tried first; when none of them yields output the engine
//! falls back to dialing a list of well-known ports through the transport.
//! Discovery never fails: every error degrades to fewer (or no) ports so
//! the operator can still enter a port by hand.

mod strategy;

pub use strategy::{parse_port_lines, Strategy, STRATEGIES};

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{HostDescriptor, Settings};
use crate::transport::{RemoteCommandRunner, TransportFactory, TunnelTransport};

/// Discovery engine with its timeouts and probe list
#[derive(Debug, Clone)]
pub struct PortDiscovery {
    command_timeout: Duration,
    probe_timeout: Duration,
    probe_ports: Vec<u16>,
}

impl PortDiscovery {
    pub fn new(settings: &Settings) -> Self {
        Self::with_limits(
            settings.command_timeout(),
            settings.probe_timeout(),
            settings.probe_ports.clone(),
        )
    }

    pub fn with_limits(command_timeout: Duration, probe_timeout: Duration, probe_ports: Vec<u16>) -> Self {
        // Probe in ascending order without repeats so results come out sorted
        let probe_ports: Vec<u16> = probe_ports
            .into_iter()
            .filter(|port| *port != 0)
            .collect::<BTreeSet<u16>>()
            .into_iter()
            .collect();
        Self {
            command_timeout,
            probe_timeout,
            probe_ports,
        }
    }

    /// Connect to `host` and discover its ports. A connection failure is
    /// logged and yields an empty result.
    pub async fn discover_host(&self, factory: &dyn TransportFactory, host: &HostDescriptor) -> Vec<u16> {
        match factory.connect(host).await {
            Ok(conn) => self.discover(conn.runner.as_ref(), conn.transport.as_ref()).await,
            Err(e) => {
                warn!("Discovery on {} could not connect: {}", host.name, e);
                Vec::new()
            }
        }
    }

    /// Discover listening ports through an existing runner and transport
    pub async fn discover(
        &self,
        runner: &dyn RemoteCommandRunner,
        transport: &dyn TunnelTransport,
    ) -> Vec<u16> {
        if let Some(ports) = self.enumerate(runner).await {
            return ports;
        }

        info!("No enumeration command produced output, probing common ports");
        self.probe(transport).await
    }

    /// Run the strategies in order. `None` when none produced output.
    async fn enumerate(&self, runner: &dyn RemoteCommandRunner) -> Option<Vec<u16>> {
        for strategy in STRATEGIES.iter() {
            let output = match timeout(self.command_timeout, runner.execute(strategy.command)).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    debug!("Strategy {} failed: {}", strategy.name, e);
                    continue;
                }
                Err(_) => {
                    warn!(
                        "Strategy {} timed out after {}s",
                        strategy.name,
                        self.command_timeout.as_secs()
                    );
                    continue;
                }
            };

            let text = String::from_utf8_lossy(&output);
            if text.trim().is_empty() {
                debug!("Strategy {} returned no output", strategy.name);
                continue;
            }

            let ports = parse_port_lines(&text);
            info!("Strategy {} found {} port(s)", strategy.name, ports.len());
            return Some(ports);
        }
        None
    }

    /// Dial every probe port concurrently, keeping the ones that connect
    async fn probe(&self, transport: &dyn TunnelTransport) -> Vec<u16> {
        let probes = self.probe_ports.iter().map(|&port| async move {
            match timeout(self.probe_timeout, transport.dial(port)).await {
                Ok(Ok(mut stream)) => {
                    let _ = stream.shutdown().await;
                    debug!("Probe {} open", port);
                    Some(port)
                }
                Ok(Err(e)) => {
                    debug!("Probe {} closed: {}", port, e);
                    None
                }
                Err(_) => {
                    debug!("Probe {} timed out", port);
                    None
                }
            }
        });

        join_all(probes).await.into_iter().flatten().collect()
    }
}
