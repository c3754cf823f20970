//! Forwarding Controller
//!
//! Front ends drive the engine only through messages: commands go in over
//! an mpsc channel, and every command except `Stop` and `Shutdown` yields
//! exactly one [`ForwardEvent`]. Each command runs on its own task so a
//! slow discovery never delays a stop.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::allocator::PortAllocator;
use super::error::ForwardError;
use super::events::{ForwardEvent, ForwardEventEmitter};
use super::session::{ForwardingSession, SessionOptions};
use crate::config::{HostInventory, Settings};
use crate::discovery::PortDiscovery;
use crate::transport::TransportFactory;

/// Which remote port to forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRequest {
    /// Picked from a discovery result
    Number(u16),
    /// Typed by the operator, validated before anything connects
    Manual(String),
}

/// Commands accepted by the controller
#[derive(Debug)]
pub enum ForwardCommand {
    Discover { host: String },
    StartForward { host: String, port: PortRequest },
    /// Fire-and-forget; `SessionStopped` follows once the session is down
    Stop { session_id: String },
    /// Stop every session and end the controller
    Shutdown,
}

/// Parse operator input as a port in 1..=65535
pub fn parse_port_text(text: &str) -> Result<u16, ForwardError> {
    let trimmed = text.trim();
    trimmed
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ForwardError::InvalidPort(trimmed.to_string()))
}

/// Sending side of the controller
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ForwardCommand>,
}

impl ControllerHandle {
    pub async fn send(&self, command: ForwardCommand) {
        if self.tx.send(command).await.is_err() {
            debug!("Controller already shut down");
        }
    }

    pub async fn discover(&self, host: impl Into<String>) {
        self.send(ForwardCommand::Discover { host: host.into() }).await
    }

    pub async fn start_forward(&self, host: impl Into<String>, port: PortRequest) {
        self.send(ForwardCommand::StartForward {
            host: host.into(),
            port,
        })
        .await
    }

    pub async fn stop(&self, session_id: impl Into<String>) {
        self.send(ForwardCommand::Stop {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn shutdown(&self) {
        self.send(ForwardCommand::Shutdown).await
    }
}

pub struct ForwardController {
    inventory: Arc<HostInventory>,
    factory: Arc<dyn TransportFactory>,
    discovery: PortDiscovery,
    allocator: PortAllocator,
    options: SessionOptions,
    sessions: Arc<DashMap<String, Arc<ForwardingSession>>>,
    emitter: ForwardEventEmitter,
    /// In-flight command tasks
    commands: TaskTracker,
    /// Tasks waiting for a session to stop
    watchers: TaskTracker,
}

impl ForwardController {
    pub fn new(
        settings: &Settings,
        inventory: HostInventory,
        factory: Arc<dyn TransportFactory>,
        emitter: ForwardEventEmitter,
    ) -> Result<Self, ForwardError> {
        let allocator = PortAllocator::new(&settings.bind_address)?;
        Ok(Self {
            inventory: Arc::new(inventory),
            factory,
            discovery: PortDiscovery::new(settings),
            options: SessionOptions {
                bind_ip: allocator.bind_ip(),
                accept_poll: settings.accept_poll(),
            },
            allocator,
            sessions: Arc::new(DashMap::new()),
            emitter,
            commands: TaskTracker::new(),
            watchers: TaskTracker::new(),
        })
    }

    /// Run the controller on its own task
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(Arc::new(self).run(rx));
        (ControllerHandle { tx }, task)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ForwardCommand>) {
        while let Some(command) = rx.recv().await {
            debug!("Controller command: {:?}", command);
            let this = Arc::clone(&self);
            match command {
                ForwardCommand::Discover { host } => {
                    self.commands.spawn(async move { this.handle_discover(host).await });
                }
                ForwardCommand::StartForward { host, port } => {
                    self.commands.spawn(async move {
                        match this.start_forward(&host, port).await {
                            Ok(event) => this.emitter.emit(event),
                            Err(e) => {
                                warn!("Forward to {} failed: {}", host, e);
                                this.emitter.emit_error(e.to_string());
                            }
                        }
                    });
                }
                ForwardCommand::Stop { session_id } => {
                    self.commands.spawn(async move { this.stop_session(&session_id).await });
                }
                ForwardCommand::Shutdown => break,
            }
        }

        self.shutdown().await;
    }

    async fn handle_discover(&self, host_name: String) {
        let ports = match self.inventory.get_host_by_name(&host_name) {
            Ok(host) => self.discovery.discover_host(self.factory.as_ref(), &host).await,
            Err(e) => {
                warn!("Discovery skipped: {}", e);
                Vec::new()
            }
        };
        self.emitter.emit(ForwardEvent::Discovered {
            host: host_name,
            ports,
        });
    }

    async fn start_forward(
        &self,
        host_name: &str,
        port: PortRequest,
    ) -> Result<ForwardEvent, ForwardError> {
        let remote_port = match port {
            PortRequest::Number(0) => return Err(ForwardError::InvalidPort("0".to_string())),
            PortRequest::Number(port) => port,
            PortRequest::Manual(text) => parse_port_text(&text)?,
        };

        let host = self.inventory.get_host_by_name(host_name)?;
        let connection = self.factory.connect(&host).await?;
        let allocation = self.allocator.allocate(remote_port)?;

        let session_id = Uuid::new_v4().to_string();
        let session = ForwardingSession::new(
            session_id.clone(),
            connection.transport.clone(),
            self.options,
        );
        let local_addr = session
            .start(&host.name, allocation.local_port, remote_port)
            .await?;

        self.sessions.insert(session_id.clone(), session.clone());
        self.watch(session);

        info!(
            "Forwarding {} -> {}:{} (session {})",
            local_addr, host.name, remote_port, session_id
        );

        Ok(ForwardEvent::ForwardingStarted {
            session_id,
            host: host.name,
            local_port: local_addr.port(),
            remote_port,
            same_port: allocation.same_port && local_addr.port() == remote_port,
        })
    }

    /// Emit `SessionStopped` once the session is down, whatever stopped it
    fn watch(&self, session: Arc<ForwardingSession>) {
        let emitter = self.emitter.clone();
        let sessions = self.sessions.clone();
        self.watchers.spawn(async move {
            session.stopped().await;
            sessions.remove(session.id());
            emitter.emit_session_stopped(session.id(), session.stop_reason());
        });
    }

    async fn stop_session(&self, session_id: &str) {
        match self.sessions.remove(session_id) {
            Some((_, session)) => session.stop().await,
            None => debug!("Stop for unknown session {}", session_id),
        }
    }

    async fn shutdown(&self) {
        info!("Controller shutting down");

        self.commands.close();
        self.commands.wait().await;

        let sessions: Vec<Arc<ForwardingSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        join_all(sessions.iter().map(|session| session.stop())).await;

        self.watchers.close();
        self.watchers.wait().await;
    }
}
