//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Discovery probes, exec
//! channels and every bridged connection of a forwarding session talk to it
//! through a cloneable [`HandleController`] that sends commands over an mpsc
//! channel, so channels can be opened concurrently without sharing the
//! handle behind a lock.
//!
//! The owner also watches the connection itself. When the server goes away
//! the task exits and cancels the controller's disconnect token, which is how
//! forwarding sessions notice a lost transport.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner checks whether the connection is still alive
const LIVENESS_INTERVAL: Duration = Duration::from_secs(2);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (for forwarded connections and probes)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (a channel sender and a token). Any holder has full
/// control over the connection, so controllers never leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnected: CancellationToken,
}

impl HandleController {
    /// Build a controller around a command channel. Whoever serves the
    /// channel cancels `disconnected` once the connection is gone.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, disconnected: CancellationToken) -> Self {
        Self {
            cmd_tx,
            disconnected,
        }
    }

    /// Resolves once the SSH connection is gone, including when it is
    /// already gone at the time of the call.
    pub async fn disconnected(&self) {
        self.disconnected.cancelled().await
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel to `host:port` as seen from the server
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Close the SSH connection for every holder of this controller and
    /// wait until the owner task has let go of it
    pub async fn disconnect(&self) {
        if self.cmd_tx.send(HandleCommand::Disconnect).await.is_err() {
            // Owner already gone
            self.disconnected.cancel();
        }
        self.disconnected().await
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed() && !self.disconnected.is_cancelled()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let disconnected = CancellationToken::new();
    let disconnected_owner = disconnected.clone();

    tokio::spawn(async move {
        let handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

        info!("Handle owner task started for {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for {}", session_id);
                        break;
                    };
                    match cmd {
                        HandleCommand::ChannelOpenSession { reply_tx } => {
                            let result = handle.channel_open_session().await;
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving channel_open_session result");
                            }
                        }

                        HandleCommand::ChannelOpenDirectTcpip {
                            host,
                            port,
                            originator_host,
                            originator_port,
                            reply_tx,
                        } => {
                            let result = handle
                                .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                                .await;
                            if reply_tx.send(result).is_err() {
                                debug!("Caller dropped before receiving direct_tcpip result");
                            }
                        }

                        HandleCommand::Disconnect => {
                            info!("Disconnect requested for {}", session_id);
                            break;
                        }
                    }
                }

                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection lost for {}", session_id);
                        break;
                    }
                }
            }
        }

        disconnected_owner.cancel();
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", session_id);
    });

    HandleController::new(cmd_tx, disconnected)
}

/// Answer every queued command with a disconnect error
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_command_channel_reports_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        drop(cmd_rx);
        let controller = HandleController::new(cmd_tx, CancellationToken::new());

        assert!(!controller.is_connected());
        assert!(matches!(
            controller.open_direct_tcpip("localhost", 80, "127.0.0.1", 0).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_dropped_reply_reports_disconnected() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let controller = HandleController::new(cmd_tx, CancellationToken::new());

        // Owner that drops every reply sender without answering
        tokio::spawn(async move { while let Some(_cmd) = cmd_rx.recv().await {} });

        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_owner() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let disconnected = CancellationToken::new();
        let controller = HandleController::new(cmd_tx, disconnected.clone());

        let owner = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if matches!(cmd, HandleCommand::Disconnect) {
                    disconnected.cancel();
                    break;
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(2), controller.disconnect())
            .await
            .unwrap();
        assert!(!controller.is_connected());
        owner.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_after_owner_exit() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        drop(cmd_rx);
        let controller = HandleController::new(cmd_tx, CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(2), controller.disconnect())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), controller.disconnected())
            .await
            .unwrap();
    }
}
