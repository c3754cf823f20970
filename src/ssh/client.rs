//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use russh::*;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};

pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect, authenticate and hand the session to a handle owner task
    pub async fn connect(self, session_id: String) -> Result<HandleController, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", addr)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.config.host.clone(), self.config.port);

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        self.authenticate(&mut handle).await?;

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        Ok(spawn_handle_owner_task(handle, session_id))
    }

    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> Result<(), SshError> {
        if self.config.auth.is_empty() {
            return Err(SshError::AuthenticationFailed(
                "No SSH authentication methods available - set up SSH keys or an SSH agent"
                    .to_string(),
            ));
        }

        let mut failures = Vec::new();
        for method in &self.config.auth {
            match self.try_method(handle, method).await {
                Ok(true) => return Ok(()),
                Ok(false) => failures.push(format!("{}: rejected", describe(method))),
                Err(e) => {
                    debug!("Authentication method {} failed: {}", describe(method), e);
                    failures.push(format!("{}: {}", describe(method), e));
                }
            }
        }

        Err(SshError::AuthenticationFailed(failures.join("; ")))
    }

    async fn try_method(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        method: &AuthMethod,
    ) -> Result<bool, SshError> {
        match method {
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                let result = handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
                Ok(result.success())
            }
            AuthMethod::Agent => {
                let mut agent = SshAgentClient::connect().await?;
                agent.authenticate(handle, &self.config.username).await?;
                Ok(true)
            }
        }
    }
}

fn describe(method: &AuthMethod) -> String {
    match method {
        AuthMethod::Key { key_path, .. } => format!("key {}", key_path),
        AuthMethod::Agent => "agent".to_string(),
    }
}

/// Client handler for russh callbacks
///
/// Host keys are accepted as presented; the fingerprint is logged so the
/// operator can audit it.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        if self.port == 22 {
            info!("Host key for {}: {}", self.host, fingerprint);
        } else {
            info!("Host key for [{}]:{}: {}", self.host, self.port, fingerprint);
        }
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        // Reverse forwarding is never requested, so any such channel is unexpected
        warn!(
            "Refusing unexpected forwarded-tcpip channel for {}:{}",
            connected_address, connected_port
        );
        let _ = channel.close().await;
        Ok(())
    }
}
