//! SSH Agent authentication
//!
//! Delegates signing of the server challenge to the system agent through
//! russh's [`AgentClient`]. On Unix the agent is reached via `SSH_AUTH_SOCK`,
//! on Windows via the OpenSSH named pipe.
//!
//! russh's own `impl Signer for AgentClient` borrows the requested public key
//! across an `.await`, which makes the resulting future non-`Send`. The
//! [`AgentSigner`] wrapper clones the key first so the authentication future
//! can be spawned on the multi-threaded runtime.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connection to the system SSH agent
pub struct SshAgentClient {
    agent: DynAgent,
}

impl SshAgentClient {
    /// Connect to the system SSH Agent
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::AgentNotAvailable(format!(
                    "{}. Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            debug!("Connected to SSH Agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    SshError::AgentNotAvailable(format!(
                        "{}. Make sure the OpenSSH Authentication Agent service is running.",
                        e
                    ))
                })?;
            debug!("Connected to SSH Agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::AgentNotAvailable(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Try every identity held by the agent until the server accepts one
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<(), SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            return Err(SshError::AgentError(
                "SSH Agent has no keys loaded. Add keys with: ssh-add".to_string(),
            ));
        }

        debug!("SSH Agent offers {} key(s)", keys.len());

        let mut last_error: Option<String> = None;
        for key in &keys {
            let result = handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await;

            match result {
                Ok(result) if result.success() => {
                    info!("Authenticated with agent key {}", key.comment());
                    return Ok(());
                }
                Ok(_) => debug!("Agent key rejected by server: {}", key.comment()),
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SshError::AgentError(format!(
            "No agent key was accepted by the server (tried {}){}",
            keys.len(),
            last_error
                .map(|e| format!(". Last error: {}", e))
                .unwrap_or_default()
        )))
    }
}

/// Quick check whether an agent endpoint appears to exist
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var_os("SSH_AUTH_SOCK").is_some_and(|sock| !sock.is_empty())
    }

    #[cfg(windows)]
    {
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_reports_missing_agent() {
        match SshAgentClient::connect().await {
            Ok(_) => {}
            Err(SshError::AgentNotAvailable(_)) => {}
            Err(e) => panic!("Unexpected error type: {:?}", e),
        }
    }
}
