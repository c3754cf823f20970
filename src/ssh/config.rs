//! SSH Configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::HostDescriptor;

/// Key files tried when a host has no `IdentityFile`
const DEFAULT_KEY_NAMES: [&str; 3] = ["id_rsa", "id_ecdsa", "id_ed25519"];

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication methods, tried in order until one succeeds
    pub auth: Vec<AuthMethod>,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Authentication methods supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH agent authentication
    Agent,
}

impl AuthMethod {
    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

impl SshConfig {
    /// Resolve the connection settings for an inventory host.
    ///
    /// Authentication material is resolved once, here: the host's identity
    /// file first, then the agent if `SSH_AUTH_SOCK` is usable, then the
    /// conventional key files in `~/.ssh` when no identity was configured.
    pub fn for_host(host: &HostDescriptor, timeout_secs: u64) -> Self {
        let mut auth = Vec::new();

        if let Some(identity) = &host.identity {
            auth.push(AuthMethod::key(identity.clone(), None));
        }

        if super::agent::is_agent_available() {
            auth.push(AuthMethod::Agent);
        }

        if host.identity.is_none() {
            auth.extend(
                default_key_paths()
                    .into_iter()
                    .filter(|path| path.is_file())
                    .map(|path| AuthMethod::key(path.to_string_lossy().into_owned(), None)),
            );
        }

        Self {
            host: host.address.clone(),
            port: host.port,
            username: host.user.clone(),
            auth,
            timeout_secs,
        }
    }
}

fn default_key_paths() -> Vec<PathBuf> {
    match dirs::home_dir() {
        Some(home) => DEFAULT_KEY_NAMES
            .iter()
            .map(|name| home.join(".ssh").join(name))
            .collect(),
        None => Vec::new(),
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    10
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: Vec::new(),
            timeout_secs: 10,
        }
    }
}
