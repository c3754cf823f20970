//! SSH Config Parser
//!
//! Loads the host inventory from ~/.ssh/config.
//! Supports:
//! - Basic: Host, HostName, User, Port, IdentityFile
//! - Include, with glob patterns and paths relative to ~/.ssh

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::expand::expand_shell_vars;

/// Nested Include limit, breaks include cycles
const MAX_INCLUDE_DEPTH: usize = 16;

/// A host the core can connect to, with all variables expanded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// Alias from the `Host` line
    pub name: String,
    /// Address to connect to (HostName, or the alias)
    pub address: String,
    /// Login user (User, or the local user)
    pub user: String,
    /// SSH port
    pub port: u16,
    /// Identity file path
    pub identity: Option<String>,
}

/// A parsed SSH config host entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfigHost {
    /// Host alias (the pattern after "Host")
    pub alias: String,
    /// Actual hostname (HostName directive)
    pub hostname: Option<String>,
    /// Username (User directive)
    pub user: Option<String>,
    /// Port number (Port directive)
    pub port: Option<u16>,
    /// Identity file path (IdentityFile directive)
    pub identity_file: Option<String>,
}

impl SshConfigHost {
    /// Get the effective hostname (hostname or alias)
    pub fn effective_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.alias)
    }

    /// Get effective port (port or 22)
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    /// Check if this is a wildcard pattern
    pub fn is_wildcard(&self) -> bool {
        self.alias.contains('*') || self.alias.contains('?')
    }

    /// Build the descriptor handed to the core, expanding `User` and
    /// `IdentityFile`
    pub fn to_descriptor(&self) -> HostDescriptor {
        let user = match self.user.as_deref().map(expand_shell_vars) {
            Some(user) if !user.is_empty() => user,
            _ => whoami::username(),
        };

        HostDescriptor {
            name: self.alias.clone(),
            address: self.effective_hostname().to_string(),
            user,
            port: self.effective_port(),
            identity: self
                .identity_file
                .as_deref()
                .map(expand_shell_vars)
                .filter(|path| !path.is_empty()),
        }
    }
}

/// SSH config parser errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Host '{0}' not found")]
    HostNotFound(String),
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    ssh_dir().map(|dir| dir.join("config"))
}

fn ssh_dir() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// One top-level item of a config file
#[derive(Debug)]
enum ConfigEntry {
    Host(SshConfigHost),
    Include(String),
}

/// Parse SSH config content string. `Include` lines are ignored here; see
/// [`HostInventory::load`] for include resolution.
pub fn parse_ssh_config_content(content: &str) -> Result<Vec<SshConfigHost>, SshConfigError> {
    Ok(parse_entries(content)?
        .into_iter()
        .filter_map(|entry| match entry {
            ConfigEntry::Host(host) => Some(host),
            ConfigEntry::Include(_) => None,
        })
        .collect())
}

fn parse_entries(content: &str) -> Result<Vec<ConfigEntry>, SshConfigError> {
    let mut entries = Vec::new();
    let mut current_host: Option<SshConfigHost> = None;
    // Set while inside a wildcard-only block, whose directives are dropped
    let mut in_skipped_block = false;

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Parse "Key Value" or "Key=Value"
        let (key, value) = if let Some(eq_pos) = line.find('=') {
            (line[..eq_pos].trim(), line[eq_pos + 1..].trim())
        } else {
            let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
            if parts.len() < 2 {
                continue; // Skip malformed lines
            }
            (parts[0], parts[1].trim())
        };

        let key_lower = key.to_lowercase();

        match key_lower.as_str() {
            "host" => {
                if let Some(host) = current_host.take() {
                    entries.push(ConfigEntry::Host(host));
                }

                // Only the first non-wildcard alias of the line is kept
                current_host = value
                    .split_whitespace()
                    .find(|alias| !alias.contains('*') && !alias.contains('?'))
                    .map(|alias| SshConfigHost {
                        alias: alias.to_string(),
                        ..Default::default()
                    });
                in_skipped_block = current_host.is_none();
            }
            "include" => {
                entries.extend(
                    value
                        .split_whitespace()
                        .map(|pattern| ConfigEntry::Include(pattern.to_string())),
                );
            }
            _ => {
                let Some(host) = current_host.as_mut() else {
                    if !in_skipped_block {
                        debug!("Ignoring global directive '{}'", key);
                    }
                    continue;
                };
                match key_lower.as_str() {
                    "hostname" => host.hostname = Some(value.to_string()),
                    "user" => host.user = Some(value.to_string()),
                    "port" => {
                        let port = value.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(|| {
                            SshConfigError::Parse {
                                line: index + 1,
                                message: format!("invalid port '{}'", value),
                            }
                        })?;
                        host.port = Some(port);
                    }
                    "identityfile" => host.identity_file = Some(value.to_string()),
                    _ => {} // Ignore other directives
                }
            }
        }
    }

    // Don't forget the last host
    if let Some(host) = current_host {
        entries.push(ConfigEntry::Host(host));
    }

    Ok(entries)
}

/// Hosts loaded from an SSH config file and everything it includes
#[derive(Debug, Clone, Default)]
pub struct HostInventory {
    hosts: Vec<SshConfigHost>,
}

impl HostInventory {
    /// Load the inventory from `path`, or ~/.ssh/config when `None`.
    /// A missing file yields an empty inventory.
    pub async fn load(path: Option<PathBuf>) -> Result<Self, SshConfigError> {
        let path = match path {
            Some(p) => p,
            None => default_ssh_config_path()?,
        };
        // Relative includes resolve against ~/.ssh, as ssh(1) does for the
        // user config; fall back to the file's own directory without a home
        let include_base = ssh_dir()
            .ok()
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        let mut hosts = Vec::new();
        load_file(&path, &include_base, 0, &mut hosts).await?;
        Ok(Self { hosts })
    }

    pub fn from_hosts(hosts: Vec<SshConfigHost>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[SshConfigHost] {
        &self.hosts
    }

    /// Descriptors for every host, in file order
    pub fn descriptors(&self) -> Vec<HostDescriptor> {
        self.hosts.iter().map(SshConfigHost::to_descriptor).collect()
    }

    /// Raw entry for an alias, before expansion
    pub fn find(&self, name: &str) -> Option<&SshConfigHost> {
        self.hosts.iter().find(|host| host.alias == name)
    }

    /// Find a host by its alias
    pub fn get_host_by_name(&self, name: &str) -> Result<HostDescriptor, SshConfigError> {
        self.find(name)
            .map(SshConfigHost::to_descriptor)
            .ok_or_else(|| SshConfigError::HostNotFound(name.to_string()))
    }
}

fn load_file<'a>(
    path: &'a Path,
    include_base: &'a Path,
    depth: usize,
    hosts: &'a mut Vec<SshConfigHost>,
) -> Pin<Box<dyn Future<Output = Result<(), SshConfigError>> + Send + 'a>> {
    Box::pin(async move {
        let content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("SSH config {:?} does not exist", path);
                return Ok(());
            }
            Err(e) => return Err(SshConfigError::Io(e)),
        };

        for entry in parse_entries(&content)? {
            match entry {
                ConfigEntry::Host(host) => hosts.push(host),
                ConfigEntry::Include(pattern) => {
                    if depth + 1 > MAX_INCLUDE_DEPTH {
                        warn!("Include depth limit reached at {:?}, skipping '{}'", path, pattern);
                        continue;
                    }
                    for included in resolve_include(&pattern, include_base) {
                        load_file(&included, include_base, depth + 1, hosts).await?;
                    }
                }
            }
        }

        Ok(())
    })
}

/// Expand an Include pattern into the matching files, sorted
fn resolve_include(pattern: &str, include_base: &Path) -> Vec<PathBuf> {
    let expanded = expand_shell_vars(pattern);
    let full = if Path::new(&expanded).is_absolute() {
        PathBuf::from(expanded)
    } else {
        include_base.join(expanded)
    };

    let full = full.to_string_lossy().into_owned();
    match glob::glob(&full) {
        Ok(paths) => {
            let mut matches: Vec<PathBuf> = paths
                .filter_map(|entry| match entry {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!("Unreadable Include match: {}", e);
                        None
                    }
                })
                .filter(|path| path.is_file())
                .collect();
            matches.sort();
            matches
        }
        Err(e) => {
            warn!("Invalid Include pattern '{}': {}", pattern, e);
            Vec::new()
        }
    }
}
