//! Settings Storage
//!
//! Tunables for discovery, forwarding and the transports.
//! Location: ~/.kport/settings.json on macOS/Linux, %APPDATA%\kport on Windows

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

/// Environment variable overriding [`Settings::transport`]
pub const TRANSPORT_ENV: &str = "KPORT_TRANSPORT";

/// Well-known ports tried when no enumeration command works
pub const DEFAULT_PROBE_PORTS: [u16; 10] = [80, 443, 3000, 3001, 4000, 5000, 8000, 8080, 8443, 9000];

/// Settings storage errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown transport '{0}' (expected 'native' or 'process')")]
    UnknownTransport(String),
}

/// Which tunnel implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process russh session, one direct-tcpip channel per connection
    #[default]
    Native,
    /// External `ssh -N -L` process per session
    Process,
}

impl FromStr for TransportKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "process" => Ok(Self::Process),
            other => Err(SettingsError::UnknownTransport(other.to_string())),
        }
    }
}

/// Persisted settings, every field defaulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportKind,
    /// Address local listeners bind to
    pub bind_address: String,
    pub connect_timeout_secs: u64,
    /// Bound for each enumeration command during discovery
    pub command_timeout_secs: u64,
    /// Bound for each active probe during discovery
    pub probe_timeout_ms: u64,
    pub probe_ports: Vec<u16>,
    /// How long the accept loop waits before re-checking the stop signal
    pub accept_poll_ms: u64,
    /// Program used by the process transport
    pub ssh_program: String,
    /// Time between SIGTERM and kill for the forwarding process
    pub terminate_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Native,
            bind_address: "127.0.0.1".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: 5,
            probe_timeout_ms: 2000,
            probe_ports: DEFAULT_PROBE_PORTS.to_vec(),
            accept_poll_ms: 1000,
            ssh_program: "ssh".to_string(),
            terminate_grace_ms: 2000,
        }
    }
}

impl Settings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Apply `KPORT_TRANSPORT` if set
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        if let Ok(value) = std::env::var(TRANSPORT_ENV) {
            if !value.trim().is_empty() {
                self.transport = value.parse()?;
            }
        }
        Ok(())
    }
}

/// Get the kport configuration directory
/// Returns %APPDATA%\kport on Windows, ~/.kport on macOS/Linux
pub fn config_dir() -> Result<PathBuf, SettingsError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("kport"));
        }
        dirs::home_dir()
            .map(|home| home.join(".kport"))
            .ok_or(SettingsError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".kport"))
            .ok_or(SettingsError::NoConfigDir)
    }
}

/// Get the settings file path
pub fn settings_file() -> Result<PathBuf, SettingsError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Settings storage manager
pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, SettingsError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get settings file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load settings from disk
    /// Returns defaults if the file doesn't exist
    /// If the file is corrupted, backs it up and returns defaults
    pub async fn load(&self) -> Result<Settings, SettingsError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(settings) => Ok(settings),
                Err(e) => {
                    tracing::warn!("Settings file corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted settings backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted settings: {}", backup_err);
                        }
                    }

                    Ok(Settings::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(SettingsError::Io(e)),
        }
    }

    /// Copy the current file next to itself with a `.bak` suffix
    pub async fn backup(&self) -> Result<PathBuf, SettingsError> {
        let backup_path = self.path.with_extension("json.bak");
        fs::copy(&self.path, &backup_path).await?;
        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = SettingsStorage::with_path(temp.path().join("settings.json"));

        let settings = storage.load().await.unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.probe_ports, DEFAULT_PROBE_PORTS.to_vec());
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{"transport":"process","accept_poll_ms":250}"#).unwrap();

        let settings = SettingsStorage::with_path(path).load().await.unwrap();
        assert_eq!(settings.transport, TransportKind::Process);
        assert_eq!(settings.accept_poll(), Duration::from_millis(250));
        assert_eq!(settings.bind_address, "127.0.0.1");
        assert_eq!(settings.command_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_corrupted_file_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let settings = SettingsStorage::with_path(path.clone()).load().await.unwrap();
        assert_eq!(settings, Settings::default());

        let backup = std::fs::read_to_string(path.with_extension("json.bak")).unwrap();
        assert_eq!(backup, "{ not json");
    }

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("native".parse::<TransportKind>().unwrap(), TransportKind::Native);
        assert_eq!(" Process ".parse::<TransportKind>().unwrap(), TransportKind::Process);
        assert!(matches!(
            "telnet".parse::<TransportKind>(),
            Err(SettingsError::UnknownTransport(_))
        ));
    }
}
