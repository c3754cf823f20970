//! SSH Error types

use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Remote command ran but exited unsuccessfully
    #[error("Remote command failed ({status}){}", detail_suffix(.detail))]
    CommandFailed { status: String, detail: String },

    /// The local `ssh` helper could not be run or died early
    #[error("Forwarding process failed: {0}")]
    ProcessFailed(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

impl SshError {
    /// Build a `CommandFailed` from an exit status and one line of stderr
    pub fn command_failed(status: impl Display, stderr_line: Option<&str>) -> Self {
        SshError::CommandFailed {
            status: status.to_string(),
            detail: stderr_line.unwrap_or("").trim().to_string(),
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
