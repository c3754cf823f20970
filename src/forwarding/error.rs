//! Forwarding Error types

use std::net::SocketAddr;

use thiserror::Error;

use super::session::SessionState;
use crate::config::SshConfigError;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Port already in use: {0}. Another application may be using this port.")]
    AddrInUse(SocketAddr),

    #[error("Permission denied binding to {0}. Ports below 1024 require elevated privileges.")]
    PermissionDenied(SocketAddr),

    #[error("Address not available: {0}. The specified address is not valid on this system.")]
    AddrNotAvailable(SocketAddr),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("Invalid port '{0}': expected a number between 1 and 65535")]
    InvalidPort(String),

    #[error("No local port available: {0}")]
    Allocation(#[source] std::io::Error),

    #[error("Cannot {operation} a session that is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    Host(#[from] SshConfigError),

    #[error(transparent)]
    Transport(#[from] SshError),
}

impl ForwardError {
    /// Classify a listener bind failure
    pub fn from_bind(addr: SocketAddr, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::AddrInUse(addr),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(addr),
            std::io::ErrorKind::AddrNotAvailable => Self::AddrNotAvailable(addr),
            _ => Self::Bind { addr, source: err },
        }
    }
}
