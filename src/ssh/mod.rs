//! SSH module - library-level secure session used by the native transport
//!
//! This module provides the russh client side of kport.
//!
//! # Features
//! - Connection with an ordered chain of authentication methods
//!   (identity file, SSH agent, default keys)
//! - Single-owner handle task for opening channels concurrently
//! - Remote command execution over exec channels

mod agent;
mod client;
mod config;
mod error;
mod exec;
mod handle_owner;

pub use agent::{is_agent_available, SshAgentClient};
pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use exec::exec_command;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
