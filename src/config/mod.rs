//! Configuration Module
//!
//! Host inventory from the SSH config, shell variable expansion for its
//! values, and the persisted kport settings.

pub mod expand;
pub mod settings;
pub mod ssh_config;

pub use expand::expand_shell_vars;
pub use settings::{
    config_dir, settings_file, Settings, SettingsError, SettingsStorage, TransportKind,
    DEFAULT_PROBE_PORTS, TRANSPORT_ENV,
};
pub use ssh_config::{
    default_ssh_config_path, parse_ssh_config_content, HostDescriptor, HostInventory,
    SshConfigError, SshConfigHost,
};
