//! kport - expose a remote TCP service on localhost over SSH
//!
//! The crate is organised around the tunnel session engine:
//!
//! - [`discovery`] finds which ports a remote host is listening on
//! - [`forwarding`] allocates a local port, runs the forwarding session and
//!   exposes the asynchronous controller protocol
//! - [`transport`] abstracts the secure channel (russh session or an external
//!   `ssh` process)
//! - [`ssh`] holds the russh client, agent auth and the handle owner task
//! - [`config`] loads the host inventory and settings

pub mod config;
pub mod discovery;
pub mod forwarding;
pub mod ssh;
pub mod transport;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Logs go to stderr so stdout stays reserved for rendered results.
/// `RUST_LOG` wins over `verbose` when set.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
