//! Port Forwarding Module
//!
//! Exposes a remote TCP port on a local listener, bridged through a
//! pluggable tunnel transport.

mod allocator;
mod bridge;
mod controller;
mod error;
mod events;
mod session;

pub use allocator::{Allocation, PortAllocator};
pub use controller::{
    parse_port_text, ControllerHandle, ForwardCommand, ForwardController, PortRequest,
};
pub use error::ForwardError;
pub use events::{ForwardEvent, ForwardEventEmitter};
pub use session::{ForwardStats, ForwardingSession, Mapping, SessionOptions, SessionState};
