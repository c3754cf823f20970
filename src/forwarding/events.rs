//! Forward Event System
//!
//! Terminal results of controller commands. Events are serializable so a
//! front end can forward them as JSON.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted by the forwarding controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// Discovery finished (possibly with no ports)
    #[serde(rename_all = "camelCase")]
    Discovered { host: String, ports: Vec<u16> },
    /// A forwarding session is running
    #[serde(rename_all = "camelCase")]
    ForwardingStarted {
        session_id: String,
        host: String,
        local_port: u16,
        remote_port: u16,
        same_port: bool,
    },
    /// A command could not be carried out
    #[serde(rename_all = "camelCase")]
    Error { reason: String },
    /// A session finished stopping
    #[serde(rename_all = "camelCase")]
    SessionStopped {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Event emitter for the forwarding controller
///
/// Can be a no-op for tests or callers that don't care about events.
#[derive(Clone, Debug)]
pub struct ForwardEventEmitter {
    tx: Option<mpsc::UnboundedSender<ForwardEvent>>,
}

impl ForwardEventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<ForwardEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a no-op emitter
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ForwardEvent) {
        if let Some(ref tx) = self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("Forward event dropped, receiver gone");
            }
        }
    }

    pub fn emit_error(&self, reason: impl Into<String>) {
        self.emit(ForwardEvent::Error {
            reason: reason.into(),
        });
    }

    pub fn emit_session_stopped(&self, session_id: &str, reason: Option<String>) {
        self.emit(ForwardEvent::SessionStopped {
            session_id: session_id.to_string(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_emitter() {
        let emitter = ForwardEventEmitter::noop();
        // Should not panic
        emitter.emit_error("nothing listens");
        emitter.emit_session_stopped("s-1", None);
    }

    #[test]
    fn test_event_serialization() {
        let event = ForwardEvent::ForwardingStarted {
            session_id: "s-1".into(),
            host: "web".into(),
            local_port: 8080,
            remote_port: 8080,
            same_port: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "forwardingStarted");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["localPort"], 8080);
        assert_eq!(json["samePort"], true);

        let stopped = serde_json::to_string(&ForwardEvent::SessionStopped {
            session_id: "s-1".into(),
            reason: None,
        })
        .unwrap();
        assert_eq!(stopped, r#"{"type":"sessionStopped","sessionId":"s-1"}"#);
    }
}
