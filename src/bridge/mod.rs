//! Language server bridge.
//!
//! Each client WebSocket is served by one task that owns the TCP stream to
//! the session's workspace container. Messages are framed with
//! `Content-Length` on the container side and carried as plain JSON-RPC
//! bodies inside tagged events on the client side.

mod framer;
mod gateway;
mod rewrite;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub use framer::{FrameError, LspCodec, MAX_MESSAGE_BYTES};
pub use gateway::LspBridge;
pub use rewrite::PathRewriter;

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Connect { session_id: String },
    Message { message: String },
}

/// Events sent to the client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String },
    Message { message: String },
    Error { code: u16, message: String },
    Disconnected { reason: String },
}

impl ServerEvent {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// What the bridge knows about one attached client connection.
#[derive(Debug, Clone)]
pub struct Registration {
    pub session_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Client connections currently attached to a container, keyed by
/// connection id.
#[derive(Debug, Default)]
pub struct BridgeRegistry {
    connections: DashMap<String, Registration>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: &str, registration: Registration) {
        self.connections.insert(connection_id.to_string(), registration);
    }

    pub fn unregister(&self, connection_id: &str) -> Option<Registration> {
        self.connections.remove(connection_id).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections attached to `session_id`.
    pub fn connections_for(&self, session_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .count()
    }
}
