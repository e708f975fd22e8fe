use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::DeliveryStatus;

/// Commands sent FROM client TO server over the WebSocket.
///
/// Flat, internally tagged on `event` so frames read like
/// `{"event":"join","room":"general"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Establish identity. Required before any other command.
    Authenticate { token: String },

    /// Enter a room (idempotent).
    Join { room: String },

    /// Leave a room (idempotent).
    Leave { room: String },

    /// Broadcast a line to everyone currently in the room.
    RoomMessage { room: String, message: String },

    /// Persisted one-to-one message addressed by username.
    DirectMessage { to: String, message: String },

    /// Ephemeral typing indicator for a room.
    Typing { room: String },

    /// Ask the server for a farewell and a controlled close.
    DisconnectRequest {},
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// General acknowledgement/broadcast payload. `count` is the
    /// originating connection's monotonically increasing counter.
    ServerResponse { data: String, count: u64 },

    /// A persisted direct message pushed live to the recipient.
    DirectMessage {
        id: i64,
        from: String,
        body: String,
        sent_at: DateTime<Utc>,
        delivery_status: DeliveryStatus,
    },

    /// Someone else in the room is typing.
    Typing { room: String, username: String },

    /// Per-event failure. The connection stays up.
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl GatewayEvent {
    pub fn error(error: &str) -> Self {
        Self::Error {
            error: error.to_string(),
            message: None,
        }
    }

    pub fn error_with(error: &str, message: impl Into<String>) -> Self {
        Self::Error {
            error: error.to_string(),
            message: Some(message.into()),
        }
    }
}
