use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by locally generated message ids until the server echoes
/// the canonical one.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// The conversation a connection is scoped to (one per service request).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier.
///
/// Either canonical (assigned by the server) or temporary (`temp-<uuid>`),
/// generated locally for optimistic display before the server acknowledges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Location,
    System,
    ServiceUpdate,
}

/// Delivery state of a message. Ordered: a status only ever moves forward.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Outbound and not yet echoed by the server (optimistic or queued).
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Returns the later of the two states.
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }
}

/// A chat message as stored in a conversation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default)]
    pub edited: bool,
    /// Temporary id of the optimistic copy this message acknowledges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
}

/// Outbound payload as handed to the façade by the application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
}

impl MessageDraft {
    pub fn text(conversation_id: ConversationId, body: impl Into<String>) -> Self {
        Self {
            conversation_id,
            body: body.into(),
            kind: MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect budget exhausted; real-time delivery is unavailable.
    Disabled,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Value published to connection observers on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: ConnectionState,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        Self {
            connected: state.is_connected(),
            state,
        }
    }
}

/// Snapshot exposed by `get_offline_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub is_online: bool,
    pub queued_messages: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_ids_are_unique_and_flagged() {
        let a = MessageId::temporary();
        let b = MessageId::temporary();
        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert!(!MessageId::new("msg-42").is_temporary());
    }

    #[test]
    fn test_delivery_status_never_regresses() {
        let status = DeliveryStatus::Read.advance(DeliveryStatus::Delivered);
        assert_eq!(status, DeliveryStatus::Read);
        assert_eq!(
            DeliveryStatus::Sent.advance(DeliveryStatus::Delivered),
            DeliveryStatus::Delivered
        );
    }

    #[test]
    fn test_message_kind_wire_names() {
        let json = serde_json::to_string(&MessageKind::ServiceUpdate).unwrap();
        assert_eq!(json, "\"service_update\"");
    }
}
