//! JSON wire frames exchanged over the persistent chat connection.
//!
//! Every frame is an object tagged by its `type` field. Outbound and inbound
//! vocabularies differ, so each direction has its own enum.

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::{ChatMessage, ConversationId, DeliveryStatus, MessageId, MessageKind, UserId};

/// Frames sent *to* the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        body: String,
        #[serde(rename = "message_type")]
        kind: MessageKind,
        temp_id: MessageId,
    },
    Typing {
        is_typing: bool,
    },
    MessageDelivered {
        message_id: MessageId,
    },
    MessageRead {
        message_id: MessageId,
    },
    Ping,
}

/// Frames received *from* the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    NewMessage {
        message: ChatMessage,
    },
    Typing {
        user_id: UserId,
        is_typing: bool,
    },
    MessageStatus {
        message_id: MessageId,
        status: DeliveryStatus,
    },
    ConnectionEstablished {
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    Error {
        message: String,
    },
}

/// Discriminant of [`ServerFrame`], used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    NewMessage,
    Typing,
    MessageStatus,
    ConnectionEstablished,
    Error,
}

impl FrameKind {
    pub const ALL: [FrameKind; 5] = [
        FrameKind::NewMessage,
        FrameKind::Typing,
        FrameKind::MessageStatus,
        FrameKind::ConnectionEstablished,
        FrameKind::Error,
    ];
}

impl ServerFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            ServerFrame::NewMessage { .. } => FrameKind::NewMessage,
            ServerFrame::Typing { .. } => FrameKind::Typing,
            ServerFrame::MessageStatus { .. } => FrameKind::MessageStatus,
            ServerFrame::ConnectionEstablished { .. } => FrameKind::ConnectionEstablished,
            ServerFrame::Error { .. } => FrameKind::Error,
        }
    }

    /// Decode one text frame. Anything that is not a known tagged object is
    /// reported as [`ChatError::MalformedFrame`].
    pub fn from_json(text: &str) -> Result<Self, ChatError> {
        serde_json::from_str(text).map_err(|e| ChatError::MalformedFrame(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ChatError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ChatError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ChatError> {
        serde_json::from_str(text).map_err(|e| ChatError::MalformedFrame(e.to_string()))
    }
}
