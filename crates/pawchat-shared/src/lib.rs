// Wire types, frames and timing constants shared by every PawChat crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ChatError, Result};
pub use protocol::{ClientFrame, FrameKind, ServerFrame};
pub use types::{
    ChatMessage, ConnectionState, ConnectionStatus, ConversationId, DeliveryStatus, MessageDraft,
    MessageId, MessageKind, OfflineStatus, UserId,
};
