//! Transport port.
//!
//! A [`Connector`] opens one persistent bidirectional link and hands back a
//! pair of channels. The connection manager never touches sockets directly,
//! which keeps it testable against the in-memory connector in
//! [`crate::testing`].

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use pawchat_shared::constants::CHAT_PATH;
use pawchat_shared::{ChatError, ConversationId, Result};

/// Events surfaced by an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One text frame, not yet decoded.
    Frame(String),
    /// The remote side or the network closed the link.
    Closed { reason: Option<String> },
}

/// An open link. Dropping `outbound` asks the transport to close the link
/// gracefully; no [`LinkEvent::Closed`] is reported in that case.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<Link>;
}

/// Build `ws(s)://<host>/chat/<conversationId>?token=<token>`.
pub fn chat_endpoint(
    host: &str,
    secure: bool,
    conversation_id: &ConversationId,
    token: &str,
) -> Result<Url> {
    let scheme = if secure { "wss" } else { "ws" };
    let mut url = Url::parse(&format!("{scheme}://{host}"))
        .map_err(|e| ChatError::Transport(format!("Invalid chat host '{host}': {e}")))?;

    url.path_segments_mut()
        .map_err(|_| ChatError::Transport(format!("Chat host '{host}' cannot be a base URL")))?
        .pop_if_empty()
        .push(CHAT_PATH)
        .push(conversation_id.as_str());
    url.query_pairs_mut().append_pair("token", token);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_secure() {
        let url = chat_endpoint("chat.example.com", true, &ConversationId::new("c-42"), "abc")
            .unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/chat/c-42?token=abc");
    }

    #[test]
    fn test_endpoint_plain_with_port_and_escaping() {
        let url =
            chat_endpoint("localhost:8080", false, &ConversationId::new("c 1"), "a&b").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(8080));
        assert_eq!(url.path(), "/chat/c%201");
        assert_eq!(url.query(), Some("token=a%26b"));
    }

    #[test]
    fn test_endpoint_invalid_host() {
        let err = chat_endpoint("", true, &ConversationId::new("c"), "t").unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }
}
