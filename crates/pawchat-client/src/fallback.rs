//! REST fallback used while real-time delivery is unavailable, and for
//! attachment uploads.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use pawchat_shared::{ChatError, ChatMessage, ConversationId, MessageDraft, MessageId, MessageKind, Result};

/// File handed to [`FallbackApi::upload_attachment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub kind: MessageKind,
    pub caption: Option<String>,
}

#[async_trait]
pub trait FallbackApi: Send + Sync + 'static {
    /// Post a message; returns the stored copy with its canonical id.
    async fn send_message(&self, draft: &MessageDraft, temp_id: &MessageId) -> Result<ChatMessage>;

    /// Full history of a conversation, oldest first.
    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>>;

    async fn mark_read(&self, message_id: &MessageId) -> Result<()>;

    async fn upload_attachment(
        &self,
        conversation_id: &ConversationId,
        attachment: Attachment,
    ) -> Result<ChatMessage>;
}

#[derive(Debug, Serialize)]
struct SendBody<'a> {
    body: &'a str,
    message_type: MessageKind,
    temp_id: &'a MessageId,
}

/// [`FallbackApi`] over HTTPS with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpFallback {
    client: Client,
    api_url: Url,
    token: String,
}

impl HttpFallback {
    pub fn new(api_url: &str, token: impl Into<String>) -> Result<Self> {
        let api_url = Url::parse(api_url)
            .map_err(|e| ChatError::Fallback(format!("Invalid API URL '{api_url}': {e}")))?;
        if api_url.cannot_be_a_base() {
            return Err(ChatError::Fallback(format!("API URL '{api_url}' cannot be a base")));
        }
        Ok(Self {
            client: Client::new(),
            api_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Fallback("API URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ChatError::Fallback(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Fallback(format!("Server answered {status}")));
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::Fallback(format!("Invalid response body: {e}")))
    }
}

#[async_trait]
impl FallbackApi for HttpFallback {
    async fn send_message(&self, draft: &MessageDraft, temp_id: &MessageId) -> Result<ChatMessage> {
        let url = self.endpoint(&["conversations", draft.conversation_id.as_str(), "messages"])?;
        debug!(conversation = %draft.conversation_id, "Posting message over REST");
        let body = SendBody {
            body: &draft.body,
            message_type: draft.kind,
            temp_id,
        };
        self.json(self.client.post(url).json(&body)).await
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        self.json(self.client.get(url)).await
    }

    async fn mark_read(&self, message_id: &MessageId) -> Result<()> {
        let url = self.endpoint(&["messages", message_id.as_str(), "read"])?;
        self.execute(self.client.post(url)).await.map(|_| ())
    }

    async fn upload_attachment(
        &self,
        conversation_id: &ConversationId,
        attachment: Attachment,
    ) -> Result<ChatMessage> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "attachments"])?;
        let size = attachment.bytes.len();

        let part = Part::bytes(attachment.bytes)
            .file_name(attachment.file_name.clone())
            .mime_str(&attachment.mime_type)
            .map_err(|e| ChatError::Fallback(format!("Invalid MIME type: {e}")))?;
        let message_type = serde_json::to_value(attachment.kind)?
            .as_str()
            .unwrap_or("file")
            .to_string();
        let mut form = Form::new()
            .part("file", part)
            .text("message_type", message_type);
        if let Some(caption) = attachment.caption {
            form = form.text("caption", caption);
        }

        debug!(conversation = %conversation_id, file = %attachment.file_name, size, "Uploading attachment");
        self.json(self.client.post(url).multipart(form)).await
    }
}
