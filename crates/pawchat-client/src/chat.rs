//! Chat façade.
//!
//! `ChatClient` wires the connection manager, offline queue, status tracker
//! and conversation store together and is the only type the application
//! talks to. Construct it inside a tokio runtime: it spawns its background
//! tasks immediately and aborts them when the last handle is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pawchat_net::{listener, ConnectionManager, Connector, Listener, WebSocketConnector};
use pawchat_shared::{
    ChatError, ChatMessage, ClientFrame, ConnectionState, ConnectionStatus, ConversationId,
    DeliveryStatus, FrameKind, MessageDraft, MessageId, OfflineStatus, Result, ServerFrame,
    UserId,
};
use pawchat_store::{KeyValueStore, SqliteStore};

use crate::config::ClientConfig;
use crate::conversation::{ConversationEvent, ConversationSnapshot, ConversationStore};
use crate::fallback::{Attachment, FallbackApi, HttpFallback};
use crate::offline_queue::{DroppedMessage, OfflineQueue, QueuedMessage};
use crate::status_tracker::{AckSink, StatusTracker};

/// How a [`ChatClient::send_message`] call was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the real-time link; shown under `temp_id` until echoed.
    Sent { temp_id: MessageId },
    /// Stored by the REST fallback under its canonical id.
    Posted { message_id: MessageId },
    /// Persisted in the offline queue.
    Queued { queue_id: Uuid },
}

/// Routes acknowledgements over the live link, or the REST fallback for
/// read receipts when the link is down.
struct ChannelAcks {
    manager: ConnectionManager,
    fallback: Option<Arc<dyn FallbackApi>>,
}

#[async_trait]
impl AckSink for ChannelAcks {
    async fn ack_delivered(&self, id: &MessageId) -> Result<()> {
        self.manager.send(&ClientFrame::MessageDelivered {
            message_id: id.clone(),
        })
    }

    async fn ack_read(&self, id: &MessageId) -> Result<()> {
        let frame = ClientFrame::MessageRead {
            message_id: id.clone(),
        };
        match self.manager.send(&frame) {
            Err(ChatError::NotConnected) => match &self.fallback {
                Some(fallback) => fallback.mark_read(id).await,
                None => Err(ChatError::NotConnected),
            },
            other => other,
        }
    }
}

struct Shared {
    user_id: UserId,
    token: String,
    poll_interval: Duration,
    manager: ConnectionManager,
    queue: Arc<OfflineQueue>,
    tracker: StatusTracker,
    conversations: ConversationStore,
    fallback: Option<Arc<dyn FallbackApi>>,
    active: Mutex<Option<ConversationId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to the chat subsystem.
#[derive(Clone)]
pub struct ChatClient {
    shared: Arc<Shared>,
}

impl ChatClient {
    /// Build a client from its collaborators.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn KeyValueStore>,
        fallback: Option<Arc<dyn FallbackApi>>,
    ) -> Result<Self> {
        let manager = ConnectionManager::new(config.connection.clone(), connector);
        let queue = Arc::new(OfflineQueue::load(store)?);
        let acks = Arc::new(ChannelAcks {
            manager: manager.clone(),
            fallback: fallback.clone(),
        });
        let tracker = StatusTracker::new(config.user_id.clone(), acks, config.tracker);

        let shared = Arc::new(Shared {
            user_id: config.user_id,
            token: config.token,
            poll_interval: config.poll_interval,
            manager,
            queue,
            tracker,
            conversations: ConversationStore::new(),
            fallback,
            active: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        Shared::wire_frames(&shared);
        Shared::spawn_background(&shared);

        Ok(Self { shared })
    }

    /// Build a client with the WebSocket connector, SQLite-backed queue and,
    /// if an API URL is configured, the HTTP fallback.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let store = match &config.queue_db {
            Some(path) => SqliteStore::open_at(path),
            None => SqliteStore::open_default(),
        }
        .map_err(|e| ChatError::Storage(e.to_string()))?;

        let fallback: Option<Arc<dyn FallbackApi>> = match &config.api_url {
            Some(url) => Some(Arc::new(HttpFallback::new(url, config.token.clone())?)),
            None => None,
        };

        Self::new(
            config,
            Arc::new(WebSocketConnector::new()),
            Arc::new(store),
            fallback,
        )
    }

    /// Connect to `conversation_id`, leaving the previous conversation if it
    /// differs. When the first attempt fails the error is returned while
    /// reconnection continues in the background.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let previous = self.shared.active().replace(conversation_id.clone());
        if let Some(previous) = previous.filter(|p| p != &conversation_id) {
            self.shared.untrack(&previous);
            info!(from = %previous, to = %conversation_id, "Switching conversation");
        }
        match self
            .shared
            .manager
            .connect(conversation_id.clone(), &self.shared.token)
            .await
        {
            Ok(()) | Err(ChatError::AlreadyConnected) => Ok(()),
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Opening conversation failed");
                Err(e)
            }
        }
    }

    /// Disconnect, stop tracking the messages of the active conversation and
    /// release its cached history.
    pub fn close_conversation(&self) {
        let closed = self.shared.active().take();
        self.shared.manager.disconnect();
        if let Some(conversation_id) = closed {
            self.shared.untrack(&conversation_id);
            self.shared.conversations.forget(&conversation_id);
            info!(conversation = %conversation_id, "Conversation closed");
        }
    }

    /// Drop a message from the conversation and cancel its pending
    /// acknowledgements.
    pub fn remove_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Arc<ConversationSnapshot> {
        self.shared.tracker.remove(message_id);
        self.shared
            .conversations
            .apply(conversation_id, ConversationEvent::Removed(message_id.clone()))
    }

    /// Deliver `draft` directly when possible, otherwise queue it. Each call
    /// results in exactly one of the two.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<SendOutcome> {
        match self.shared.transmit(&draft).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                debug!(error = %e, "Direct send unavailable, queueing");
                let queued = self.shared.queue.enqueue(draft)?;
                Ok(SendOutcome::Queued {
                    queue_id: queued.id,
                })
            }
        }
    }

    /// Upload a file. Attachments always go over REST.
    pub async fn send_attachment(
        &self,
        conversation_id: &ConversationId,
        attachment: Attachment,
    ) -> Result<ChatMessage> {
        let fallback = self
            .shared
            .fallback
            .as_ref()
            .ok_or(ChatError::FallbackUnavailable)?;
        let message = fallback.upload_attachment(conversation_id, attachment).await?;
        self.shared.conversations.apply(
            &message.conversation_id,
            ConversationEvent::Incoming(message.clone()),
        );
        Ok(message)
    }

    pub fn send_typing(&self, is_typing: bool) {
        self.shared.manager.send_typing_indicator(is_typing);
    }

    /// Cached conversation plus queued messages not yet sent, shown as
    /// `pending` under their queue id.
    pub fn get_conversation(&self, conversation_id: &ConversationId) -> Arc<ConversationSnapshot> {
        let cached = self.shared.conversations.get(conversation_id);
        let queued: Vec<QueuedMessage> = self
            .shared
            .queue
            .snapshot()
            .into_iter()
            .filter(|q| &q.payload.conversation_id == conversation_id)
            .collect();
        if queued.is_empty() {
            return cached;
        }

        let mut merged = ConversationSnapshot::clone(&cached);
        merged.messages.extend(queued.into_iter().map(|q| ChatMessage {
            id: MessageId::new(q.id.to_string()),
            conversation_id: q.payload.conversation_id,
            sender_id: self.shared.user_id.clone(),
            body: q.payload.body,
            kind: q.payload.kind,
            created_at: q.enqueued_at,
            status: DeliveryStatus::Pending,
            edited: false,
            temp_id: None,
        }));
        Arc::new(merged)
    }

    /// Re-read the conversation from the REST API and merge it in.
    pub async fn refresh_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Arc<ConversationSnapshot>> {
        self.shared.refresh(conversation_id).await
    }

    pub fn get_offline_status(&self) -> OfflineStatus {
        OfflineStatus {
            is_online: self.shared.manager.is_connected(),
            ..self.shared.queue.status()
        }
    }

    /// Mark `message_id` read. Idempotent.
    pub async fn mark_read(&self, message_id: &MessageId) {
        self.shared.tracker.mark_read(message_id).await;
        if let Some(conversation_id) = self.shared.conversations.locate(message_id) {
            self.shared.conversations.apply(
                &conversation_id,
                ConversationEvent::StatusChanged {
                    id: message_id.clone(),
                    status: DeliveryStatus::Read,
                },
            );
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.manager.status()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.manager.subscribe_state()
    }

    pub fn on_connection_change(&self, listener: Listener<ConnectionStatus>) -> bool {
        self.shared.manager.on_connection_change(listener)
    }

    pub fn off_connection_change(&self, listener: &Listener<ConnectionStatus>) -> bool {
        self.shared.manager.off_connection_change(listener)
    }

    pub fn on_message(&self, kind: FrameKind, listener: Listener<ServerFrame>) -> bool {
        self.shared.manager.on_message(kind, listener)
    }

    pub fn off_message(&self, kind: FrameKind, listener: &Listener<ServerFrame>) -> bool {
        self.shared.manager.off_message(kind, listener)
    }

    /// Notices for queued messages dropped after exhausting their retries.
    pub fn dropped_messages(&self) -> tokio::sync::broadcast::Receiver<DroppedMessage> {
        self.shared.queue.notices()
    }
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<ConversationId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self, conversation_id: &ConversationId) -> bool {
        self.active().as_ref() == Some(conversation_id)
    }

    /// Only messages of the active conversation are acknowledged.
    fn observe(&self, message: &ChatMessage) {
        if self.is_active(&message.conversation_id) {
            self.tracker.observe(message);
        }
    }

    fn untrack(&self, conversation_id: &ConversationId) {
        let snapshot = self.conversations.get(conversation_id);
        for message in &snapshot.messages {
            self.tracker.remove(&message.id);
        }
    }

    fn optimistic(&self, draft: &MessageDraft, temp_id: &MessageId) -> ChatMessage {
        ChatMessage {
            id: temp_id.clone(),
            conversation_id: draft.conversation_id.clone(),
            sender_id: self.user_id.clone(),
            body: draft.body.clone(),
            kind: draft.kind,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            edited: false,
            temp_id: None,
        }
    }

    /// Try the live link, or the REST fallback once real-time is disabled.
    async fn transmit(&self, draft: &MessageDraft) -> Result<SendOutcome> {
        let temp_id = MessageId::temporary();
        match self.manager.state() {
            ConnectionState::Connected => {
                self.manager.send(&ClientFrame::Message {
                    body: draft.body.clone(),
                    kind: draft.kind,
                    temp_id: temp_id.clone(),
                })?;
                self.conversations.apply(
                    &draft.conversation_id,
                    ConversationEvent::LocalSent(self.optimistic(draft, &temp_id)),
                );
                Ok(SendOutcome::Sent { temp_id })
            }
            ConnectionState::Disabled => {
                let fallback = self.fallback.as_ref().ok_or(ChatError::NotConnected)?;
                let stored = fallback.send_message(draft, &temp_id).await?;
                let message_id = stored.id.clone();
                self.conversations.apply(
                    &draft.conversation_id,
                    ConversationEvent::Incoming(stored),
                );
                Ok(SendOutcome::Posted { message_id })
            }
            _ => Err(ChatError::NotConnected),
        }
    }

    async fn refresh(&self, conversation_id: &ConversationId) -> Result<Arc<ConversationSnapshot>> {
        let fallback = self.fallback.as_ref().ok_or(ChatError::FallbackUnavailable)?;
        let messages = fallback.fetch_messages(conversation_id).await?;
        debug!(conversation = %conversation_id, count = messages.len(), "Fetched conversation");
        for message in &messages {
            self.observe(message);
        }
        Ok(self
            .conversations
            .apply(conversation_id, ConversationEvent::Fetched(messages)))
    }

    /// Reconcile the active conversation over REST, if a fallback exists.
    async fn reconcile(&self) {
        if self.fallback.is_none() {
            return;
        }
        let Some(conversation_id) = self.active().clone() else {
            return;
        };
        if let Err(e) = self.refresh(&conversation_id).await {
            warn!(conversation = %conversation_id, error = %e, "Reconciliation fetch failed");
        }
    }

    /// One fallback round while real-time is disabled: flush the queue over
    /// REST, then reconcile.
    async fn poll_fallback(self: &Arc<Self>) {
        if self.fallback.is_none() {
            return;
        }
        let report = self
            .queue
            .sync(|queued| {
                let shared = self.clone();
                async move { shared.transmit(&queued.payload).await.map(|_| ()) }
            })
            .await;
        if !report.dropped.is_empty() {
            warn!(dropped = report.dropped.len(), "Queued messages dropped during fallback sync");
        }
        self.reconcile().await;
    }

    fn wire_frames(shared: &Arc<Self>) {
        let weak = Arc::downgrade(shared);
        shared.manager.on_message(
            FrameKind::NewMessage,
            listener(move |frame: &ServerFrame| {
                let (Some(shared), ServerFrame::NewMessage { message }) = (weak.upgrade(), frame)
                else {
                    return Ok(());
                };
                shared.conversations.apply(
                    &message.conversation_id,
                    ConversationEvent::Incoming(message.clone()),
                );
                shared.observe(message);
                Ok(())
            }),
        );

        let weak = Arc::downgrade(shared);
        shared.manager.on_message(
            FrameKind::MessageStatus,
            listener(move |frame: &ServerFrame| {
                let (Some(shared), ServerFrame::MessageStatus { message_id, status }) =
                    (weak.upgrade(), frame)
                else {
                    return Ok(());
                };
                if let Some(conversation_id) = shared.conversations.locate(message_id) {
                    shared.conversations.apply(
                        &conversation_id,
                        ConversationEvent::StatusChanged {
                            id: message_id.clone(),
                            status: *status,
                        },
                    );
                }
                shared.tracker.confirm(message_id, *status);
                Ok(())
            }),
        );

        shared.manager.on_message(
            FrameKind::ConnectionEstablished,
            listener(|frame: &ServerFrame| {
                if let ServerFrame::ConnectionEstablished { conversation_id, .. } = frame {
                    debug!(conversation = ?conversation_id, "Server confirmed connection");
                }
                Ok(())
            }),
        );
    }

    fn spawn_background(shared: &Arc<Self>) {
        let weak = Arc::downgrade(shared);
        let auto_sync = shared.queue.spawn_auto_sync(
            shared.manager.subscribe_state(),
            move |queued: QueuedMessage| {
                let shared = weak.upgrade();
                async move {
                    let shared = shared.ok_or(ChatError::NotConnected)?;
                    shared.transmit(&queued.payload).await.map(|_| ())
                }
            },
        );

        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(shared),
            shared.manager.subscribe_state(),
            shared.poll_interval,
        ));

        let mut tasks = shared.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(auto_sync);
        tasks.push(supervisor);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Reconcile after every reconnect and poll the fallback while real-time
/// delivery is disabled.
async fn supervise(
    shared: Weak<Shared>,
    mut state_rx: watch::Receiver<ConnectionState>,
    poll_interval: Duration,
) {
    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            ConnectionState::Connected => {
                let Some(strong) = shared.upgrade() else { return };
                strong.reconcile().await;
            }
            ConnectionState::Disabled => {
                info!("Real-time delivery disabled, polling REST fallback");
                loop {
                    {
                        let Some(strong) = shared.upgrade() else { return };
                        strong.poll_fallback().await;
                    }
                    tokio::select! {
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            break;
                        }
                        _ = time::sleep(poll_interval) => {}
                    }
                }
                continue;
            }
            _ => {}
        }

        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawchat_net::testing::{MockConnector, MockOutcome, RemoteEnd};
    use pawchat_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeApi {
        posted: Mutex<Vec<MessageDraft>>,
        reads: Mutex<Vec<MessageId>>,
        fetches: AtomicUsize,
        history: Mutex<Vec<ChatMessage>>,
        fail_posts: bool,
    }

    #[async_trait]
    impl FallbackApi for FakeApi {
        async fn send_message(&self, draft: &MessageDraft, temp_id: &MessageId) -> Result<ChatMessage> {
            if self.fail_posts {
                return Err(ChatError::Fallback("503".into()));
            }
            let mut posted = self.posted.lock().unwrap();
            posted.push(draft.clone());
            Ok(ChatMessage {
                id: MessageId::new(format!("rest-{}", posted.len())),
                conversation_id: draft.conversation_id.clone(),
                sender_id: UserId::new("owner"),
                body: draft.body.clone(),
                kind: draft.kind,
                created_at: Utc::now(),
                status: DeliveryStatus::Sent,
                edited: false,
                temp_id: Some(temp_id.clone()),
            })
        }

        async fn fetch_messages(&self, _conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.history.lock().unwrap().clone())
        }

        async fn mark_read(&self, message_id: &MessageId) -> Result<()> {
            self.reads.lock().unwrap().push(message_id.clone());
            Ok(())
        }

        async fn upload_attachment(
            &self,
            conversation_id: &ConversationId,
            attachment: Attachment,
        ) -> Result<ChatMessage> {
            Ok(ChatMessage {
                id: MessageId::new("att-1"),
                conversation_id: conversation_id.clone(),
                sender_id: UserId::new("owner"),
                body: attachment.file_name,
                kind: attachment.kind,
                created_at: Utc::now(),
                status: DeliveryStatus::Sent,
                edited: false,
                temp_id: None,
            })
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            token: "tok".into(),
            user_id: UserId::new("owner"),
            ..ClientConfig::default()
        }
    }

    fn client(connector: &MockConnector, api: Option<Arc<FakeApi>>) -> ChatClient {
        let api = api.map(|a| a as Arc<dyn FallbackApi>);
        ChatClient::new(
            config(),
            Arc::new(connector.clone()),
            Arc::new(MemoryStore::new()),
            api,
        )
        .unwrap()
    }

    fn conv() -> ConversationId {
        ConversationId::new("c-1")
    }

    fn from_vet(id: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(id),
            conversation_id: conv(),
            sender_id: UserId::new("vet"),
            body: "Bella's stitches look good".into(),
            kind: Default::default(),
            created_at: Utc::now(),
            status: DeliveryStatus::Sent,
            edited: false,
            temp_id: None,
        }
    }

    async fn settle() {
        time::sleep(Duration::from_millis(10)).await;
    }

    async fn open(client: &ChatClient, connector: &MockConnector) -> RemoteEnd {
        client.open_conversation(conv()).await.unwrap();
        settle().await;
        connector.take_remote().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_connected_goes_direct() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let mut remote = open(&client, &connector).await;

        let outcome = client
            .send_message(MessageDraft::text(conv(), "Walk at 5?"))
            .await
            .unwrap();
        let SendOutcome::Sent { temp_id } = outcome else {
            panic!("expected direct send");
        };

        assert_eq!(
            remote.sent_frames(),
            vec![ClientFrame::Message {
                body: "Walk at 5?".into(),
                kind: Default::default(),
                temp_id: temp_id.clone(),
            }]
        );
        assert_eq!(client.get_offline_status().queued_messages, 0);
        let snapshot = client.get_conversation(&conv());
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].status, DeliveryStatus::Pending);

        let echo = ChatMessage {
            id: MessageId::new("m-1"),
            sender_id: UserId::new("owner"),
            temp_id: Some(temp_id),
            ..from_vet("m-1")
        };
        remote.push(&ServerFrame::NewMessage { message: echo });
        settle().await;

        let snapshot = client.get_conversation(&conv());
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].id, MessageId::new("m-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_offline_is_queued_then_synced() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);

        let outcome = client
            .send_message(MessageDraft::text(conv(), "Feed Luna"))
            .await
            .unwrap();
        let SendOutcome::Queued { queue_id } = outcome else {
            panic!("expected queued send");
        };

        let pending = client.get_conversation(&conv());
        assert_eq!(pending.messages.len(), 1);
        assert_eq!(pending.messages[0].id, MessageId::new(queue_id.to_string()));
        assert_eq!(pending.messages[0].status, DeliveryStatus::Pending);
        let status = client.get_offline_status();
        assert!(!status.is_online);
        assert_eq!(status.queued_messages, 1);

        let mut remote = open(&client, &connector).await;
        let frames = remote.sent_frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ClientFrame::Message { body, .. } if body == "Feed Luna"));

        let status = client.get_offline_status();
        assert!(status.is_online);
        assert_eq!(status.queued_messages, 0);
        assert!(status.last_sync_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_message_is_acknowledged() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let mut remote = open(&client, &connector).await;

        let msg = from_vet("m-7");
        remote.push(&ServerFrame::NewMessage {
            message: msg.clone(),
        });
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            remote.sent_frames(),
            vec![ClientFrame::MessageDelivered {
                message_id: msg.id.clone()
            }]
        );

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            remote.sent_frames(),
            vec![ClientFrame::MessageRead {
                message_id: msg.id.clone()
            }]
        );
        assert_eq!(client.get_conversation(&conv()).messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_sends_one_receipt() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let mut remote = open(&client, &connector).await;

        let msg = from_vet("m-8");
        remote.push(&ServerFrame::NewMessage {
            message: msg.clone(),
        });
        settle().await;

        client.mark_read(&msg.id).await;
        client.mark_read(&msg.id).await;
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            remote.sent_frames(),
            vec![ClientFrame::MessageRead {
                message_id: msg.id.clone()
            }]
        );
        let snapshot = client.get_conversation(&conv());
        assert_eq!(snapshot.messages[0].status, DeliveryStatus::Read);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_status_updates_snapshot() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let remote = open(&client, &connector).await;

        let outcome = client
            .send_message(MessageDraft::text(conv(), "On my way"))
            .await
            .unwrap();
        let SendOutcome::Sent { temp_id } = outcome else {
            panic!("expected direct send");
        };
        remote.push(&ServerFrame::MessageStatus {
            message_id: temp_id.clone(),
            status: DeliveryStatus::Delivered,
        });
        settle().await;

        let snapshot = client.get_conversation(&conv());
        assert_eq!(snapshot.messages[0].status, DeliveryStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_connection_uses_fallback() {
        let connector = MockConnector::scripted([MockOutcome::Accept], MockOutcome::Fail);
        let api = Arc::new(FakeApi::default());
        let client = client(&connector, Some(api.clone()));
        let remote = open(&client, &connector).await;

        remote.close();
        time::sleep(Duration::from_secs(40)).await;
        assert_eq!(client.connection_status().state, ConnectionState::Disabled);
        assert!(api.fetches.load(Ordering::SeqCst) >= 1);

        let outcome = client
            .send_message(MessageDraft::text(conv(), "Vet at 3pm"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Posted {
                message_id: MessageId::new("rest-1")
            }
        );
        assert_eq!(client.get_offline_status().queued_messages, 0);
        assert_eq!(api.posted.lock().unwrap().len(), 1);

        let fetched = api.fetches.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(16)).await;
        assert!(api.fetches.load(Ordering::SeqCst) > fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_routes_to_queue() {
        let connector = MockConnector::scripted([MockOutcome::Accept], MockOutcome::Fail);
        let api = Arc::new(FakeApi {
            fail_posts: true,
            ..FakeApi::default()
        });
        let client = client(&connector, Some(api.clone()));
        let remote = open(&client, &connector).await;
        remote.close();
        time::sleep(Duration::from_secs(40)).await;

        let outcome = client
            .send_message(MessageDraft::text(conv(), "Vet at 3pm"))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Queued { .. }));
        assert_eq!(client.get_offline_status().queued_messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attachment_requires_fallback() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let attachment = Attachment {
            file_name: "xray.png".into(),
            mime_type: "image/png".into(),
            bytes: vec![1, 2, 3],
            kind: pawchat_shared::MessageKind::Image,
            caption: None,
        };

        let err = client
            .send_attachment(&conv(), attachment.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::FallbackUnavailable));

        let with_api = self::client(&connector, Some(Arc::new(FakeApi::default())));
        let message = with_api.send_attachment(&conv(), attachment).await.unwrap();
        assert_eq!(message.id, MessageId::new("att-1"));
        assert_eq!(with_api.get_conversation(&conv()).messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_conversation_stops_tracking() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let mut remote = open(&client, &connector).await;

        remote.push(&ServerFrame::NewMessage {
            message: from_vet("m-9"),
        });
        settle().await;
        assert_eq!(client.shared.tracker.tracked(), 1);
        client.close_conversation();
        time::sleep(Duration::from_secs(5)).await;

        assert!(remote.sent_frames().is_empty());
        assert!(remote.is_closed_by_client());
        assert_eq!(client.shared.tracker.tracked(), 0);
        assert!(client.get_conversation(&conv()).messages.is_empty());
        assert_eq!(client.connection_status().state, ConnectionState::Disconnected);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_conversation_cancels_old_timers() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let mut first = open(&client, &connector).await;

        first.push(&ServerFrame::NewMessage {
            message: from_vet("m-c1"),
        });
        settle().await;
        assert_eq!(client.shared.tracker.tracked(), 1);

        let other = ConversationId::new("c-2");
        client.open_conversation(other.clone()).await.unwrap();
        settle().await;
        let mut second = connector.take_remote().unwrap();
        time::sleep(Duration::from_secs(5)).await;

        assert!(second.sent_frames().is_empty());
        assert!(first.sent_frames().is_empty());
        assert_eq!(client.shared.tracker.tracked(), 0);
        // The old history stays cached for when the user comes back.
        assert_eq!(client.get_conversation(&conv()).messages.len(), 1);
        assert!(client.get_conversation(&other).messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_of_other_conversations_are_not_acknowledged() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let mut remote = open(&client, &connector).await;

        let stray = ChatMessage {
            conversation_id: ConversationId::new("c-9"),
            ..from_vet("m-stray")
        };
        remote.push(&ServerFrame::NewMessage { message: stray });
        time::sleep(Duration::from_secs(5)).await;

        assert!(remote.sent_frames().is_empty());
        assert_eq!(client.shared.tracker.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_message_cancels_acknowledgement() {
        let connector = MockConnector::accepting();
        let client = client(&connector, None);
        let mut remote = open(&client, &connector).await;

        remote.push(&ServerFrame::NewMessage {
            message: from_vet("m-4"),
        });
        settle().await;
        let snapshot = client.remove_message(&conv(), &MessageId::new("m-4"));
        time::sleep(Duration::from_secs(5)).await;

        assert!(snapshot.messages.is_empty());
        assert!(remote.sent_frames().is_empty());
        assert_eq!(client.shared.tracker.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_merges_history() {
        let connector = MockConnector::accepting();
        let api = Arc::new(FakeApi::default());
        api.history.lock().unwrap().push(from_vet("m-1"));
        let client = client(&connector, Some(api.clone()));

        let snapshot = client.refresh_conversation(&conv()).await.unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(client.get_conversation(&conv()).messages.len(), 1);
    }
}
