//! Durable FIFO of messages that could not be sent.
//!
//! The whole queue is persisted under a single storage key after every
//! mutation. A sync pass walks a snapshot taken when it starts; messages
//! enqueued meanwhile wait for the next pass.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pawchat_shared::constants::{MAX_QUEUE_RETRIES, OFFLINE_QUEUE_KEY};
use pawchat_shared::{ChatError, ConnectionState, MessageDraft, OfflineStatus, Result};
use pawchat_store::{KeyValueStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub payload: MessageDraft,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedMessage {
    fn new(payload: MessageDraft, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries,
        }
    }
}

/// Notice broadcast when a message is given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedMessage {
    pub message: QueuedMessage,
    pub last_error: String,
}

impl DroppedMessage {
    pub fn error(&self) -> ChatError {
        ChatError::MessageDropped {
            id: self.message.id.to_string(),
            attempts: self.message.retry_count,
        }
    }
}

/// Outcome of one [`OfflineQueue::sync`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another pass was already running; nothing was attempted.
    pub skipped: bool,
    pub sent: Vec<Uuid>,
    pub retained: Vec<Uuid>,
    pub dropped: Vec<Uuid>,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Source of online/offline transitions driving automatic sync.
#[async_trait]
pub trait ConnectivityPort: Send + 'static {
    /// Wait for the next transition. `None` once the source is gone.
    async fn next_change(&mut self) -> Option<bool>;
}

#[async_trait]
impl ConnectivityPort for watch::Receiver<bool> {
    async fn next_change(&mut self) -> Option<bool> {
        self.changed().await.ok()?;
        Some(*self.borrow_and_update())
    }
}

#[async_trait]
impl ConnectivityPort for watch::Receiver<ConnectionState> {
    async fn next_change(&mut self) -> Option<bool> {
        self.changed().await.ok()?;
        Some(self.borrow_and_update().is_connected())
    }
}

pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    max_retries: u32,
    entries: Mutex<Vec<QueuedMessage>>,
    syncing: AtomicBool,
    status_tx: watch::Sender<OfflineStatus>,
    notices: broadcast::Sender<DroppedMessage>,
}

/// Clears the in-progress flag however the pass ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn storage_error(e: StoreError) -> ChatError {
    ChatError::Storage(e.to_string())
}

impl OfflineQueue {
    /// Open the queue, restoring the snapshot persisted under the default key.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::load_with_key(store, OFFLINE_QUEUE_KEY)
    }

    pub fn load_with_key(store: Arc<dyn KeyValueStore>, key: &str) -> Result<Self> {
        let entries = match store.get(key).map_err(storage_error)? {
            None => Vec::new(),
            Some(raw) => match serde_json::from_str::<Vec<QueuedMessage>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(key, error = %e, "Discarding unreadable offline queue snapshot");
                    Vec::new()
                }
            },
        };
        if !entries.is_empty() {
            info!(count = entries.len(), "Restored offline queue");
        }

        let (status_tx, _) = watch::channel(OfflineStatus {
            is_online: false,
            queued_messages: entries.len(),
            last_sync_time: None,
        });
        let (notices, _) = broadcast::channel(32);

        Ok(Self {
            store,
            key: key.to_string(),
            max_retries: MAX_QUEUE_RETRIES,
            entries: Mutex::new(entries),
            syncing: AtomicBool::new(false),
            status_tx,
            notices,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &[QueuedMessage]) -> Result<()> {
        let raw = serde_json::to_string(entries)?;
        self.store.set(&self.key, &raw).map_err(storage_error)
    }

    fn publish_len(&self, len: usize) {
        self.status_tx.send_if_modified(|status| {
            let changed = status.queued_messages != len;
            status.queued_messages = len;
            changed
        });
    }

    /// Append `draft` and persist. On a storage failure the append is rolled
    /// back and the error returned.
    pub fn enqueue(&self, draft: MessageDraft) -> Result<QueuedMessage> {
        let entry = QueuedMessage::new(draft, self.max_retries);
        let len = {
            let mut entries = self.lock();
            entries.push(entry.clone());
            if let Err(e) = self.persist(&entries) {
                entries.pop();
                warn!(error = %e, "Failed to persist offline queue; message not queued");
                return Err(e);
            }
            entries.len()
        };
        self.publish_len(len);
        info!(
            id = %entry.id,
            conversation = %entry.payload.conversation_id,
            queued = len,
            "Message queued for later delivery"
        );
        Ok(entry)
    }

    /// Remove `id`. Returns `Ok(false)` if it is not queued.
    pub fn dequeue(&self, id: Uuid) -> Result<bool> {
        let len = {
            let mut entries = self.lock();
            let Some(index) = entries.iter().position(|m| m.id == id) else {
                return Ok(false);
            };
            let removed = entries.remove(index);
            if let Err(e) = self.persist(&entries) {
                entries.insert(index, removed);
                return Err(e);
            }
            entries.len()
        };
        self.publish_len(len);
        Ok(true)
    }

    /// Queued messages in FIFO order.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> OfflineStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OfflineStatus> {
        self.status_tx.subscribe()
    }

    /// Drop notices for messages that exhausted their retries.
    pub fn notices(&self) -> broadcast::Receiver<DroppedMessage> {
        self.notices.subscribe()
    }

    pub fn set_online(&self, online: bool) {
        self.status_tx.send_if_modified(|status| {
            let changed = status.is_online != online;
            status.is_online = online;
            changed
        });
    }

    /// Apply `update` to the entry `id`, if still queued, and persist.
    fn update_entry(&self, id: Uuid, update: impl FnOnce(&mut Vec<QueuedMessage>, usize)) {
        let len = {
            let mut entries = self.lock();
            let Some(index) = entries.iter().position(|m| m.id == id) else {
                return;
            };
            update(&mut *entries, index);
            if let Err(e) = self.persist(&entries) {
                warn!(id = %id, error = %e, "Failed to persist offline queue after sync step");
            }
            entries.len()
        };
        self.publish_len(len);
    }

    /// Try to send every queued message once, oldest first.
    ///
    /// `send` gets each message by value. Success removes it; failure bumps
    /// its retry count and drops it once `max_retries` attempts have failed.
    /// A call made while another pass runs returns a skipped report.
    pub async fn sync<F, Fut>(&self, mut send: F) -> SyncReport
    where
        F: FnMut(QueuedMessage) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Offline queue sync already running");
            return SyncReport::skipped();
        }
        let _guard = SyncGuard(&self.syncing);

        let pending = self.snapshot();
        let mut report = SyncReport::default();
        if !pending.is_empty() {
            info!(count = pending.len(), "Syncing offline queue");
        }

        for message in pending {
            let id = message.id;
            match send(message.clone()).await {
                Ok(()) => {
                    self.update_entry(id, |entries, index| {
                        entries.remove(index);
                    });
                    report.sent.push(id);
                }
                Err(e) => {
                    let attempts = message.retry_count + 1;
                    if attempts >= message.max_retries {
                        self.update_entry(id, |entries, index| {
                            entries.remove(index);
                        });
                        let dropped = DroppedMessage {
                            message: QueuedMessage {
                                retry_count: attempts,
                                ..message
                            },
                            last_error: e.to_string(),
                        };
                        warn!(id = %id, error = %dropped.error(), "Dropping queued message");
                        // No receivers is fine; the report still carries it.
                        let _ = self.notices.send(dropped);
                        report.dropped.push(id);
                    } else {
                        self.update_entry(id, |entries, index| {
                            entries[index].retry_count = attempts;
                        });
                        debug!(id = %id, attempts, error = %e, "Queued message send failed");
                        report.retained.push(id);
                    }
                }
            }
        }

        self.status_tx.send_modify(|status| {
            status.last_sync_time = Some(Utc::now());
        });
        info!(
            sent = report.sent.len(),
            retained = report.retained.len(),
            dropped = report.dropped.len(),
            "Offline queue sync finished"
        );
        report
    }

    /// Sync automatically whenever `port` reports connectivity restored.
    pub fn spawn_auto_sync<P, F, Fut>(self: &Arc<Self>, mut port: P, mut send: F) -> JoinHandle<()>
    where
        P: ConnectivityPort,
        F: FnMut(QueuedMessage) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut online = false;
            while let Some(now_online) = port.next_change().await {
                let Some(queue) = queue.upgrade() else { break };
                queue.set_online(now_online);
                if now_online && !online {
                    info!("Connectivity restored");
                    queue.sync(&mut send).await;
                }
                online = now_online;
            }
            debug!("Offline queue auto sync stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawchat_shared::ConversationId;
    use pawchat_store::MemoryStore;
    use std::time::Duration;

    fn draft(body: &str) -> MessageDraft {
        MessageDraft::text(ConversationId::new("c-1"), body)
    }

    fn new_queue() -> (Arc<MemoryStore>, Arc<OfflineQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::load(store.clone()).unwrap();
        (store, Arc::new(queue))
    }

    fn bodies(queue: &OfflineQueue) -> Vec<String> {
        queue.snapshot().into_iter().map(|m| m.payload.body).collect()
    }

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> pawchat_store::Result<Option<String>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> pawchat_store::Result<()> {
            Err(StoreError::Poisoned)
        }
        fn remove(&self, _key: &str) -> pawchat_store::Result<()> {
            Err(StoreError::Poisoned)
        }
    }

    #[tokio::test]
    async fn test_sync_sends_in_fifo_order() {
        let (_, queue) = new_queue();
        for body in ["A", "B", "C"] {
            queue.enqueue(draft(body)).unwrap();
        }

        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let report = queue
            .sync(move |m| {
                log.lock().unwrap().push(m.payload.body);
                async { Ok(()) }
            })
            .await;

        assert_eq!(*sent.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(report.sent.len(), 3);
        assert!(queue.is_empty());
        let status = queue.status();
        assert_eq!(status.queued_messages, 0);
        assert!(status.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn test_always_failing_message_dropped_after_three_passes() {
        let (_, queue) = new_queue();
        let queued = queue.enqueue(draft("A")).unwrap();
        let mut notices = queue.notices();
        let fail = |_: QueuedMessage| async { Err::<(), _>(ChatError::NotConnected) };

        let first = queue.sync(fail).await;
        assert_eq!(first.retained, vec![queued.id]);
        assert_eq!(queue.snapshot()[0].retry_count, 1);

        queue.sync(fail).await;
        assert_eq!(queue.snapshot()[0].retry_count, 2);

        let third = queue.sync(fail).await;
        assert_eq!(third.dropped, vec![queued.id]);
        assert!(queue.is_empty());

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.message.id, queued.id);
        assert!(matches!(
            notice.error(),
            ChatError::MessageDropped { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_messages_keep_their_order() {
        let (_, queue) = new_queue();
        for body in ["A", "B", "C", "D"] {
            queue.enqueue(draft(body)).unwrap();
        }

        queue
            .sync(|m| async move {
                if m.payload.body == "B" || m.payload.body == "D" {
                    Err(ChatError::Transport("flaky".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        queue.enqueue(draft("E")).unwrap();

        assert_eq!(bodies(&queue), vec!["B", "D", "E"]);
    }

    #[tokio::test]
    async fn test_dequeue_is_idempotent() {
        let (_, queue) = new_queue();
        let a = queue.enqueue(draft("A")).unwrap();
        queue.enqueue(draft("B")).unwrap();

        assert!(queue.dequeue(a.id).unwrap());
        assert!(!queue.dequeue(a.id).unwrap());
        assert!(!queue.dequeue(Uuid::new_v4()).unwrap());
        assert_eq!(bodies(&queue), vec!["B"]);
        assert_eq!(queue.status().queued_messages, 1);
    }

    #[tokio::test]
    async fn test_enqueue_during_sync_waits_for_next_pass() {
        let (_, queue) = new_queue();
        queue.enqueue(draft("A")).unwrap();

        let q = queue.clone();
        let report = queue
            .sync(move |_| {
                q.enqueue(draft("late")).unwrap();
                async { Ok(()) }
            })
            .await;

        assert_eq!(report.sent.len(), 1);
        assert_eq!(bodies(&queue), vec!["late"]);
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_skipped() {
        let (_, queue) = new_queue();
        queue.enqueue(draft("A")).unwrap();

        let q = queue.clone();
        let report = queue
            .sync(move |_| {
                let q = q.clone();
                async move {
                    let nested = q.sync(|_| async { Ok(()) }).await;
                    assert!(nested.skipped);
                    Ok(())
                }
            })
            .await;

        assert!(!report.skipped);
        assert!(!queue.is_syncing());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_reload() {
        let (store, queue) = new_queue();
        let a = queue.enqueue(draft("A")).unwrap();
        let b = queue.enqueue(draft("B")).unwrap();
        drop(queue);

        let reloaded = OfflineQueue::load(store).unwrap();
        let ids: Vec<Uuid> = reloaded.snapshot().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(reloaded.status().queued_messages, 2);
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(OFFLINE_QUEUE_KEY, "{not a queue").unwrap();

        let queue = OfflineQueue::load(store).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_rolls_back_when_persist_fails() {
        let queue = OfflineQueue::load(Arc::new(BrokenStore)).unwrap();

        let err = queue.enqueue(draft("A")).unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_on_connectivity_restored() {
        let (_, queue) = new_queue();
        queue.enqueue(draft("A")).unwrap();
        let (online_tx, online_rx) = watch::channel(false);

        let sent = Arc::new(Mutex::new(0usize));
        let counter = sent.clone();
        let task = queue.spawn_auto_sync(online_rx, move |_| {
            *counter.lock().unwrap() += 1;
            async { Ok(()) }
        });

        online_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*sent.lock().unwrap(), 1);
        assert!(queue.is_empty());
        assert!(queue.status().is_online);

        online_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queue.status().is_online);
        task.abort();
    }
}
