//! Per-message delivery/read acknowledgement timers for inbound messages.
//!
//! Every tracked message has at most one pending timer. Each timer carries
//! the sequence number it was scheduled with; a timer that wakes up after
//! being superseded finds a different number in the entry and does nothing.
//!
//! An entry is freed once its read acknowledgement has gone out. Its id then
//! moves to a bounded set of settled ids so repeated observations and
//! `mark_read` calls stay no-ops.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use pawchat_shared::constants::{DELIVERY_ACK_DELAY, READ_ACK_DELAY};
use pawchat_shared::{ChatMessage, DeliveryStatus, MessageId, Result, UserId};

/// Settled ids remembered before the oldest is forgotten.
const SETTLED_CAPACITY: usize = 1024;

/// Where acknowledgements go (real-time link or REST).
#[async_trait]
pub trait AckSink: Send + Sync + 'static {
    async fn ack_delivered(&self, id: &MessageId) -> Result<()>;
    async fn ack_read(&self, id: &MessageId) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// From first observation to the delivery acknowledgement.
    pub delivery_delay: Duration,
    /// From `delivered` to the read acknowledgement.
    pub read_delay: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            delivery_delay: DELIVERY_ACK_DELAY,
            read_delay: READ_ACK_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Deliver,
    Read,
}

struct Entry {
    status: DeliveryStatus,
    timer: Option<JoinHandle<()>>,
    seq: u64,
}

impl Entry {
    fn new(status: DeliveryStatus) -> Self {
        Self {
            status,
            timer: None,
            seq: 0,
        }
    }

    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<MessageId, Entry>,
    settled: HashSet<MessageId>,
    settled_order: VecDeque<MessageId>,
    next_seq: u64,
    closed: bool,
}

impl State {
    /// Free the entry of `id` and remember it as read.
    fn settle(&mut self, id: &MessageId) {
        if let Some(mut entry) = self.entries.remove(id) {
            entry.cancel();
        }
        if !self.settled.insert(id.clone()) {
            return;
        }
        self.settled_order.push_back(id.clone());
        if self.settled_order.len() > SETTLED_CAPACITY {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }

    /// Read locally, whether or not the acknowledgement has gone out yet.
    fn is_read(&self, id: &MessageId) -> bool {
        self.settled.contains(id)
            || self
                .entries
                .get(id)
                .is_some_and(|e| e.status == DeliveryStatus::Read)
    }
}

struct Inner {
    config: TrackerConfig,
    sink: Arc<dyn AckSink>,
    local_user: UserId,
    state: Mutex<State>,
}

/// Tracks inbound messages from other participants. Dropping the tracker
/// tears it down.
pub struct StatusTracker {
    inner: Arc<Inner>,
}

impl StatusTracker {
    pub fn new(local_user: UserId, sink: Arc<dyn AckSink>, config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                local_user,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Start tracking an inbound message. Messages authored by the local
    /// user, ids already tracked or settled, and observations after teardown
    /// are ignored.
    pub fn observe(&self, message: &ChatMessage) {
        if message.sender_id == self.inner.local_user {
            return;
        }

        let mut state = self.inner.lock();
        if state.closed
            || state.entries.contains_key(&message.id)
            || state.settled.contains(&message.id)
        {
            return;
        }

        let status = message.status.advance(DeliveryStatus::Sent);
        if status == DeliveryStatus::Read {
            state.settle(&message.id);
            return;
        }
        state
            .entries
            .insert(message.id.clone(), Entry::new(status));
        match status {
            DeliveryStatus::Delivered => self.inner.schedule(&mut state, &message.id, Step::Read),
            _ => self.inner.schedule(&mut state, &message.id, Step::Deliver),
        }
        debug!(id = %message.id, ?status, "Tracking message");
    }

    /// Apply a status reported by the server. Never moves a message
    /// backwards. Returns the resulting status, `None` if untracked.
    pub fn confirm(&self, id: &MessageId, status: DeliveryStatus) -> Option<DeliveryStatus> {
        let mut state = self.inner.lock();
        if state.closed {
            return None;
        }
        let entry = state.entries.get_mut(id)?;
        let next = entry.status.advance(status);
        if next == entry.status {
            return Some(next);
        }
        entry.status = next;
        match next {
            DeliveryStatus::Delivered => self.inner.schedule(&mut state, id, Step::Read),
            // Read elsewhere; nothing left to acknowledge.
            DeliveryStatus::Read => state.settle(id),
            _ => {}
        }
        Some(next)
    }

    /// Mark `id` read now, whatever its state. Pending timers are cancelled
    /// and the read acknowledgement goes out once; later calls are no-ops.
    pub async fn mark_read(&self, id: &MessageId) {
        {
            let mut state = self.inner.lock();
            if state.closed || state.is_read(id) {
                return;
            }
            state.settle(id);
        }

        if let Err(e) = self.inner.sink.ack_read(id).await {
            warn!(id = %id, error = %e, "Read acknowledgement failed");
        }
    }

    /// Stop tracking `id` and cancel its timer.
    pub fn remove(&self, id: &MessageId) -> bool {
        let mut state = self.inner.lock();
        match state.entries.remove(id) {
            Some(mut entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer and refuse further observations.
    pub fn teardown(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, mut entry) in state.entries.drain() {
            entry.cancel();
        }
        state.settled.clear();
        state.settled_order.clear();
        debug!("Status tracker torn down");
    }

    /// Local status of `id`; settled ids report `Read`.
    pub fn status(&self, id: &MessageId) -> Option<DeliveryStatus> {
        let state = self.inner.lock();
        match state.entries.get(id) {
            Some(entry) => Some(entry.status),
            None if state.settled.contains(id) => Some(DeliveryStatus::Read),
            None => None,
        }
    }

    /// Messages still waiting on an acknowledgement.
    pub fn tracked(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl Drop for StatusTracker {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the timer of `id` with one for `step`.
    fn schedule(self: &Arc<Self>, state: &mut State, id: &MessageId, step: Step) {
        state.next_seq += 1;
        let seq = state.next_seq;
        let Some(entry) = state.entries.get_mut(id) else {
            return;
        };
        entry.cancel();
        entry.seq = seq;
        let delay = match step {
            Step::Deliver => self.config.delivery_delay,
            Step::Read => self.config.read_delay,
        };
        entry.timer = Some(tokio::spawn(fire(
            Arc::downgrade(self),
            id.clone(),
            seq,
            step,
            delay,
        )));
    }

    /// Claim the timer `seq` for `id` and advance the status. Returns
    /// `false` if the timer was superseded.
    fn claim(&self, id: &MessageId, seq: u64, step: Step) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        if entry.seq != seq {
            return false;
        }
        // Detach our own handle so the next schedule does not abort us.
        entry.timer.take();
        let target = match step {
            Step::Deliver => DeliveryStatus::Delivered,
            Step::Read => DeliveryStatus::Read,
        };
        if entry.status >= target {
            return false;
        }
        entry.status = target;
        true
    }
}

async fn fire(inner: Weak<Inner>, id: MessageId, seq: u64, step: Step, delay: Duration) {
    time::sleep(delay).await;

    let Some(inner) = inner.upgrade() else { return };
    if !inner.claim(&id, seq, step) {
        return;
    }

    let result = match step {
        Step::Deliver => inner.sink.ack_delivered(&id).await,
        Step::Read => inner.sink.ack_read(&id).await,
    };
    match result {
        Ok(()) => debug!(id = %id, ?step, "Acknowledged"),
        // Local status stays advanced.
        Err(e) => warn!(id = %id, ?step, error = %e, "Acknowledgement failed"),
    }

    let mut state = inner.lock();
    if state.closed {
        return;
    }
    match step {
        Step::Deliver => {
            let still_delivered = state
                .entries
                .get(&id)
                .is_some_and(|e| e.status == DeliveryStatus::Delivered);
            if still_delivered {
                inner.schedule(&mut state, &id, Step::Read);
            }
        }
        Step::Read => state.settle(&id),
    }
}
