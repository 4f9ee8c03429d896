//! Conversation snapshots.
//!
//! A snapshot is immutable; every change produces a new one through
//! [`reduce`], and readers hold an `Arc` to whichever version they got.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pawchat_shared::{ChatMessage, ConversationId, DeliveryStatus, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    /// Oldest first.
    pub messages: Vec<ChatMessage>,
}

impl ConversationSnapshot {
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| &m.id == id)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// Optimistic copy of an outbound message, keyed by its temporary id.
    LocalSent(ChatMessage),
    /// A message pushed by the server. Replaces the optimistic copy named by
    /// its `temp_id`, if any.
    Incoming(ChatMessage),
    StatusChanged {
        id: MessageId,
        status: DeliveryStatus,
    },
    Removed(MessageId),
    /// Authoritative history fetched over REST.
    Fetched(Vec<ChatMessage>),
}

/// Fold an incoming copy into `existing`. Status only moves forward.
fn merge_into(existing: &mut ChatMessage, incoming: ChatMessage) {
    let status = existing.status.advance(incoming.status);
    *existing = ChatMessage {
        status,
        temp_id: incoming.temp_id.or_else(|| existing.temp_id.take()),
        ..incoming
    };
}

fn upsert(messages: &mut Vec<ChatMessage>, incoming: ChatMessage) {
    let by_temp = incoming
        .temp_id
        .as_ref()
        .and_then(|temp| messages.iter().position(|m| &m.id == temp));
    let by_id = || messages.iter().position(|m| m.id == incoming.id);

    match by_temp.or_else(by_id) {
        Some(index) => {
            merge_into(&mut messages[index], incoming);
            // An echo may arrive after the canonical copy was already
            // fetched; keep one entry per canonical id.
            let id = messages[index].id.clone();
            let mut seen = false;
            messages.retain(|m| {
                if m.id != id {
                    return true;
                }
                let keep = !seen;
                seen = true;
                keep
            });
        }
        None => messages.push(incoming),
    }
}

/// Apply `event` to `snapshot`, producing the next snapshot.
pub fn reduce(snapshot: &ConversationSnapshot, event: ConversationEvent) -> ConversationSnapshot {
    let mut next = snapshot.clone();
    match event {
        ConversationEvent::LocalSent(message) => {
            // The echo may already be here if it raced the local insert.
            let known = next
                .messages
                .iter()
                .any(|m| m.id == message.id || m.temp_id.as_ref() == Some(&message.id));
            if !known {
                next.messages.push(message);
            }
        }
        ConversationEvent::Incoming(message) => upsert(&mut next.messages, message),
        ConversationEvent::StatusChanged { id, status } => {
            if let Some(index) = next.position(&id) {
                let message = &mut next.messages[index];
                message.status = message.status.advance(status);
            }
        }
        ConversationEvent::Removed(id) => next.messages.retain(|m| m.id != id),
        ConversationEvent::Fetched(messages) => {
            for message in messages {
                upsert(&mut next.messages, message);
            }
            next.messages.sort_by_key(|m| m.created_at);
        }
    }
    next
}

/// Latest snapshot per conversation.
#[derive(Default)]
pub struct ConversationStore {
    snapshots: Mutex<HashMap<ConversationId, Arc<ConversationSnapshot>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, Arc<ConversationSnapshot>>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current snapshot, empty if nothing is known yet.
    pub fn get(&self, id: &ConversationId) -> Arc<ConversationSnapshot> {
        self.lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Arc::new(ConversationSnapshot::empty(id.clone())))
    }

    pub fn apply(&self, id: &ConversationId, event: ConversationEvent) -> Arc<ConversationSnapshot> {
        let mut snapshots = self.lock();
        let current = snapshots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ConversationSnapshot::empty(id.clone())));
        let next = Arc::new(reduce(current, event));
        *current = next.clone();
        next
    }

    /// Find the conversation holding `message`.
    pub fn locate(&self, message: &MessageId) -> Option<ConversationId> {
        self.lock()
            .iter()
            .find(|(_, snapshot)| snapshot.get(message).is_some())
            .map(|(id, _)| id.clone())
    }

    pub fn forget(&self, id: &ConversationId) -> bool {
        self.lock().remove(id).is_some()
    }
}
