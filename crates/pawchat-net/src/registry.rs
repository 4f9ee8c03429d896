//! Typed publish/subscribe for inbound frames and connection transitions.
//!
//! Listeners are shared closures; identity is `Arc` pointer identity, which
//! makes subscribe and unsubscribe idempotent. Dispatch walks a snapshot of
//! the list so listeners may (un)subscribe from inside a callback.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use pawchat_shared::{FrameKind, ServerFrame};

/// A callback registered for events of type `T`.
pub type Listener<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Listener`]. Keep the returned handle to unsubscribe.
pub fn listener<T, F>(f: F) -> Listener<T>
where
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered list of listeners for one event type.
pub struct ListenerSet<T> {
    name: &'static str,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> ListenerSet<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Append `listener`. Returns `false` if it was already subscribed.
    pub fn add(&self, listener: Listener<T>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove `listener`. Returns `false` if it was not subscribed.
    pub fn remove(&self, listener: &Listener<T>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener in subscription order. Returns how many
    /// listeners failed (error or panic); failures never stop the walk.
    pub fn notify(&self, event: &T) -> usize {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = 0;
        for (index, listener) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(event = self.name, index, error = %e, "Listener failed");
                }
                Err(panic) => {
                    failures += 1;
                    warn!(
                        event = self.name,
                        index,
                        panic = panic_message(panic.as_ref()),
                        "Listener panicked"
                    );
                }
            }
        }
        failures
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

/// Routes decoded [`ServerFrame`]s to the listeners of their [`FrameKind`].
pub struct HandlerRegistry {
    handlers: HashMap<FrameKind, ListenerSet<ServerFrame>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let handlers = FrameKind::ALL
            .iter()
            .map(|kind| (*kind, ListenerSet::new(kind_name(*kind))))
            .collect();
        Self { handlers }
    }

    fn set(&self, kind: FrameKind) -> &ListenerSet<ServerFrame> {
        // Every kind is inserted in `new`.
        &self.handlers[&kind]
    }

    pub fn subscribe(&self, kind: FrameKind, listener: Listener<ServerFrame>) -> bool {
        self.set(kind).add(listener)
    }

    pub fn unsubscribe(&self, kind: FrameKind, listener: &Listener<ServerFrame>) -> bool {
        self.set(kind).remove(listener)
    }

    pub fn listener_count(&self, kind: FrameKind) -> usize {
        self.set(kind).len()
    }

    /// Deliver `frame` to the listeners registered for its kind.
    pub fn dispatch(&self, frame: &ServerFrame) -> usize {
        self.set(frame.kind()).notify(frame)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_name(kind: FrameKind) -> &'static str {
    match kind {
        FrameKind::NewMessage => "new_message",
        FrameKind::Typing => "typing",
        FrameKind::MessageStatus => "message_status",
        FrameKind::ConnectionEstablished => "connection_established",
        FrameKind::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawchat_shared::{DeliveryStatus, MessageId, UserId};

    fn typing_frame() -> ServerFrame {
        ServerFrame::Typing {
            user_id: UserId::new("owner"),
            is_typing: true,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Listener<ServerFrame> {
        let log = log.clone();
        listener(move |_| {
            log.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.subscribe(FrameKind::Typing, recorder(&log, "first"));
        registry.subscribe(FrameKind::Typing, recorder(&log, "second"));
        registry.subscribe(FrameKind::Error, recorder(&log, "other-kind"));

        registry.dispatch(&typing_frame());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_subscribe_and_unsubscribe_are_idempotent() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = recorder(&log, "only");

        assert!(registry.subscribe(FrameKind::Typing, l.clone()));
        assert!(!registry.subscribe(FrameKind::Typing, l.clone()));
        assert_eq!(registry.listener_count(FrameKind::Typing), 1);

        registry.dispatch(&typing_frame());
        assert_eq!(log.lock().unwrap().len(), 1);

        assert!(registry.unsubscribe(FrameKind::Typing, &l));
        assert!(!registry.unsubscribe(FrameKind::Typing, &l));
        assert!(!registry.unsubscribe(FrameKind::NewMessage, &l));

        registry.dispatch(&typing_frame());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.subscribe(
            FrameKind::MessageStatus,
            listener(|_| Err(anyhow::anyhow!("boom"))),
        );
        registry.subscribe(
            FrameKind::MessageStatus,
            listener(|_| panic!("listener bug")),
        );
        registry.subscribe(FrameKind::MessageStatus, recorder(&log, "survivor"));

        let failures = registry.dispatch(&ServerFrame::MessageStatus {
            message_id: MessageId::new("m-1"),
            status: DeliveryStatus::Read,
        });

        assert_eq!(failures, 2);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself_during_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        let slot: Arc<Mutex<Option<Listener<ServerFrame>>>> = Arc::new(Mutex::new(None));

        let reg = registry.clone();
        let me = slot.clone();
        let once = listener(move |_| {
            if let Some(l) = me.lock().unwrap().take() {
                reg.unsubscribe(FrameKind::Typing, &l);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(once.clone());
        registry.subscribe(FrameKind::Typing, once);

        registry.dispatch(&typing_frame());
        assert_eq!(registry.listener_count(FrameKind::Typing), 0);
    }
}
