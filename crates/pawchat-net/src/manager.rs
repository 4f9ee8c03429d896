//! Connection manager.
//!
//! Owns the single real-time link for one conversation and drives it through
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> Disabled`.
//!
//! Background work is split in two tasks:
//! - the **driver**, one per live link, reads inbound frames and sends the
//!   heartbeat;
//! - the **reconnector**, spawned on an unexpected close, walks the backoff
//!   schedule until a link is re-established or the budget is spent.
//!
//! Both tasks hold a `Weak` reference and the session generation they were
//! spawned for. `connect` and `disconnect` bump the generation, so a task that
//! already passed an await point cannot touch the new session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use pawchat_shared::constants::{
    CONNECT_TIMEOUT, HEARTBEAT_INTERVAL, MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY,
};
use pawchat_shared::{
    ChatError, ClientFrame, ConnectionState, ConnectionStatus, ConversationId, FrameKind, Result,
    ServerFrame,
};

use crate::registry::{HandlerRegistry, Listener, ListenerSet};
use crate::transport::{chat_endpoint, Connector, Link, LinkEvent};

/// Connection settings. Timing fields default to the values in
/// [`pawchat_shared::constants`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `host[:port]` of the chat server.
    pub host: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            secure,
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8000".into(),
            secure: false,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

#[derive(Debug, Clone)]
struct Target {
    conversation_id: ConversationId,
    url: Url,
}

#[derive(Default)]
struct Session {
    target: Option<Target>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    driver: Option<JoinHandle<()>>,
    reconnector: Option<JoinHandle<()>>,
    attempt: u32,
    generation: u64,
}

impl Session {
    fn stop_tasks(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(reconnector) = self.reconnector.take() {
            reconnector.abort();
        }
        // Dropping the sender closes the link without a `Closed` event.
        self.outbound = None;
    }
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<HandlerRegistry>,
    listeners: ListenerSet<ConnectionStatus>,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

/// Cloneable handle to the connection of one client.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry: Arc::new(HandlerRegistry::new()),
                listeners: ListenerSet::new("connection_change"),
                state_tx,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Open the link for `conversation_id`.
    ///
    /// A different conversation tears down the current one first. If the
    /// first attempt fails, the error is returned and the backoff schedule
    /// takes over in the background.
    pub async fn connect(&self, conversation_id: ConversationId, token: &str) -> Result<()> {
        let config = &self.inner.config;
        let url = chat_endpoint(&config.host, config.secure, &conversation_id, token)?;

        let (generation, status) = {
            let mut session = self.inner.lock();
            let state = self.state();
            let same_target = session
                .target
                .as_ref()
                .is_some_and(|t| t.conversation_id == conversation_id);
            if same_target
                && matches!(
                    state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Reconnecting
                )
            {
                return Err(ChatError::AlreadyConnected);
            }

            if let Some(previous) = &session.target {
                info!(
                    from = %previous.conversation_id,
                    to = %conversation_id,
                    "Switching conversation"
                );
            }
            session.stop_tasks();
            session.generation += 1;
            session.attempt = 0;
            session.target = Some(Target {
                conversation_id: conversation_id.clone(),
                url: url.clone(),
            });
            (session.generation, self.inner.publish(ConnectionState::Connecting))
        };
        self.inner.announce(status);

        match self.inner.open_link(&url).await {
            Ok(link) => {
                self.inner.install(generation, link);
                Ok(())
            }
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Connection attempt failed");
                self.inner.begin_reconnect(generation);
                Err(e)
            }
        }
    }

    /// Close the link on request. Stops the driver and any pending reconnect;
    /// no reconnection follows.
    pub fn disconnect(&self) {
        let status = {
            let mut session = self.inner.lock();
            session.stop_tasks();
            session.generation += 1;
            session.attempt = 0;
            session.target = None;
            self.inner.publish(ConnectionState::Disconnected)
        };
        if status.is_some() {
            info!("Disconnected");
        }
        self.inner.announce(status);
    }

    /// Transmit `frame`. Fails with [`ChatError::NotConnected`] unless the
    /// link is up.
    pub fn send(&self, frame: &ClientFrame) -> Result<()> {
        self.inner.transmit(frame)
    }

    /// Best-effort typing notification; dropped when not connected.
    pub fn send_typing_indicator(&self, is_typing: bool) {
        if let Err(e) = self.inner.transmit(&ClientFrame::Typing { is_typing }) {
            debug!(error = %e, "Typing indicator dropped");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().into()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch channel carrying every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn on_connection_change(&self, listener: Listener<ConnectionStatus>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn off_connection_change(&self, listener: &Listener<ConnectionStatus>) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn on_message(&self, kind: FrameKind, listener: Listener<ServerFrame>) -> bool {
        self.inner.registry.subscribe(kind, listener)
    }

    pub fn off_message(&self, kind: FrameKind, listener: &Listener<ServerFrame>) -> bool {
        self.inner.registry.unsubscribe(kind, listener)
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Failed reconnect attempts in the current backoff run.
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    /// Conversation currently targeted, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.inner
            .lock()
            .target
            .as_ref()
            .map(|t| t.conversation_id.clone())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a transition. Call with the session lock held so transitions
    /// are serialized; hand the result to [`Inner::announce`] after
    /// releasing it.
    fn publish(&self, next: ConnectionState) -> Option<ConnectionStatus> {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        changed.then(|| ConnectionStatus::from(next))
    }

    fn announce(&self, status: Option<ConnectionStatus>) {
        if let Some(status) = status {
            debug!(state = ?status.state, "Connection state changed");
            self.listeners.notify(&status);
        }
    }

    async fn open_link(&self, url: &Url) -> Result<Link> {
        match time::timeout(self.config.connect_timeout, self.connector.open(url)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::ConnectionTimeout),
        }
    }

    /// Adopt a freshly opened link. Returns `false` if the session moved on
    /// while the link was being opened; the link is dropped then.
    fn install(self: &Arc<Self>, generation: u64, link: Link) -> bool {
        let Link { outbound, inbound } = link;
        let status = {
            let mut session = self.lock();
            if session.generation != generation {
                debug!("Discarding link opened for a stale session");
                return false;
            }
            session.outbound = Some(outbound);
            session.attempt = 0;
            // Detach, not abort: the reconnector may be the caller.
            session.reconnector.take();
            session.driver = Some(tokio::spawn(drive(
                Arc::downgrade(self),
                generation,
                inbound,
                self.config.heartbeat_interval,
            )));
            if let Some(target) = &session.target {
                info!(conversation = %target.conversation_id, "Connected");
            }
            self.publish(ConnectionState::Connected)
        };
        self.announce(status);
        true
    }

    fn transmit(&self, frame: &ClientFrame) -> Result<()> {
        let text = frame.to_json()?;
        let session = self.lock();
        if !self.state_tx.borrow().is_connected() {
            return Err(ChatError::NotConnected);
        }
        let outbound = session.outbound.as_ref().ok_or(ChatError::NotConnected)?;
        outbound.send(text).map_err(|_| ChatError::NotConnected)
    }

    fn handle_frame(&self, text: &str) {
        let frame = match ServerFrame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = text.len(), "Discarding inbound frame");
                return;
            }
        };

        if let ServerFrame::Error { message } = &frame {
            warn!(message = %message, "Server reported an error");
        }

        let failures = self.registry.dispatch(&frame);
        if failures > 0 {
            debug!(kind = ?frame.kind(), failures, "Some frame listeners failed");
        }
    }

    fn on_unexpected_close(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        {
            let mut session = self.lock();
            if session.generation != generation {
                return;
            }
            session.outbound = None;
            // The driver is the caller; let it finish on its own.
            session.driver.take();
        }
        warn!(
            reason = reason.as_deref().unwrap_or("none"),
            "Connection lost unexpectedly"
        );
        self.begin_reconnect(generation);
    }

    fn begin_reconnect(self: &Arc<Self>, generation: u64) {
        let status = {
            let mut session = self.lock();
            if session.generation != generation || session.target.is_none() {
                return;
            }
            if let Some(previous) = session.reconnector.take() {
                previous.abort();
            }
            session.reconnector = Some(tokio::spawn(reconnect(Arc::downgrade(self), generation)));
            self.publish(ConnectionState::Reconnecting)
        };
        self.announce(status);
    }

    fn give_up(&self, generation: u64) {
        let status = {
            let mut session = self.lock();
            if session.generation != generation {
                return;
            }
            session.target = None;
            session.reconnector.take();
            self.publish(ConnectionState::Disabled)
        };
        warn!(
            attempts = self.config.max_reconnect_attempts,
            error = %ChatError::MaxReconnectExceeded,
            "Real-time connection disabled"
        );
        self.announce(status);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .stop_tasks();
    }
}

async fn drive(
    inner: Weak<Inner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    heartbeat: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(LinkEvent::Frame(text)) => {
                    let Some(inner) = inner.upgrade() else { return };
                    inner.handle_frame(&text);
                }
                Some(LinkEvent::Closed { reason }) => break reason,
                None => break None,
            },
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { return };
                match inner.transmit(&ClientFrame::Ping) {
                    Ok(()) => debug!("Heartbeat sent"),
                    Err(e) => debug!(error = %e, "Heartbeat skipped"),
                }
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.on_unexpected_close(generation, reason);
    }
}

async fn reconnect(inner: Weak<Inner>, generation: u64) {
    loop {
        let (attempt, delay, url) = {
            let Some(inner) = inner.upgrade() else { return };
            let mut session = inner.lock();
            if session.generation != generation {
                return;
            }
            let Some(url) = session.target.as_ref().map(|t| t.url.clone()) else {
                return;
            };
            session.attempt += 1;
            let attempt = session.attempt;
            if attempt > inner.config.max_reconnect_attempts {
                drop(session);
                inner.give_up(generation);
                return;
            }
            (
                attempt,
                backoff_delay(inner.config.reconnect_base_delay, attempt),
                url,
            )
        };

        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        time::sleep(delay).await;

        let Some(inner) = inner.upgrade() else { return };
        if inner.lock().generation != generation {
            return;
        }
        match inner.open_link(&url).await {
            Ok(link) => {
                if inner.install(generation, link) {
                    info!(attempt, "Reconnected");
                }
                return;
            }
            Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
    }
}
