//! Scripted in-memory [`Connector`] for tests.
//!
//! Each `open` call consumes the next scripted [`MockOutcome`] (falling back
//! to a default once the script runs out). Accepted links expose their server
//! side as a [`RemoteEnd`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use pawchat_shared::{ChatError, ClientFrame, Result, ServerFrame};

use crate::transport::{Connector, Link, LinkEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Accept,
    Fail,
    /// Never completes; exercises the connect timeout.
    Hang,
}

/// Server side of an accepted mock link.
pub struct RemoteEnd {
    sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl RemoteEnd {
    pub fn push(&self, frame: &ServerFrame) {
        let text = serde_json::to_string(frame).expect("server frame serializes");
        let _ = self.events.send(LinkEvent::Frame(text));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.events.send(LinkEvent::Frame(text.to_string()));
    }

    /// Simulate the network dropping the link.
    pub fn close(&self) {
        let _ = self.events.send(LinkEvent::Closed {
            reason: Some("remote closed".into()),
        });
    }

    /// Drain every frame the client has written so far.
    pub fn sent_frames(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            frames.push(ClientFrame::from_json(&text).expect("client frame decodes"));
        }
        frames
    }

    /// Whether the client has dropped its sending half (explicit close).
    pub fn is_closed_by_client(&mut self) -> bool {
        matches!(
            self.sent.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }
}

struct MockState {
    script: VecDeque<MockOutcome>,
    fallback: MockOutcome,
    attempts: Vec<Url>,
    remotes: VecDeque<RemoteEnd>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Connector accepting every attempt.
    pub fn accepting() -> Self {
        Self::scripted([], MockOutcome::Accept)
    }

    pub fn scripted(script: impl IntoIterator<Item = MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: script.into_iter().collect(),
                fallback,
                attempts: Vec::new(),
                remotes: VecDeque::new(),
            })),
        }
    }

    /// Number of `open` calls so far.
    pub fn attempts(&self) -> usize {
        self.state.lock().expect("mock state").attempts.len()
    }

    pub fn last_url(&self) -> Option<Url> {
        self.state.lock().expect("mock state").attempts.last().cloned()
    }

    /// Take the server side of the oldest accepted link not yet taken.
    pub fn take_remote(&self) -> Option<RemoteEnd> {
        self.state.lock().expect("mock state").remotes.pop_front()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url) -> Result<Link> {
        let outcome = {
            let mut state = self.state.lock().expect("mock state");
            state.attempts.push(url.clone());
            let fallback = state.fallback;
            state.script.pop_front().unwrap_or(fallback)
        };

        match outcome {
            MockOutcome::Accept => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                self.state
                    .lock()
                    .expect("mock state")
                    .remotes
                    .push_back(RemoteEnd {
                        sent: outbound_rx,
                        events: inbound_tx,
                    });
                Ok(Link {
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                })
            }
            MockOutcome::Fail => Err(ChatError::Transport("connection refused".into())),
            MockOutcome::Hang => std::future::pending().await,
        }
    }
}
