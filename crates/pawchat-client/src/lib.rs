//! # pawchat-client
//!
//! Client side of PawChat's real-time delivery: the [`ChatClient`] façade
//! over the connection manager, offline queue, status tracker and REST
//! fallback.

pub mod chat;
pub mod config;
pub mod conversation;
pub mod fallback;
pub mod offline_queue;
pub mod status_tracker;

use tracing_subscriber::{fmt, EnvFilter};

pub use chat::{ChatClient, SendOutcome};
pub use config::ClientConfig;
pub use conversation::{reduce, ConversationEvent, ConversationSnapshot, ConversationStore};
pub use fallback::{Attachment, FallbackApi, HttpFallback};
pub use offline_queue::{
    ConnectivityPort, DroppedMessage, OfflineQueue, QueuedMessage, SyncReport,
};
pub use status_tracker::{AckSink, StatusTracker, TrackerConfig};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("pawchat_client=debug,pawchat_net=debug,pawchat_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
