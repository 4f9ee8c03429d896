//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a development client starts with zero
//! configuration against a local server.

use std::path::PathBuf;
use std::time::Duration;

use pawchat_net::ConnectionConfig;
use pawchat_shared::constants::FALLBACK_POLL_INTERVAL;
use pawchat_shared::UserId;

use crate::status_tracker::TrackerConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host[:port]` of the real-time chat endpoint.
    /// Env: `PAWCHAT_HOST`
    /// Default: `localhost:8000`
    pub host: String,

    /// Connect over `wss://`.
    /// Env: `PAWCHAT_SECURE` (true/false)
    /// Default: `false`
    pub secure: bool,

    /// Base URL of the REST API used as fallback. `None` disables the
    /// fallback channel.
    /// Env: `PAWCHAT_API_URL`
    pub api_url: Option<String>,

    /// Bearer token for both channels.
    /// Env: `PAWCHAT_TOKEN`
    pub token: String,

    /// Id of the local user; their own messages are never acknowledged.
    /// Env: `PAWCHAT_USER_ID`
    pub user_id: UserId,

    /// SQLite file backing the offline queue. `None` uses the platform data
    /// directory.
    /// Env: `PAWCHAT_QUEUE_DB`
    pub queue_db: Option<PathBuf>,

    /// Poll interval of the fallback channel while real-time is disabled.
    /// Env: `PAWCHAT_POLL_INTERVAL_SECS`
    /// Default: `15`
    pub poll_interval: Duration,

    pub connection: ConnectionConfig,
    pub tracker: TrackerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            host: connection.host.clone(),
            secure: connection.secure,
            api_url: None,
            token: String::new(),
            user_id: UserId::new("anonymous"),
            queue_db: None,
            poll_interval: FALLBACK_POLL_INTERVAL,
            connection,
            tracker: TrackerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("PAWCHAT_HOST") {
            if host.trim().is_empty() {
                tracing::warn!("Empty PAWCHAT_HOST, using default");
            } else {
                config.host = host.trim().to_string();
            }
        }

        if let Some(val) = lookup("PAWCHAT_SECURE") {
            config.secure = val == "true" || val == "1";
        }

        if let Some(url) = lookup("PAWCHAT_API_URL") {
            if !url.is_empty() {
                config.api_url = Some(url);
            }
        }

        if let Some(token) = lookup("PAWCHAT_TOKEN") {
            config.token = token;
        }

        if let Some(user) = lookup("PAWCHAT_USER_ID") {
            if !user.is_empty() {
                config.user_id = UserId::new(user);
            }
        }

        if let Some(path) = lookup("PAWCHAT_QUEUE_DB") {
            config.queue_db = Some(PathBuf::from(path));
        }

        if let Some(val) = lookup("PAWCHAT_POLL_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.poll_interval = Duration::from_secs(secs),
                _ => {
                    tracing::warn!(
                        value = %val,
                        "Invalid PAWCHAT_POLL_INTERVAL_SECS, using default"
                    );
                }
            }
        }

        config.connection.host = config.host.clone();
        config.connection.secure = config.secure;
        config
    }
}
