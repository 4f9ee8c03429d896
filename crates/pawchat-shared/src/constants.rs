use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "PawChat";

/// Interval between keepalive `ping` frames on a live connection
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A connection attempt that has not completed after this long has failed
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First reconnect delay; attempt `n` waits `base * 2^(n-1)`
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Consecutive failed reconnects before the connection is disabled
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Send attempts a queued message gets before it is dropped
pub const MAX_QUEUE_RETRIES: u32 = 3;

/// Delay before an inbound message is acknowledged as delivered
pub const DELIVERY_ACK_DELAY: Duration = Duration::from_millis(500);

/// Delay between delivered and read acknowledgements
pub const READ_ACK_DELAY: Duration = Duration::from_millis(2000);

/// Key under which the offline queue snapshot is persisted
pub const OFFLINE_QUEUE_KEY: &str = "pawchat.offline_queue";

/// Polling interval used while real-time delivery is disabled
pub const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Path segment of the chat endpoint: `ws(s)://<host>/chat/<conversation>`
pub const CHAT_PATH: &str = "chat";
