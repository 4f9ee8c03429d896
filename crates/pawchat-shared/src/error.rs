use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Send attempted without a live connection. Callers queue instead.
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected or connecting to this conversation")]
    AlreadyConnected,

    #[error("Connection attempt timed out")]
    ConnectionTimeout,

    /// Terminal for the current connection; the fallback channel takes over.
    #[error("Real-time delivery unavailable: reconnect attempts exhausted")]
    MaxReconnectExceeded,

    #[error("Message {id} dropped after {attempts} failed send attempts")]
    MessageDropped { id: String, attempts: u32 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fallback request failed: {0}")]
    Fallback(String),

    #[error("No fallback channel configured")]
    FallbackUnavailable,
}

pub type Result<T> = std::result::Result<T, ChatError>;
