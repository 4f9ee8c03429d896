// Real-time transport for PawChat: connection lifecycle, frame routing and
// the WebSocket adapter.

pub mod manager;
pub mod registry;
pub mod transport;
pub mod websocket;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use manager::{backoff_delay, ConnectionConfig, ConnectionManager};
pub use registry::{listener, HandlerRegistry, Listener, ListenerSet};
pub use transport::{chat_endpoint, Connector, Link, LinkEvent};
pub use websocket::WebSocketConnector;
