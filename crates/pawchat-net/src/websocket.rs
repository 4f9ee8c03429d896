//! WebSocket [`Connector`] built on tokio-tungstenite.
//!
//! Each opened link gets a pump task that owns the socket and bridges it to
//! the link's channels.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use pawchat_shared::{ChatError, Result};

use crate::transport::{Connector, Link, LinkEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<Link> {
        let (socket, response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChatError::Transport(format!("WebSocket handshake failed: {e}")))?;

        info!(
            host = url.host_str().unwrap_or_default(),
            path = url.path(),
            status = %response.status(),
            "WebSocket connected"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(socket, outbound_rx, inbound_tx));

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

async fn pump(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "WebSocket send failed");
                        let _ = inbound.send(LinkEvent::Closed { reason: Some(e.to_string()) });
                        break;
                    }
                }
                None => {
                    // Owner dropped the link: explicit close.
                    debug!("Closing WebSocket on request");
                    let _ = sink.close().await;
                    break;
                }
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(LinkEvent::Frame(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if inbound.send(LinkEvent::Frame(text)).is_err() {
                            break;
                        }
                    }
                    Err(_) => warn!("Discarding non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    debug!(reason = ?reason, "WebSocket closed by server");
                    let _ = inbound.send(LinkEvent::Closed { reason });
                    break;
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read failed");
                    let _ = inbound.send(LinkEvent::Closed { reason: Some(e.to_string()) });
                    break;
                }
                None => {
                    let _ = inbound.send(LinkEvent::Closed { reason: None });
                    break;
                }
            }
        }
    }

    debug!("WebSocket pump terminated");
}
