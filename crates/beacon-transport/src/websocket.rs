//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! Frames travel as text messages; binary messages are accepted when they
//! hold UTF-8 JSON.

use async_trait::async_trait;
use beacon_protocol::{codec, Frame, ProtocolError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};
use url::Url;

use crate::traits::{Connection, ConnectionId, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server endpoint, e.g. `wss://chat.example.com/ws`.
    pub url: String,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl WebSocketConfig {
    /// Create a config for `url` with the default message size limit.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_message_size: codec::MAX_FRAME_SIZE,
        }
    }
}

/// WebSocket client transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Get the configured endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }
}

/// Append the credential to `url` as a form-encoded `token` query parameter.
fn endpoint_url(url: &str, credential: Option<&str>) -> Result<String, TransportError> {
    let Some(token) = credential else {
        return Ok(url.to_string());
    };
    let mut endpoint = Url::parse(url)
        .map_err(|e| TransportError::ConnectFailed(format!("invalid endpoint {url}: {e}")))?;
    endpoint.query_pairs_mut().append_pair("token", token);
    Ok(endpoint.into())
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, credential: Option<&str>) -> Result<Box<dyn Connection>, TransportError> {
        let url = endpoint_url(&self.config.url, credential)?;

        let (stream, response) = connect_async(url.as_str()).await.map_err(|e| {
            debug!(url = %self.config.url, error = %e, "WebSocket handshake failed");
            TransportError::ConnectFailed(e.to_string())
        })?;

        debug!(url = %self.config.url, status = %response.status(), "WebSocket handshake completed");

        let conn = WebSocketConnection::new(stream, self.config.max_message_size);
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    is_open: bool,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            is_open: true,
            max_message_size,
        }
    }

    fn decode(&self, text: &str) -> Result<Option<Frame>, TransportError> {
        if text.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                text.len(),
                self.max_message_size
            );
            return Err(ProtocolError::FrameTooLarge(text.len()).into());
        }
        Ok(Some(codec::decode(text)?))
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return self.decode(&text),
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data);
                    return self.decode(&text);
                }
                // Control-level keepalive; the JSON ping/pong is handled above us.
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!(conn = %self.id, error = %e, "Control pong not sent");
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {
                    trace!(conn = %self.id, "Control frame skipped");
                }
                Some(Ok(Message::Close(close))) => {
                    debug!(conn = %self.id, ?close, "Server closed the channel");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!(conn = %self.id, "Channel ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(conn = %self.id, error = %e, "Channel read failed");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let text = codec::encode(frame)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
