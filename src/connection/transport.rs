//! Transport seam and the WebSocket implementation.

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Connect or receive fault on the streaming transport.
///
/// Never fatal: the connection manager logs it and reconnects with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// URL is not a `ws://` or `wss://` URL.
    #[error("invalid stream URL '{url}': {reason}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Could not establish the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Established connection failed while reading.
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Opens frame streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, TransportError>;
}

/// An open, receive-only frame stream.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame. `Ok(None)` means the peer closed the stream.
    ///
    /// Must be cancel-safe: the caller races it against shutdown.
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError>;

    /// Close the stream. Errors are ignored.
    async fn close(&mut self);
}

/// WebSocket client transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, TransportError> {
        let (socket, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsFrameStream { socket }))
    }
}

struct WsFrameStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(message) = self.socket.next().await {
            match message.map_err(|e| TransportError::Receive(e.to_string()))? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => tracing::debug!("Dropping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    tracing::debug!(?frame, "Close frame received");
                    return Ok(None);
                }
                // pings are answered by tungstenite
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            tracing::debug!(error = %e, "Error closing WebSocket");
        }
    }
}

/// Parse and check a stream URL.
pub fn parse_stream_url(raw: &str) -> Result<url::Url, TransportError> {
    let parsed = url::Url::parse(raw).map_err(|e| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(TransportError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Upgrade `ws:` to `wss:` when the hosting origin is encrypted.
///
/// Pure string transform; every other URL is returned unchanged.
#[must_use]
pub fn secure_stream_url(url: &str, secure_origin: bool) -> String {
    match url.strip_prefix("ws:") {
        Some(rest) if secure_origin => format!("wss:{rest}"),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_stream_url() {
        assert_eq!(secure_stream_url("ws://h:8080/ws", true), "wss://h:8080/ws");
        assert_eq!(secure_stream_url("ws://h:8080/ws", false), "ws://h:8080/ws");
        assert_eq!(secure_stream_url("wss://h/ws", true), "wss://h/ws");
        assert_eq!(secure_stream_url("http://h/ws", true), "http://h/ws");
    }

    #[test]
    fn test_parse_stream_url() {
        assert!(parse_stream_url("ws://localhost:8080/ws").is_ok());
        assert!(parse_stream_url("wss://example.com/ws").is_ok());

        let err = parse_stream_url("http://example.com").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme 'http'"));
        assert!(matches!(
            parse_stream_url("not a url"),
            Err(TransportError::InvalidUrl { .. })
        ));
    }
}
