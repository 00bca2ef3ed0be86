//! In-memory transport for tests and offline demos.
//!
//! `MockTransport` records every connect attempt (with the tokio clock, so
//! paused-time tests can assert on backoff) and hands the test a
//! [`MockPeer`] for each accepted connection. The peer pushes frames, closes
//! the stream or injects a receive error.
//!
//! ```rust,ignore
//! let mock = Arc::new(MockTransport::new());
//! let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
//! manager.open("ws://test/ws");
//! // ... wait for Connected ...
//! mock.peer().unwrap().send_text(r#"{"device_id":"d1"}"#);
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::transport::{FrameStream, Transport, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum MockFrame {
    Text(String),
    Close,
    Error(String),
}

/// Server side of one mock connection.
#[derive(Debug, Clone)]
pub struct MockPeer {
    tx: mpsc::UnboundedSender<MockFrame>,
    closed_by_client: Arc<AtomicBool>,
}

impl MockPeer {
    /// Push a text frame. Returns `false` if the client side is gone.
    pub fn send_text(&self, frame: impl Into<String>) -> bool {
        self.tx.send(MockFrame::Text(frame.into())).is_ok()
    }

    /// Close the stream from the server side.
    pub fn close(&self) {
        let _ = self.tx.send(MockFrame::Close);
    }

    /// Fail the next read with a receive error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(MockFrame::Error(reason.into()));
    }

    /// Whether the client closed this connection.
    #[must_use]
    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }
}

/// Scriptable in-memory [`Transport`].
#[derive(Debug, Default)]
pub struct MockTransport {
    refuse: AtomicBool,
    close_delay: Mutex<Duration>,
    attempts: Mutex<Vec<(String, Instant)>>,
    peers: Mutex<Vec<MockPeer>>,
}

impl MockTransport {
    /// Transport that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that refuses every connection until [`Self::set_refuse`] flips it.
    #[must_use]
    pub fn refusing() -> Self {
        let transport = Self::default();
        transport.set_refuse(true);
        transport
    }

    /// Refuse (or accept) subsequent connect attempts.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make client-side closes of later connections take `delay`.
    pub fn set_close_delay(&self, delay: Duration) {
        *lock(&self.close_delay) = delay;
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// Tokio-clock time of every connect attempt.
    #[must_use]
    pub fn attempt_times(&self) -> Vec<Instant> {
        lock(&self.attempts).iter().map(|(_, at)| *at).collect()
    }

    /// URL of the most recent attempt.
    #[must_use]
    pub fn last_url(&self) -> Option<String> {
        lock(&self.attempts).last().map(|(url, _)| url.clone())
    }

    /// Peer of the most recent accepted connection.
    #[must_use]
    pub fn peer(&self) -> Option<MockPeer> {
        lock(&self.peers).last().cloned()
    }

    /// Number of accepted connections.
    #[must_use]
    pub fn accepted(&self) -> usize {
        lock(&self.peers).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, TransportError> {
        lock(&self.attempts).push((url.to_string(), Instant::now()));
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let closed_by_client = Arc::new(AtomicBool::new(false));
        lock(&self.peers).push(MockPeer {
            tx,
            closed_by_client: closed_by_client.clone(),
        });
        Ok(Box::new(MockFrameStream {
            rx,
            closed_by_client,
            close_delay: *lock(&self.close_delay),
        }))
    }
}

struct MockFrameStream {
    rx: mpsc::UnboundedReceiver<MockFrame>,
    closed_by_client: Arc<AtomicBool>,
    close_delay: Duration,
}

#[async_trait]
impl FrameStream for MockFrameStream {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(MockFrame::Text(text)) => Ok(Some(text)),
            Some(MockFrame::Error(reason)) => Err(TransportError::Receive(reason)),
            Some(MockFrame::Close) | None => Ok(None),
        }
    }

    async fn close(&mut self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed_by_client.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_peer_round_trip() {
        let transport = MockTransport::new();
        let mut stream = transport.connect("ws://mock/ws").await.unwrap();
        let peer = transport.peer().unwrap();

        assert!(peer.send_text("hello"));
        assert_eq!(stream.next_frame().await.unwrap(), Some("hello".into()));

        peer.fail("boom");
        assert_eq!(
            stream.next_frame().await,
            Err(TransportError::Receive("boom".into()))
        );

        peer.close();
        assert_eq!(stream.next_frame().await.unwrap(), None);

        stream.close().await;
        assert!(peer.closed_by_client());
        assert_eq!(transport.last_url().as_deref(), Some("ws://mock/ws"));
    }

    #[tokio::test]
    async fn test_refusing_transport() {
        let transport = MockTransport::refusing();
        assert!(transport.connect("ws://mock/ws").await.is_err());
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(transport.accepted(), 0);

        transport.set_refuse(false);
        assert!(transport.connect("ws://mock/ws").await.is_ok());
        assert_eq!(transport.accepted(), 1);
    }
}
