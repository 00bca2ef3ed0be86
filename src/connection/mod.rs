//! Streaming connection lifecycle and auto-reconnect.
//!
//! The [`ConnectionManager`] owns one supervised streaming session:
//!
//! ```text
//! Disconnected ──open()──> Connecting ──on open──> Connected
//!      ▲                       │                      │
//!      │                 connect error          close / error
//!      │                       ▼                      │
//!      │          wait backoff (1s, 2s, 4s ... 15s) <─┘
//!      │                       │
//!      │                       └──> Connecting
//!      │
//!      └──────── stop() from any state (terminal, socket closed, timer cancelled)
//! ```
//!
//! Every frame is decoded on the supervisor task. Discards are logged and
//! dropped there; valid events are fanned out to all current subscribers as
//! [`StreamEvent`]s. Subscribing or unsubscribing never touches the socket.

mod backoff;
pub mod mock;
mod transport;

pub use backoff::{Backoff, ReconnectConfig};
pub use transport::{
    parse_stream_url, secure_stream_url, FrameStream, Transport, TransportError, WsTransport,
};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{decode_frame, DiscardReason, FrameEvent};
use crate::telemetry::{Telemetry, TrainingStats};

/// Connection state of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; a reconnect may be pending.
    Disconnected,
    /// Connect attempt in progress.
    Connecting,
    /// Stream open.
    Connected,
}

impl ConnectionState {
    /// Returns true if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns a short status label for display.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Live",
        }
    }
}

/// A decoded, validated event published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Normalized telemetry record.
    Telemetry(Arc<Telemetry>),
    /// Computed statistics.
    TrainingStats(Arc<TrainingStats>),
}

impl TryFrom<FrameEvent> for StreamEvent {
    type Error = DiscardReason;

    fn try_from(event: FrameEvent) -> Result<Self, Self::Error> {
        match event {
            FrameEvent::Telemetry(record) => Ok(Self::Telemetry(Arc::new(record))),
            FrameEvent::TrainingStats(stats) => Ok(Self::TrainingStats(Arc::new(stats))),
            FrameEvent::Discard(reason) => Err(reason),
        }
    }
}

/// Identifies one subscription.
pub type SubscriberId = u64;

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Subscription {
    /// Identifier to pass to [`ConnectionManager::unsubscribe`].
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: AtomicU64,
    senders: Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<StreamEvent>>>,
}

impl Subscribers {
    fn senders(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::UnboundedSender<StreamEvent>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders().insert(id, tx);
        Subscription { id, rx }
    }

    fn remove(&self, id: SubscriberId) -> bool {
        self.senders().remove(&id).is_some()
    }

    fn len(&self) -> usize {
        self.senders().len()
    }

    /// Deliver to every subscriber, pruning the ones whose receiver is gone.
    fn publish(&self, event: &StreamEvent) {
        self.senders().retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                tracing::debug!(subscriber = id, "Pruning closed subscriber");
            }
            alive
        });
    }
}

/// Owns one supervised streaming session and fans decoded events out to subscribers.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    subscribers: Arc<Subscribers>,
    /// Handle to stop the running session
    cancel_handle: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    /// Bumped by every `open` and `stop`; only the supervisor of the current
    /// session may write the state.
    generation: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Create a manager over any transport.
    pub fn new(transport: Arc<dyn Transport>, config: ReconnectConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            state_tx,
            subscribers: Arc::new(Subscribers::default()),
            cancel_handle: None,
            task: None,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a manager over the WebSocket transport.
    #[must_use]
    pub fn websocket(config: ReconnectConfig) -> Self {
        Self::new(Arc::new(WsTransport), config)
    }

    /// Get the reconnect configuration.
    #[must_use]
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Register a subscriber for decoded events.
    pub fn subscribe(&self) -> Subscription {
        self.subscribers.add()
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(id)
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a session is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.cancel_handle.is_some()
    }

    /// Start a supervised session against `url`.
    ///
    /// Returns `false` if a session is already running; no second socket is opened.
    /// Must be called from within a tokio runtime.
    pub fn open(&mut self, url: &str) -> bool {
        if self.is_busy() {
            tracing::debug!("Stream session already running");
            return false;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel_handle = Some(cancel_tx);

        // A previous supervisor may still be closing its socket; from here on
        // its state writes are ignored.
        let session = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let supervisor = Supervisor {
            url: url.to_string(),
            transport: self.transport.clone(),
            backoff: Backoff::new(&self.config),
            state_tx: self.state_tx.clone(),
            subscribers: self.subscribers.clone(),
            generation: self.generation.clone(),
            session,
        };
        self.state_tx.send_replace(ConnectionState::Connecting);
        self.task = Some(tokio::spawn(supervisor.run(cancel_rx)));
        true
    }

    /// Stop the session: cancel any pending reconnect, close the live socket
    /// and never reconnect. Safe to call repeatedly and from any state.
    pub fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = self.cancel_handle.take() {
            let _ = cancel.send(());
            tracing::info!("Stream session stopped");
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Stop and wait until the supervisor task has exited.
    pub async fn shutdown(&mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Stream supervisor task failed");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel_handle.take() {
            let _ = cancel.send(());
        }
    }
}

struct Supervisor {
    url: String,
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
    subscribers: Arc<Subscribers>,
    generation: Arc<AtomicU64>,
    session: u64,
}

impl Supervisor {
    fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.session
    }

    /// Publish `state` unless this session was stopped or superseded.
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if !self.is_current() {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn run(mut self, mut cancel_rx: oneshot::Receiver<()>) {
        loop {
            self.set_state(ConnectionState::Connecting);
            tracing::info!(url = %self.url, "Connecting to telemetry stream");

            let connected = tokio::select! {
                result = self.transport.connect(&self.url) => result,
                _ = &mut cancel_rx => break,
            };

            match connected {
                Ok(mut stream) => {
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(url = %self.url, "Telemetry stream connected");

                    loop {
                        tokio::select! {
                            frame = stream.next_frame() => match frame {
                                Ok(Some(raw)) => self.dispatch(&raw),
                                Ok(None) => {
                                    tracing::info!("Telemetry stream closed by peer");
                                    break;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "Telemetry stream error");
                                    break;
                                }
                            },
                            _ = &mut cancel_rx => {
                                stream.close().await;
                                self.set_state(ConnectionState::Disconnected);
                                return;
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(url = %self.url, error = %e, "Telemetry stream connect failed"),
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = self.backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut cancel_rx => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn dispatch(&self, raw: &str) {
        if !self.is_current() {
            return;
        }
        match StreamEvent::try_from(decode_frame(raw)) {
            Ok(event) => self.subscribers.publish(&event),
            Err(reason) => tracing::debug!(%reason, "Discarding frame"),
        }
    }
}
