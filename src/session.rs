//! Live dashboard session.
//!
//! [`Dashboard`] is the single owner of everything derived from the stream:
//! the history buffers, the latest record, the calibration machine and the
//! last collaborator error. It is plain synchronous state; the event loop
//! spawned by [`LiveSession::start`] is its only writer.
//!
//! The event loop reacts to, in receipt order:
//!
//! - decoded stream events from the [`ConnectionManager`] subscription
//! - connection state changes
//! - the telemetry poll timer (REST fallback, every `refresh_interval`)
//! - the training poll timer (REST fallback, every second)
//! - the calibration badge deadline
//! - commands from the [`SessionHandle`]
//!
//! Polling only runs while the stream is not connected, a token is available
//! and a device is resolved (the selected device, else the latest record's).
//! Readers only ever see immutable [`DashboardSnapshot`]s published on a
//! `watch` channel after each step.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::{ApiError, HttpApi, TelemetryApi};
use crate::auth::TokenProvider;
use crate::calibration::{CalibrationConfig, CalibrationMachine, CalibrationStatus, Transition};
use crate::config::LiveConfig;
use crate::connection::{
    parse_stream_url, secure_stream_url, ConnectionManager, ConnectionState, ReconnectConfig,
    StreamEvent, Subscription, Transport, WsTransport,
};
use crate::history::{HistoryBuffer, HistoryMode, MAX_HISTORY};
use crate::normalize::normalize;
use crate::telemetry::{Telemetry, TrainingStats};

/// Rows requested per telemetry poll.
pub const POLL_LIMIT: usize = 1;

/// Default telemetry poll interval in seconds.
pub const DEFAULT_REFRESH_SECS: u64 = 3;

/// Telemetry poll interval bounds in seconds.
pub const REFRESH_SECS_RANGE: std::ops::RangeInclusive<u64> = 1..=5;

/// Clamp a requested refresh interval into [`REFRESH_SECS_RANGE`].
#[must_use]
pub fn clamp_refresh_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(*REFRESH_SECS_RANGE.start(), *REFRESH_SECS_RANGE.end()))
}

/// Session startup fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No bearer token; nothing was opened.
    #[error("no bearer token available, sign in first")]
    MissingToken,

    /// `start` called while a session from the same `LiveSession` is running.
    #[error("live session already running")]
    AlreadyRunning,

    /// Invalid settings.
    #[error("invalid session configuration: {0}")]
    Config(String),
}

/// Runtime settings of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stream URL, already upgraded for secure origins.
    pub stream_url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Calibration thresholds.
    pub calibration: CalibrationConfig,
    /// History capacity.
    pub max_history: usize,
    /// Telemetry poll interval, within 1..=5 s.
    pub refresh_interval: Duration,
    /// Training poll interval.
    pub training_poll_interval: Duration,
    /// Analysis window requested from the training endpoint.
    pub training_window_s: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://localhost:8080/ws".to_string(),
            reconnect: ReconnectConfig::default(),
            calibration: CalibrationConfig::default(),
            max_history: MAX_HISTORY,
            refresh_interval: clamp_refresh_interval(DEFAULT_REFRESH_SECS),
            training_poll_interval: Duration::from_secs(1),
            training_window_s: 120,
        }
    }
}

impl From<&LiveConfig> for SessionConfig {
    fn from(config: &LiveConfig) -> Self {
        Self {
            stream_url: secure_stream_url(&config.stream.url, config.stream.secure_origin),
            reconnect: config.stream.reconnect(),
            calibration: config.calibration.to_calibration_config(),
            max_history: config.history.max_history,
            refresh_interval: clamp_refresh_interval(config.api.refresh_secs),
            training_poll_interval: Duration::from_millis(config.api.training_poll_ms.max(1)),
            training_window_s: config.api.training_window_s,
        }
    }
}

/// Immutable view of the dashboard state.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    /// Stream connection state.
    pub connection: ConnectionState,
    /// Latest accepted record.
    pub latest: Option<Arc<Telemetry>>,
    /// Streamed records, newest first.
    pub history: Vec<Arc<Telemetry>>,
    /// Polled records, newest first.
    pub polled: Vec<Arc<Telemetry>>,
    /// Calibration state.
    pub calibration: CalibrationStatus,
    /// Statistics to display (latest valid, else last known good).
    pub training: Option<TrainingStats>,
    /// Device chosen by the user.
    pub selected_device: Option<String>,
    /// Device the fallback polls for.
    pub resolved_device: Option<String>,
    /// Last collaborator fault.
    pub last_error: Option<String>,
    /// Credentials were rejected; polling is off.
    pub auth_fault: bool,
}

/// Single owner of the derived dashboard state.
#[derive(Debug)]
pub struct Dashboard {
    history: HistoryBuffer,
    polled: HistoryBuffer,
    latest: Option<Arc<Telemetry>>,
    calibration: CalibrationMachine,
    connection: ConnectionState,
    selected_device: Option<String>,
    last_error: Option<ApiError>,
    auth_fault: bool,
}

impl Dashboard {
    /// Empty dashboard.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            history: HistoryBuffer::new(config.max_history, HistoryMode::Stream),
            polled: HistoryBuffer::new(config.max_history, HistoryMode::PollMerge),
            latest: None,
            calibration: CalibrationMachine::with_config(config.calibration.clone()),
            connection: ConnectionState::Disconnected,
            selected_device: None,
            last_error: None,
            auth_fault: false,
        }
    }

    /// Apply one decoded stream event.
    pub fn apply_event(&mut self, event: StreamEvent, now: Instant) {
        match event {
            StreamEvent::Telemetry(record) => self.apply_telemetry(record),
            StreamEvent::TrainingStats(stats) => {
                self.apply_training(Arc::unwrap_or_clone(stats), now);
            }
        }
    }

    /// Streamed record: prepend to history and expose as latest.
    pub fn apply_telemetry(&mut self, record: Arc<Telemetry>) {
        tracing::trace!(device_id = %record.device_id, "Telemetry received");
        self.history.push(record.clone());
        self.latest = Some(record);
    }

    /// Statistics from the stream or the training poll.
    pub fn apply_training(&mut self, stats: TrainingStats, now: Instant) -> Transition {
        self.calibration.apply(stats, now)
    }

    /// Merge polled rows (newest first). Returns how many were accepted.
    pub fn merge_polled(&mut self, rows: &[Value]) -> usize {
        let mut accepted = 0;
        for row in rows.iter().rev() {
            match normalize(row, None) {
                Ok(record) => {
                    if self.polled.push(record) {
                        accepted += 1;
                    }
                }
                Err(rejection) => tracing::debug!(%rejection, "Discarding polled row"),
            }
        }
        if !self.connection.is_connected() {
            if let Some(newest) = self.polled.latest() {
                self.latest = Some(newest.clone());
            }
        }
        accepted
    }

    /// Record a connection state change.
    pub fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    /// Current connection state.
    #[must_use]
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Choose (or clear) the device the fallback polls for.
    pub fn select_device(&mut self, device_id: Option<String>) {
        self.selected_device = device_id.filter(|d| !d.trim().is_empty());
    }

    /// Selected device, else the latest record's device.
    #[must_use]
    pub fn resolved_device(&self) -> Option<String> {
        self.selected_device
            .clone()
            .or_else(|| self.latest.as_ref().map(|r| r.device_id.clone()))
    }

    /// Store a collaborator fault; credential rejection also latches the auth fault.
    pub fn record_error(&mut self, error: ApiError) {
        if error.is_unauthorized() {
            self.auth_fault = true;
        }
        self.last_error = Some(error);
    }

    /// Clear the stored fault after a successful request.
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Last collaborator fault.
    #[must_use]
    pub fn last_error(&self) -> Option<&ApiError> {
        self.last_error.as_ref()
    }

    /// Credentials were rejected.
    #[must_use]
    pub fn auth_fault(&self) -> bool {
        self.auth_fault
    }

    /// Pending badge deadline.
    #[must_use]
    pub fn badge_deadline(&self) -> Option<Instant> {
        self.calibration.badge_deadline()
    }

    /// Clear the lock badge if its deadline passed.
    pub fn clear_badge_if_due(&mut self, now: Instant) -> bool {
        self.calibration.clear_badge_if_due(now)
    }

    /// Calibration machine (read-only).
    #[must_use]
    pub fn calibration(&self) -> &CalibrationMachine {
        &self.calibration
    }

    /// Latest accepted record.
    #[must_use]
    pub fn latest(&self) -> Option<&Arc<Telemetry>> {
        self.latest.as_ref()
    }

    /// Streamed history.
    #[must_use]
    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Explicit reset: drop records, statistics, calibration and the stored error.
    /// The device selection and connection are left alone.
    pub fn reset(&mut self) {
        self.latest = None;
        self.history.reset();
        self.polled.reset();
        self.calibration.reset();
        self.last_error = None;
        tracing::info!("Dashboard reset");
    }

    /// Build an immutable snapshot.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> DashboardSnapshot {
        DashboardSnapshot {
            connection: self.connection,
            latest: self.latest.clone(),
            history: self.history.to_vec(),
            polled: self.polled.to_vec(),
            calibration: self.calibration.status(now),
            training: self.calibration.displayed_stats().cloned(),
            selected_device: self.selected_device.clone(),
            resolved_device: self.resolved_device(),
            last_error: self.last_error.as_ref().map(ToString::to_string),
            auth_fault: self.auth_fault,
        }
    }
}

#[derive(Debug)]
enum Command {
    SelectDevice(Option<String>),
    Reset,
    Shutdown,
}

/// Builds and starts live sessions.
pub struct LiveSession {
    config: SessionConfig,
    token: Arc<dyn TokenProvider>,
    api: Arc<dyn TelemetryApi>,
    transport: Arc<dyn Transport>,
    running: Arc<AtomicBool>,
}

impl LiveSession {
    /// Session over explicit collaborators.
    pub fn new(
        config: SessionConfig,
        token: Arc<dyn TokenProvider>,
        api: Arc<dyn TelemetryApi>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            token,
            api,
            transport,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Production session: WebSocket stream and HTTP polling.
    pub fn from_config(config: &LiveConfig, token: Arc<dyn TokenProvider>) -> Self {
        let api = HttpApi::new(
            &config.api.base_url,
            Duration::from_millis(config.api.request_timeout_ms),
        );
        Self::new(
            SessionConfig::from(config),
            token,
            Arc::new(api),
            Arc::new(WsTransport),
        )
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a session started from here is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open the stream and spawn the event loop.
    ///
    /// Fails with [`SessionError::MissingToken`] before opening anything when
    /// no token is available. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<SessionHandle, SessionError> {
        if self.token.bearer_token().is_none() {
            return Err(SessionError::MissingToken);
        }
        parse_stream_url(&self.config.stream_url)
            .map_err(|e| SessionError::Config(e.to_string()))?;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyRunning);
        }

        let mut manager = ConnectionManager::new(self.transport.clone(), self.config.reconnect.clone());
        let subscription = manager.subscribe();
        let state_rx = manager.watch_state();
        manager.open(&self.config.stream_url);

        let dashboard = Dashboard::new(&self.config);
        let (snapshot_tx, snapshot_rx) = watch::channel(dashboard.snapshot(Instant::now()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            dashboard,
            manager,
            subscription,
            state_rx,
            commands: command_rx,
            snapshots: snapshot_tx,
            api: self.api.clone(),
            token: self.token.clone(),
            config: self.config.clone(),
            polling_enabled: true,
            running: self.running.clone(),
        };
        tracing::info!(url = %self.config.stream_url, "Live session started");

        Ok(SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            task: Some(tokio::spawn(event_loop.run())),
        })
    }
}

/// Control and observation handle of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<DashboardSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> DashboardSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    #[must_use]
    pub fn subscribe_snapshots(&self) -> watch::Receiver<DashboardSnapshot> {
        self.snapshots.clone()
    }

    /// Choose the device the fallback polls for; `None` follows the stream.
    pub fn select_device(&self, device_id: Option<String>) {
        self.send(Command::SelectDevice(device_id));
    }

    /// Clear records, statistics and calibration.
    pub fn reset(&self) {
        self.send(Command::Reset);
    }

    /// Whether the event loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stop the stream, cancel polling and wait for the event loop to exit.
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Session task failed");
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Session already stopped");
        }
    }
}

struct EventLoop {
    dashboard: Dashboard,
    manager: ConnectionManager,
    subscription: Subscription,
    state_rx: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<DashboardSnapshot>,
    api: Arc<dyn TelemetryApi>,
    token: Arc<dyn TokenProvider>,
    config: SessionConfig,
    polling_enabled: bool,
    running: Arc<AtomicBool>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut telemetry_tick = tokio::time::interval(self.config.refresh_interval);
        telemetry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut training_tick = tokio::time::interval(self.config.training_poll_interval);
        training_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let badge = self.dashboard.badge_deadline();
            tokio::select! {
                event = self.subscription.recv() => match event {
                    Some(event) => self.dashboard.apply_event(event, Instant::now()),
                    None => break,
                },
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.state_rx.borrow_and_update();
                    tracing::debug!(state = state.label(), "Connection state changed");
                    self.dashboard.set_connection(state);
                }
                _ = telemetry_tick.tick() => self.poll_telemetry().await,
                _ = training_tick.tick() => self.poll_training().await,
                _ = tokio::time::sleep_until(badge.unwrap_or_else(Instant::now)), if badge.is_some() => {
                    self.dashboard.clear_badge_if_due(Instant::now());
                }
                command = self.commands.recv() => match command {
                    Some(Command::SelectDevice(device_id)) => {
                        tracing::info!(device_id = ?device_id, "Device selected");
                        self.dashboard.select_device(device_id);
                    }
                    Some(Command::Reset) => self.dashboard.reset(),
                    Some(Command::Shutdown) | None => break,
                },
            }
            self.publish();
        }

        self.manager.shutdown().await;
        self.dashboard.set_connection(ConnectionState::Disconnected);
        self.publish();
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Live session stopped");
    }

    fn publish(&self) {
        self.snapshots
            .send_replace(self.dashboard.snapshot(Instant::now()));
    }

    /// Token and device for a poll, when polling applies right now.
    fn poll_target(&self) -> Option<(String, String)> {
        if !self.polling_enabled || self.dashboard.connection().is_connected() {
            return None;
        }
        let token = self.token.bearer_token()?;
        let device_id = self.dashboard.resolved_device()?;
        Some((token, device_id))
    }

    async fn poll_telemetry(&mut self) {
        let Some((token, device_id)) = self.poll_target() else {
            return;
        };
        match self.api.fetch_latest(&device_id, POLL_LIMIT, &token).await {
            Ok(rows) => {
                let accepted = self.dashboard.merge_polled(&rows);
                tracing::debug!(%device_id, rows = rows.len(), accepted, "Telemetry poll");
                self.dashboard.clear_error();
            }
            Err(e) => self.on_api_error(e),
        }
    }

    async fn poll_training(&mut self) {
        let Some((token, device_id)) = self.poll_target() else {
            return;
        };
        match self
            .api
            .fetch_training_live(&device_id, self.config.training_window_s, &token)
            .await
        {
            Ok(stats) => {
                self.dashboard.apply_training(stats, Instant::now());
                self.dashboard.clear_error();
            }
            Err(e) => self.on_api_error(e),
        }
    }

    fn on_api_error(&mut self, error: ApiError) {
        if error.is_unauthorized() {
            tracing::warn!(%error, "Credentials rejected, stopping stream and polling");
            self.polling_enabled = false;
            self.manager.stop();
        } else {
            tracing::warn!(%error, "Polling request failed");
        }
        self.dashboard.record_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Movement, Orientation};
    use serde_json::json;

    fn record(device: &str, ts: f64) -> Arc<Telemetry> {
        let raw = json!({"device_id": device, "device_ts": ts, "heading_deg": ts});
        Arc::new(normalize(&raw, None).unwrap())
    }

    fn stats(device: &str, samples: u32) -> TrainingStats {
        TrainingStats {
            device_id: device.to_string(),
            window_s: Some(120.0),
            sample_count: samples,
            orientation: Some(Orientation::default()),
            movement: Some(Movement::default()),
            note: None,
        }
    }

    #[test]
    fn test_clamp_refresh_interval() {
        assert_eq!(clamp_refresh_interval(0), Duration::from_secs(1));
        assert_eq!(clamp_refresh_interval(3), Duration::from_secs(3));
        assert_eq!(clamp_refresh_interval(60), Duration::from_secs(5));
    }

    #[test]
    fn test_streamed_telemetry_updates_latest_and_history() {
        let mut dashboard = Dashboard::new(&SessionConfig::default());
        dashboard.apply_telemetry(record("d1", 1.0));
        dashboard.apply_telemetry(record("d1", 2.0));

        let snapshot = dashboard.snapshot(Instant::now());
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.latest.unwrap().heading_degrees, 2.0);
        assert_eq!(snapshot.resolved_device.as_deref(), Some("d1"));
    }

    #[test]
    fn test_merge_polled_rows() {
        let mut dashboard = Dashboard::new(&SessionConfig::default());
        let rows = vec![
            json!({"device_id": "d1", "device_ts": 2, "heading_deg": 20}),
            json!({"heading_deg": 5}),
            json!({"device_id": "d1", "device_ts": 1, "heading_deg": 10}),
        ];
        assert_eq!(dashboard.merge_polled(&rows), 2);
        assert_eq!(dashboard.latest().unwrap().heading_degrees, 20.0);

        // Same rows again are duplicates
        assert_eq!(dashboard.merge_polled(&rows), 0);
        assert!(dashboard.history().is_empty());
    }

    #[test]
    fn test_polled_rows_do_not_replace_latest_while_connected() {
        let mut dashboard = Dashboard::new(&SessionConfig::default());
        dashboard.set_connection(ConnectionState::Connected);
        dashboard.apply_telemetry(record("d1", 5.0));
        dashboard.merge_polled(&[json!({"device_id": "d1", "device_ts": 1, "heading_deg": 1})]);
        assert_eq!(dashboard.latest().unwrap().heading_degrees, 5.0);
    }

    #[test]
    fn test_selected_device_wins() {
        let mut dashboard = Dashboard::new(&SessionConfig::default());
        dashboard.apply_telemetry(record("d1", 1.0));
        dashboard.select_device(Some("d2".into()));
        assert_eq!(dashboard.resolved_device().as_deref(), Some("d2"));
        dashboard.select_device(Some("  ".into()));
        assert_eq!(dashboard.resolved_device().as_deref(), Some("d1"));
    }

    #[test]
    fn test_reset_keeps_selection() {
        let mut dashboard = Dashboard::new(&SessionConfig::default());
        let now = Instant::now();
        dashboard.select_device(Some("d1".into()));
        dashboard.apply_telemetry(record("d1", 1.0));
        dashboard.apply_training(stats("d1", 8), now);
        dashboard.record_error(ApiError::Transport("down".into()));

        dashboard.reset();
        let snapshot = dashboard.snapshot(now);
        assert!(snapshot.latest.is_none());
        assert!(snapshot.history.is_empty());
        assert!(snapshot.training.is_none());
        assert!(snapshot.last_error.is_none());
        assert_eq!(snapshot.selected_device.as_deref(), Some("d1"));
    }

    #[test]
    fn test_unauthorized_latches_auth_fault() {
        let mut dashboard = Dashboard::new(&SessionConfig::default());
        dashboard.record_error(ApiError::Status {
            status: 500,
            body: String::new(),
        });
        assert!(!dashboard.auth_fault());
        dashboard.record_error(ApiError::Unauthorized(401));
        assert!(dashboard.auth_fault());
        assert_eq!(
            dashboard.snapshot(Instant::now()).last_error.as_deref(),
            Some("unauthorized (HTTP 401)")
        );
    }
}
