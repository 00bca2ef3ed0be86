//! # Live Telemetry Core Library
//!
//! Client-side real-time ingestion core of a device telemetry dashboard. It keeps
//! a persistent streaming connection to a telemetry source, tolerates disconnects
//! and malformed data, normalizes heterogeneous message shapes into one canonical
//! record, keeps a bounded recent history and derives a per-device calibration
//! state from a secondary stream of computed statistics.
//!
//! ## Crate Structure
//!
//! - **`telemetry`**: canonical data model (`Telemetry`, `TrainingStats`, ...).
//! - **`normalize`**: field-resolution tables turning raw payloads into `Telemetry`.
//! - **`codec`**: raw frame → envelope → `FrameEvent` (telemetry, statistics or discard).
//! - **`history`**: bounded newest-first buffer, stream and poll-merge modes.
//! - **`calibration`**: per-device readiness state machine with timeout fallback
//!   and a transient lock badge.
//! - **`connection`**: `ConnectionManager` with exponential backoff, explicit stop,
//!   subscriber fan-out and a WebSocket `Transport`.
//! - **`auth`** / **`api`**: bearer token supply and the REST polling fallback.
//! - **`session`**: the `Dashboard` state owner and the `LiveSession` event loop.
//! - **`config`**, **`logging`**, **`error`**: figment configuration, tracing
//!   setup and the crate error type.
//!
//! ## Data flow
//!
//! ```text
//! socket ─frame─> ConnectionManager ─decode─> StreamEvent ─> Dashboard
//!                       │ (discards logged)                  ├─ HistoryBuffer / latest
//!                       └─ backoff reconnect                 └─ CalibrationMachine
//! REST poll (stream down) ──────────────────────────────────> Dashboard
//! ```

pub mod api;
pub mod auth;
pub mod calibration;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod logging;
pub mod normalize;
pub mod session;
pub mod telemetry;

pub use calibration::{CalibrationMachine, CalibrationPhase, CalibrationStatus};
pub use codec::{decode_frame, DiscardReason, FrameEvent};
pub use connection::{ConnectionManager, ConnectionState, StreamEvent};
pub use error::{AppResult, TelemetryError};
pub use history::{HistoryBuffer, HistoryMode, MAX_HISTORY};
pub use session::{Dashboard, DashboardSnapshot, LiveSession, SessionError, SessionHandle};
pub use telemetry::{Telemetry, TrainingStats};
