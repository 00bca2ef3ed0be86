//! Calibration state machine.
//!
//! Derives a readiness state for the active device from the stream of
//! computed [`TrainingStats`]:
//!
//! ```text
//!   Uncalibrated ──stats (samples < MIN)──> Calibrating ──samples >= MIN──> Locked
//!        │                                    │  (timeout flag after 12 s)     │
//!        └──────────── stats (samples >= MIN) ─┴───────────────────────────────┘
//!
//!   device change / reset ──> Uncalibrated
//! ```
//!
//! `Locked` is monotonic within a device session. Entering it raises a
//! transient "recently locked" badge which clears after a fixed delay. The
//! badge is a deadline owned by the machine: the owning event loop sleeps until
//! [`CalibrationMachine::badge_deadline`] and calls
//! [`CalibrationMachine::clear_badge_if_due`]. Resetting drops the deadline, so
//! a stale timer can never clear a badge belonging to another device.
//!
//! All methods take `now` explicitly; the machine never reads the clock.

use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::telemetry::TrainingStats;

/// Samples required before statistics are trusted.
pub const MIN_SAMPLES: u32 = 6;

/// How long calibration may run before it is flagged as a low-data-rate fallback.
pub const CALIBRATION_TIMEOUT: Duration = Duration::from_millis(12_000);

/// How long the "recently locked" badge stays up.
pub const LOCK_BADGE_DURATION: Duration = Duration::from_millis(1_500);

/// Tunables for the calibration machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationConfig {
    /// Samples required to lock.
    pub min_samples: u32,
    /// Calibration time before the timeout fallback flag is raised.
    pub timeout: Duration,
    /// Lifetime of the "recently locked" badge.
    pub lock_badge: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_samples: MIN_SAMPLES,
            timeout: CALIBRATION_TIMEOUT,
            lock_badge: LOCK_BADGE_DURATION,
        }
    }
}

/// Readiness of the active device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    /// No statistics seen for the active device yet.
    Uncalibrated,
    /// Collecting samples.
    Calibrating,
    /// Enough samples; statistics are trusted.
    Locked,
}

/// What a single [`CalibrationMachine::apply`] call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing noteworthy.
    Unchanged,
    /// Calibration timer started.
    CalibrationStarted,
    /// Device crossed the sample threshold.
    Locked,
    /// Another qualifying message arrived while the badge was up; its deadline moved.
    BadgeRearmed,
}

/// Point-in-time view of the calibration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalibrationStatus {
    /// Active device, if any.
    pub device_id: Option<String>,
    /// Current phase.
    pub phase: CalibrationPhase,
    /// Sample count of the latest statistics.
    pub sample_count: u32,
    /// `min(100, round(100 * samples / MIN_SAMPLES))` while calibrating, 100 once locked.
    pub progress_percent: u8,
    /// Calibrating for longer than the timeout: low data rate rather than warm-up.
    pub is_timeout_fallback: bool,
    /// Transient badge shown right after locking.
    pub recently_locked: bool,
    /// Displayed statistics come from the last-known-good snapshot.
    pub using_fallback: bool,
}

impl CalibrationStatus {
    /// Returns `true` while collecting samples.
    #[must_use]
    pub fn is_calibrating(&self) -> bool {
        self.phase == CalibrationPhase::Calibrating
    }

    /// Returns `true` once locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.phase == CalibrationPhase::Locked
    }

    /// Short status label.
    #[must_use]
    pub fn label(&self) -> String {
        match self.phase {
            CalibrationPhase::Uncalibrated => "Waiting for data".to_string(),
            CalibrationPhase::Calibrating if self.is_timeout_fallback => {
                format!("LOW DATA ({}%)", self.progress_percent)
            }
            CalibrationPhase::Calibrating => format!("CAL {}%", self.progress_percent),
            CalibrationPhase::Locked if self.recently_locked => "LOCKED".to_string(),
            CalibrationPhase::Locked => "Ready".to_string(),
        }
    }
}

/// Per-device calibration state machine.
#[derive(Debug, Clone)]
pub struct CalibrationMachine {
    config: CalibrationConfig,
    active_device: Option<String>,
    calibration_start_at: Option<Instant>,
    locked: bool,
    badge_deadline: Option<Instant>,
    latest: Option<TrainingStats>,
    last_good: Option<TrainingStats>,
}

impl CalibrationMachine {
    /// Create a machine with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CalibrationConfig::default())
    }

    /// Create a machine with custom thresholds.
    #[must_use]
    pub fn with_config(config: CalibrationConfig) -> Self {
        Self {
            config,
            active_device: None,
            calibration_start_at: None,
            locked: false,
            badge_deadline: None,
            latest: None,
            last_good: None,
        }
    }

    /// Thresholds in use.
    #[must_use]
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Device currently observed.
    #[must_use]
    pub fn active_device(&self) -> Option<&str> {
        self.active_device.as_deref()
    }

    /// Whether the active device has locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// When calibration of the active device started.
    #[must_use]
    pub fn calibration_start_at(&self) -> Option<Instant> {
        self.calibration_start_at
    }

    /// Latest statistics received, valid or not.
    #[must_use]
    pub fn latest(&self) -> Option<&TrainingStats> {
        self.latest.as_ref()
    }

    /// Last statistics that passed the display threshold.
    #[must_use]
    pub fn last_known_good(&self) -> Option<&TrainingStats> {
        self.last_good.as_ref()
    }

    /// Feed one statistics message.
    pub fn apply(&mut self, stats: TrainingStats, now: Instant) -> Transition {
        if self.active_device.as_deref() != Some(stats.device_id.as_str()) {
            tracing::info!(
                previous = ?self.active_device,
                device_id = %stats.device_id,
                "Active device changed, resetting calibration"
            );
            self.reset_session();
            self.active_device = Some(stats.device_id.clone());
        }

        let min = self.config.min_samples;
        let mut transition = Transition::Unchanged;

        if !self.locked && self.calibration_start_at.is_none() && stats.sample_count < min {
            self.calibration_start_at = Some(now);
            transition = Transition::CalibrationStarted;
            tracing::debug!(device_id = %stats.device_id, "Calibration started");
        }

        if stats.sample_count >= min {
            if !self.locked {
                self.locked = true;
                self.badge_deadline = Some(now + self.config.lock_badge);
                transition = Transition::Locked;
                tracing::info!(
                    device_id = %stats.device_id,
                    samples = stats.sample_count,
                    "Calibration locked"
                );
            } else if self.badge_deadline.is_some() {
                // single deadline: re-arm rather than stack
                self.badge_deadline = Some(now + self.config.lock_badge);
                transition = Transition::BadgeRearmed;
            }
        }

        if stats.is_displayable(min) {
            self.last_good = Some(stats.clone());
        }
        self.latest = Some(stats);
        transition
    }

    /// Pending badge-clear deadline, if the badge is up.
    #[must_use]
    pub fn badge_deadline(&self) -> Option<Instant> {
        self.badge_deadline
    }

    /// Clear the badge once its deadline has passed. Returns `true` if it cleared.
    pub fn clear_badge_if_due(&mut self, now: Instant) -> bool {
        match self.badge_deadline {
            Some(deadline) if now >= deadline => {
                self.badge_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Whether the badge is showing at `now`.
    #[must_use]
    pub fn recently_locked(&self, now: Instant) -> bool {
        self.badge_deadline.is_some_and(|deadline| now < deadline)
    }

    /// Statistics to display: the latest if valid, else the last known good.
    #[must_use]
    pub fn displayed_stats(&self) -> Option<&TrainingStats> {
        let min = self.config.min_samples;
        match &self.latest {
            Some(latest) if latest.is_displayable(min) => Some(latest),
            _ => self.last_good.as_ref(),
        }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn status(&self, now: Instant) -> CalibrationStatus {
        let min = self.config.min_samples;
        let sample_count = self.latest.as_ref().map_or(0, |s| s.sample_count);
        let using_fallback = match (&self.latest, self.displayed_stats()) {
            (Some(latest), Some(shown)) => !std::ptr::eq(latest, shown),
            _ => false,
        };

        let (phase, progress_percent, is_timeout_fallback) = if self.latest.is_none() {
            (CalibrationPhase::Uncalibrated, 0, false)
        } else if self.locked {
            (CalibrationPhase::Locked, 100, false)
        } else {
            let ratio = 100.0 * f64::from(sample_count) / f64::from(min.max(1));
            let percent = ratio.round().min(100.0) as u8;
            let timed_out = self
                .calibration_start_at
                .is_some_and(|start| now.saturating_duration_since(start) >= self.config.timeout);
            (CalibrationPhase::Calibrating, percent, timed_out)
        };

        CalibrationStatus {
            device_id: self.active_device.clone(),
            phase,
            sample_count,
            progress_percent,
            is_timeout_fallback,
            recently_locked: self.recently_locked(now),
            using_fallback,
        }
    }

    /// Explicit (user-triggered) reset: forget the device, its session and
    /// the last-known-good snapshot.
    pub fn reset(&mut self) {
        self.reset_session();
        self.active_device = None;
        self.latest = None;
        self.last_good = None;
    }

    fn reset_session(&mut self) {
        self.calibration_start_at = None;
        self.locked = false;
        self.badge_deadline = None;
    }
}

impl Default for CalibrationMachine {
    fn default() -> Self {
        Self::new()
    }
}
