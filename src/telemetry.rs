//! Canonical telemetry and training-statistics types.
//!
//! Everything downstream of the frame codec works with these types only:
//!
//! - [`Telemetry`]: one normalized device sample. Construction goes through
//!   [`crate::normalize`], which guarantees a non-empty `device_id` and a finite
//!   heading.
//! - [`TrainingStats`]: computed orientation / movement statistics pushed by the
//!   upstream ("training live" messages). Consumed by the calibration machine.
//!
//! Records are immutable once built and are shared as `Arc<Telemetry>` between
//! the history buffer and snapshots.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A timestamp as reported by a device or the ingest server.
///
/// Upstream producers disagree on the representation, so both numbers and
/// strings are accepted and kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stamp {
    /// Numeric stamp, interpreted as Unix seconds when rendered.
    Number(f64),
    /// Free-form stamp (ISO-8601, all-digit seconds, ...).
    Text(String),
}

impl Stamp {
    /// Interpret the stamp as Unix seconds.
    ///
    /// Numbers and all-digit strings convert; anything else returns `None`.
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Local>> {
        let secs = match self {
            Self::Number(n) if n.is_finite() => *n,
            Self::Number(_) => return None,
            Self::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                trimmed.parse::<i64>().ok()? as f64
            }
        };
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9) as u32;
        DateTime::<Utc>::from_timestamp(whole as i64, nanos).map(|utc| utc.with_timezone(&Local))
    }

    /// Human readable rendering used by the CLI.
    #[must_use]
    pub fn display(&self) -> String {
        if let Some(dt) = self.to_datetime() {
            return dt.format("%Y-%m-%d %H:%M:%S").to_string();
        }
        match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Number(_) => "--".to_string(),
        }
    }

    /// Key fragment used for de-duplication.
    ///
    /// A string holding a number keys like that number, so `1`, `"1"` and
    /// `" 1.0 "` name the same instant. Other strings key on their trimmed text.
    pub(crate) fn key(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => {
                let trimmed = s.trim();
                match trimmed.parse::<f64>() {
                    Ok(n) if n.is_finite() => n.to_string(),
                    _ => trimmed.to_string(),
                }
            }
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Three-axis sensor reading. Each axis resolves independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    /// X axis
    pub x: Option<f64>,
    /// Y axis
    pub y: Option<f64>,
    /// Z axis
    pub z: Option<f64>,
}

impl Vector3 {
    /// Returns `None` when no axis resolved, so absent sensors stay `null`.
    #[must_use]
    pub fn from_axes(x: Option<f64>, y: Option<f64>, z: Option<f64>) -> Option<Self> {
        if x.is_none() && y.is_none() && z.is_none() {
            None
        } else {
            Some(Self { x, y, z })
        }
    }
}

/// Canonical snapshot of one device sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Reporting device. Never empty.
    pub device_id: String,
    /// Device-side timestamp.
    pub device_timestamp: Option<Stamp>,
    /// Compass heading in degrees. Always finite; 0 when the device sent none.
    pub heading_degrees: f64,
    /// Temperature in °C.
    pub temperature_c: Option<f64>,
    /// Battery charge in percent.
    pub battery_percent: Option<f64>,
    /// Accelerometer.
    pub accel: Option<Vector3>,
    /// Gyroscope.
    pub gyro: Option<Vector3>,
    /// Magnetometer.
    pub mag: Option<Vector3>,
    /// Latitude in decimal degrees.
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees.
    pub longitude: Option<f64>,
    /// Ground speed in km/h.
    pub speed_kmh: Option<f64>,
    /// Altitude in metres.
    pub altitude_m: Option<f64>,
    /// Barometric pressure in hPa.
    pub pressure_hpa: Option<f64>,
    /// Direction of travel in degrees.
    pub direction_degrees: Option<f64>,
    /// When the server stored the sample.
    pub created_at: Option<Stamp>,
    /// When the server received the sample.
    pub received_at: Option<Stamp>,
}

impl Telemetry {
    /// Key used by the poll-merge history path.
    #[must_use]
    pub fn dedup_key(&self) -> (String, String) {
        let ts = self
            .device_timestamp
            .as_ref()
            .map(Stamp::key)
            .unwrap_or_default();
        (self.device_id.clone(), ts)
    }

    /// Returns `true` if any sensor or position field carries a value.
    #[must_use]
    pub fn has_sensor_data(&self) -> bool {
        self.temperature_c.is_some()
            || self.battery_percent.is_some()
            || self.accel.is_some()
            || self.gyro.is_some()
            || self.mag.is_some()
            || self.latitude.is_some()
            || self.longitude.is_some()
            || self.speed_kmh.is_some()
            || self.altitude_m.is_some()
            || self.pressure_hpa.is_some()
            || self.direction_degrees.is_some()
    }
}

/// Dominant drift direction reported by the statistics producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftDirection {
    /// Drifting left
    Left,
    /// Drifting right
    Right,
    /// Balanced
    Center,
    /// Not enough data, or a value this client does not know
    #[default]
    #[serde(other)]
    Unknown,
}

/// Orientation estimate in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    /// Pitch
    #[serde(default)]
    pub pitch_deg: Option<f64>,
    /// Roll
    #[serde(default)]
    pub roll_deg: Option<f64>,
    /// Yaw
    #[serde(default)]
    pub yaw_deg: Option<f64>,
}

/// Movement quality metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    /// 0-100, higher is steadier
    #[serde(default)]
    pub stability_score: Option<f64>,
    /// Small corrective movements per second
    #[serde(default)]
    pub micro_move_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub gyro_mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub gyro_std: Option<f64>,
    /// Accumulated drift
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_deg: Option<f64>,
    /// Drift rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_deg_per_s: Option<f64>,
    /// Drift direction
    #[serde(default)]
    pub drift_dir: DriftDirection,
}

/// Computed statistics for one device, as pushed over the stream
/// (`type = "training_live"`) or returned by the REST fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Device the statistics belong to.
    pub device_id: String,
    /// Analysis window in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_s: Option<f64>,
    /// Number of samples the statistics were computed from.
    #[serde(default)]
    pub sample_count: u32,
    /// Orientation estimate, absent while warming up.
    #[serde(default)]
    pub orientation: Option<Orientation>,
    /// Movement metrics, absent while warming up.
    #[serde(default)]
    pub movement: Option<Movement>,
    /// Free-form producer note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TrainingStats {
    /// Returns `true` when these statistics are trustworthy enough to display:
    /// enough samples and both orientation and movement present.
    #[must_use]
    pub fn is_displayable(&self, min_samples: u32) -> bool {
        self.sample_count >= min_samples && self.orientation.is_some() && self.movement.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_accepts_number_and_string() {
        let n: Stamp = serde_json::from_str("1700000000").unwrap();
        assert_eq!(n, Stamp::Number(1_700_000_000.0));

        let s: Stamp = serde_json::from_str("\"2024-01-01T00:00:00Z\"").unwrap();
        assert_eq!(s, Stamp::Text("2024-01-01T00:00:00Z".into()));
    }

    #[test]
    fn test_stamp_key_ignores_representation() {
        assert_eq!(Stamp::Number(1.0).key(), Stamp::Text("1".into()).key());
        assert_eq!(Stamp::Number(1.0).key(), Stamp::Text(" 1.0 ".into()).key());
        assert_eq!(Stamp::Number(1.5).key(), Stamp::Text("1.5".into()).key());
        assert_ne!(Stamp::Number(1.0).key(), Stamp::Text("2".into()).key());

        let iso = Stamp::Text(" 2024-01-01T00:00:00Z".into());
        assert_eq!(iso.key(), "2024-01-01T00:00:00Z");
        assert_eq!(Stamp::Text("NaN".into()).key(), "NaN");
    }

    #[test]
    fn test_stamp_datetime_conversion() {
        assert!(Stamp::Number(1_700_000_000.0).to_datetime().is_some());
        assert!(Stamp::Text(" 1700000000 ".into()).to_datetime().is_some());
        assert!(Stamp::Text("yesterday".into()).to_datetime().is_none());
        assert!(Stamp::Number(f64::NAN).to_datetime().is_none());

        assert_eq!(Stamp::Text("  soon ".into()).display(), "soon");
    }

    #[test]
    fn test_vector_from_axes() {
        assert_eq!(Vector3::from_axes(None, None, None), None);
        let v = Vector3::from_axes(Some(1.0), None, None).unwrap();
        assert_eq!(v.x, Some(1.0));
        assert_eq!(v.y, None);
    }

    #[test]
    fn test_drift_direction_unknown_fallback() {
        let m: Movement =
            serde_json::from_str(r#"{"stability_score": 90, "drift_dir": "sideways"}"#).unwrap();
        assert_eq!(m.drift_dir, DriftDirection::Unknown);

        let m: Movement = serde_json::from_str(r#"{"drift_dir": "left"}"#).unwrap();
        assert_eq!(m.drift_dir, DriftDirection::Left);
    }

    #[test]
    fn test_training_stats_displayable() {
        let mut stats: TrainingStats =
            serde_json::from_str(r#"{"device_id": "d1", "sample_count": 8}"#).unwrap();
        assert!(!stats.is_displayable(6));

        stats.orientation = Some(Orientation::default());
        stats.movement = Some(Movement::default());
        assert!(stats.is_displayable(6));
        assert!(!stats.is_displayable(10));
    }
}
