//! Telemetry normalization.
//!
//! Maps an arbitrary JSON object into a canonical [`Telemetry`] record. Upstream
//! producers use different names for the same quantity (`heading_deg` vs
//! `heading`, flat `accel_x` vs nested `accelerometer.x`), so every target field
//! has an explicit, ordered list of candidate source paths. The first candidate
//! that is present and not `null` wins.
//!
//! # Resolution
//!
//! ```text
//! heading_degrees  <- heading_deg | heading            | 0
//! accel.x          <- accel_x     | accelerometer.x    | None
//! speed_kmh        <- speed_kmh   | speed              | None
//! received_at      <- envelope.received_at | received_at
//! ```
//!
//! Unit-qualified keys (`speed_kmh`, `altitude_m`, `pressure_hpa`,
//! `direction_deg`) are listed before their short forms.
//!
//! # Coercion
//!
//! Numbers are used as-is and numeric strings are parsed. Any other present
//! value is unusable: sensor fields become `None`, the heading becomes `NaN`
//! and the payload is rejected.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::telemetry::{Stamp, Telemetry, Vector3};

/// One candidate location for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPath {
    /// Top-level key of the payload.
    Key(&'static str),
    /// Key of an object nested in the payload.
    Nested(&'static str, &'static str),
    /// Top-level key of the enclosing envelope, if any.
    Envelope(&'static str),
}

/// Resolution table: one ordered candidate list per target field.
pub mod paths {
    #![allow(missing_docs)]

    use super::FieldPath::{self, Envelope, Key, Nested};

    pub const DEVICE_ID: &[FieldPath] = &[Key("device_id")];
    pub const DEVICE_TIMESTAMP: &[FieldPath] = &[Key("device_ts"), Key("timestamp")];
    pub const HEADING: &[FieldPath] = &[Key("heading_deg"), Key("heading")];
    pub const TEMPERATURE: &[FieldPath] = &[Key("temp_c"), Key("temp"), Key("temperature")];
    pub const BATTERY: &[FieldPath] = &[Key("battery_percent")];

    pub const ACCEL_X: &[FieldPath] = &[Key("accel_x"), Nested("accelerometer", "x")];
    pub const ACCEL_Y: &[FieldPath] = &[Key("accel_y"), Nested("accelerometer", "y")];
    pub const ACCEL_Z: &[FieldPath] = &[Key("accel_z"), Nested("accelerometer", "z")];
    pub const GYRO_X: &[FieldPath] = &[Key("gyro_x"), Nested("gyroscope", "x")];
    pub const GYRO_Y: &[FieldPath] = &[Key("gyro_y"), Nested("gyroscope", "y")];
    pub const GYRO_Z: &[FieldPath] = &[Key("gyro_z"), Nested("gyroscope", "z")];
    pub const MAG_X: &[FieldPath] = &[Key("mag_x"), Nested("magnetometer", "x")];
    pub const MAG_Y: &[FieldPath] = &[Key("mag_y"), Nested("magnetometer", "y")];
    pub const MAG_Z: &[FieldPath] = &[Key("mag_z"), Nested("magnetometer", "z")];

    pub const LATITUDE: &[FieldPath] = &[Key("lat"), Key("latitude")];
    pub const LONGITUDE: &[FieldPath] = &[Key("lon"), Key("longitude")];
    pub const SPEED: &[FieldPath] = &[Key("speed_kmh"), Key("speed")];
    pub const ALTITUDE: &[FieldPath] = &[Key("altitude_m"), Key("altitude")];
    pub const PRESSURE: &[FieldPath] = &[Key("pressure_hpa"), Key("pressure")];
    pub const DIRECTION: &[FieldPath] = &[Key("direction_deg"), Key("direction")];

    pub const CREATED_AT: &[FieldPath] = &[Key("created_at"), Envelope("created_at")];
    pub const RECEIVED_AT: &[FieldPath] = &[Envelope("received_at"), Key("received_at")];
}

/// Why a payload could not become a [`Telemetry`] record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Payload is not a JSON object.
    #[error("payload is not an object")]
    NotAnObject,

    /// `device_id` missing, not a string, or empty.
    #[error("missing or empty device_id")]
    MissingDeviceId,

    /// Heading present but not a finite number.
    #[error("heading is not a finite number: {0}")]
    InvalidHeading(String),
}

/// Returns the first candidate value that is present and not `null`.
#[must_use]
pub fn resolve<'a>(
    candidates: &[FieldPath],
    payload: &'a Map<String, Value>,
    envelope: Option<&'a Map<String, Value>>,
) -> Option<&'a Value> {
    candidates.iter().find_map(|path| {
        let value = match *path {
            FieldPath::Key(key) => payload.get(key),
            FieldPath::Nested(outer, inner) => payload.get(outer).and_then(|o| o.get(inner)),
            FieldPath::Envelope(key) => envelope.and_then(|env| env.get(key)),
        };
        value.filter(|v| !v.is_null())
    })
}

/// Coerce a JSON value to a number. Numeric strings are parsed.
#[must_use]
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

fn as_stamp(value: &Value) -> Option<Stamp> {
    match value {
        Value::Number(n) => n.as_f64().map(Stamp::Number),
        Value::String(s) => Some(Stamp::Text(s.clone())),
        _ => None,
    }
}

struct Resolver<'a> {
    payload: &'a Map<String, Value>,
    envelope: Option<&'a Map<String, Value>>,
}

impl<'a> Resolver<'a> {
    fn value(&self, candidates: &[FieldPath]) -> Option<&'a Value> {
        resolve(candidates, self.payload, self.envelope)
    }

    fn number(&self, candidates: &[FieldPath]) -> Option<f64> {
        self.value(candidates).and_then(as_number)
    }

    fn stamp(&self, candidates: &[FieldPath]) -> Option<Stamp> {
        self.value(candidates).and_then(as_stamp)
    }

    fn vector(&self, x: &[FieldPath], y: &[FieldPath], z: &[FieldPath]) -> Option<Vector3> {
        Vector3::from_axes(self.number(x), self.number(y), self.number(z))
    }
}

/// Normalize a payload into a canonical record.
///
/// `envelope` is the outer wrapper the payload was extracted from, if any; it
/// supplies `created_at` / `received_at` when the producer stamps the envelope
/// rather than the payload.
pub fn normalize(payload: &Value, envelope: Option<&Value>) -> Result<Telemetry, Rejection> {
    let payload = payload.as_object().ok_or(Rejection::NotAnObject)?;
    let envelope = envelope.and_then(Value::as_object);
    let r = Resolver { payload, envelope };

    let device_id = match r.value(paths::DEVICE_ID) {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        _ => return Err(Rejection::MissingDeviceId),
    };

    let heading_degrees = match r.value(paths::HEADING) {
        None => 0.0,
        Some(raw) => match as_number(raw) {
            Some(h) if h.is_finite() => h,
            _ => return Err(Rejection::InvalidHeading(raw.to_string())),
        },
    };

    Ok(Telemetry {
        device_id,
        device_timestamp: r.stamp(paths::DEVICE_TIMESTAMP),
        heading_degrees,
        temperature_c: r.number(paths::TEMPERATURE),
        battery_percent: r.number(paths::BATTERY),
        accel: r.vector(paths::ACCEL_X, paths::ACCEL_Y, paths::ACCEL_Z),
        gyro: r.vector(paths::GYRO_X, paths::GYRO_Y, paths::GYRO_Z),
        mag: r.vector(paths::MAG_X, paths::MAG_Y, paths::MAG_Z),
        latitude: r.number(paths::LATITUDE),
        longitude: r.number(paths::LONGITUDE),
        speed_kmh: r.number(paths::SPEED),
        altitude_m: r.number(paths::ALTITUDE),
        pressure_hpa: r.number(paths::PRESSURE),
        direction_degrees: r.number(paths::DIRECTION),
        created_at: r.stamp(paths::CREATED_AT),
        received_at: r.stamp(paths::RECEIVED_AT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_payload() {
        let t = normalize(&json!({"device_id": "d1", "heading_deg": 12.5}), None).unwrap();
        assert_eq!(t.device_id, "d1");
        assert_eq!(t.heading_degrees, 12.5);
        assert!(!t.has_sensor_data());
        assert_eq!(t.device_timestamp, None);
    }

    #[test]
    fn test_heading_defaults_to_zero() {
        let t = normalize(&json!({"device_id": "d1"}), None).unwrap();
        assert_eq!(t.heading_degrees, 0.0);

        // null counts as missing
        let t = normalize(&json!({"device_id": "d1", "heading_deg": null, "heading": 7}), None)
            .unwrap();
        assert_eq!(t.heading_degrees, 7.0);
    }

    #[test]
    fn test_rejects_bad_device_id() {
        assert_eq!(
            normalize(&json!({"heading_deg": 1.0}), None),
            Err(Rejection::MissingDeviceId)
        );
        assert_eq!(
            normalize(&json!({"device_id": "", "heading_deg": 1.0}), None),
            Err(Rejection::MissingDeviceId)
        );
        assert_eq!(
            normalize(&json!({"device_id": 42}), None),
            Err(Rejection::MissingDeviceId)
        );
        assert_eq!(normalize(&json!([1, 2]), None), Err(Rejection::NotAnObject));
    }

    #[test]
    fn test_blank_device_id_is_missing_but_padded_id_is_kept() {
        assert_eq!(
            normalize(&json!({"device_id": " \t "}), None),
            Err(Rejection::MissingDeviceId)
        );
        let record = normalize(&json!({"device_id": " d1 "}), None).unwrap();
        assert_eq!(record.device_id, " d1 ");
    }

    #[test]
    fn test_rejects_non_numeric_heading() {
        let result = normalize(&json!({"device_id": "d1", "heading_deg": "north"}), None);
        assert!(matches!(result, Err(Rejection::InvalidHeading(_))));

        let result = normalize(&json!({"device_id": "d1", "heading": {"deg": 3}}), None);
        assert!(matches!(result, Err(Rejection::InvalidHeading(_))));
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let t = normalize(
            &json!({"device_id": "d1", "heading_deg": "271.5", "accel_x": "0.25", "temp": " 21 "}),
            None,
        )
        .unwrap();
        assert_eq!(t.heading_degrees, 271.5);
        assert_eq!(t.accel.unwrap().x, Some(0.25));
        assert_eq!(t.temperature_c, Some(21.0));
    }

    #[test]
    fn test_nested_accelerometer_fallback() {
        let t = normalize(&json!({"device_id": "d1", "accelerometer": {"x": 1.2}}), None).unwrap();
        let accel = t.accel.unwrap();
        assert_eq!(accel.x, Some(1.2));
        assert_eq!(accel.y, None);
        assert_eq!(accel.z, None);
    }

    #[test]
    fn test_flat_key_beats_nested() {
        let t = normalize(
            &json!({"device_id": "d1", "accel_x": 0.5, "accelerometer": {"x": 1.2, "y": 3.0}}),
            None,
        )
        .unwrap();
        let accel = t.accel.unwrap();
        assert_eq!(accel.x, Some(0.5));
        assert_eq!(accel.y, Some(3.0));
    }

    #[test]
    fn test_unit_qualified_keys_take_precedence() {
        let t = normalize(
            &json!({
                "device_id": "d1",
                "speed": 10, "speed_kmh": 36,
                "altitude": 1, "altitude_m": 120.5,
                "pressure": 2, "pressure_hpa": 1013.2,
                "direction": 3, "direction_deg": 90
            }),
            None,
        )
        .unwrap();
        assert_eq!(t.speed_kmh, Some(36.0));
        assert_eq!(t.altitude_m, Some(120.5));
        assert_eq!(t.pressure_hpa, Some(1013.2));
        assert_eq!(t.direction_degrees, Some(90.0));

        let t = normalize(&json!({"device_id": "d1", "speed": 10}), None).unwrap();
        assert_eq!(t.speed_kmh, Some(10.0));
    }

    #[test]
    fn test_position_synonyms() {
        let t = normalize(
            &json!({"device_id": "d1", "latitude": 59.3, "lon": 18.0, "longitude": 99.0}),
            None,
        )
        .unwrap();
        assert_eq!(t.latitude, Some(59.3));
        assert_eq!(t.longitude, Some(18.0));
    }

    #[test]
    fn test_envelope_stamps() {
        let envelope = json!({"type": "telemetry", "received_at": "2024-05-01T10:00:00Z", "created_at": "env"});
        let payload = json!({"device_id": "d1", "created_at": 1700000000, "received_at": "payload"});

        let t = normalize(&payload, Some(&envelope)).unwrap();
        assert_eq!(t.created_at, Some(Stamp::Number(1_700_000_000.0)));
        assert_eq!(t.received_at, Some(Stamp::Text("2024-05-01T10:00:00Z".into())));

        let t = normalize(&json!({"device_id": "d1"}), Some(&envelope)).unwrap();
        assert_eq!(t.created_at, Some(Stamp::Text("env".into())));
    }

    #[test]
    fn test_device_timestamp_synonym() {
        let t = normalize(&json!({"device_id": "d1", "timestamp": "1700000000"}), None).unwrap();
        assert_eq!(t.device_timestamp, Some(Stamp::Text("1700000000".into())));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let payload = json!({"device_id": "d1", "gyroscope": {"x": 1, "y": 2, "z": 3}, "gyro_z": 9});
        let a = normalize(&payload, None).unwrap();
        let b = normalize(&payload, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.gyro.unwrap().z, Some(9.0));
    }
}
