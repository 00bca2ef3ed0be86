//! Frame codec.
//!
//! Turns one raw text frame from the stream into a [`FrameEvent`]. Decoding
//! never fails: anything that cannot be used becomes
//! [`FrameEvent::Discard`] with a reason suitable for a diagnostic log line.
//!
//! # Accepted shapes
//!
//! ```text
//! {"type": "telemetry", "payload": {...}}                  single envelope
//! {"type": "telemetry", "payload": {"payload": {...}}}     relayed (double) envelope
//! {"type": "training_live", "device_id": ..., ...}         flat training stats
//! {"device_id": ..., "heading_deg": ...}                   bare telemetry payload
//! ```
//!
//! Objects with an unknown or non-string `type` are bare payloads too; the
//! normalizer decides whether they are usable.
//!
//! The direct bridge and the pass-through relay wrap payloads with different
//! depth, so at most two `payload` levels are unwrapped.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::normalize::{normalize, Rejection};
use crate::telemetry::{Telemetry, TrainingStats};

/// Envelope tag for telemetry frames.
pub const TYPE_TELEMETRY: &str = "telemetry";

/// Envelope tag for computed training statistics.
pub const TYPE_TRAINING_LIVE: &str = "training_live";

/// Known envelope discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Device sample
    Telemetry,
    /// Computed statistics
    TrainingLive,
}

impl MessageKind {
    /// Map a `type` tag to a kind.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            TYPE_TELEMETRY => Some(Self::Telemetry),
            TYPE_TRAINING_LIVE => Some(Self::TrainingLive),
            _ => None,
        }
    }
}

/// A decoded frame with its payload extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// What the payload is.
    pub kind: MessageKind,
    /// Extracted payload object.
    pub payload: Value,
    /// The remaining outer wrapper (without `payload`), if the frame was wrapped.
    pub outer: Option<Value>,
}

/// Why a frame was dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscardReason {
    /// Frame text is not JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Frame decoded to something other than an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// `training_live` frame without the expected fields.
    #[error("invalid training stats: {0}")]
    InvalidTrainingStats(String),

    /// Telemetry payload failed validation.
    #[error("telemetry rejected: {0}")]
    Rejected(#[from] Rejection),
}

/// Outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A valid, normalized telemetry record.
    Telemetry(Telemetry),
    /// Computed statistics for one device.
    TrainingStats(TrainingStats),
    /// Unusable frame.
    Discard(DiscardReason),
}

impl FrameEvent {
    /// Returns `true` for [`FrameEvent::Discard`].
    #[must_use]
    pub fn is_discard(&self) -> bool {
        matches!(self, Self::Discard(_))
    }
}

/// Takes `payload` out of `map` if it is an object.
fn take_payload(map: &mut Map<String, Value>) -> Option<Map<String, Value>> {
    match map.remove("payload") {
        Some(Value::Object(inner)) => Some(inner),
        Some(other) => {
            // not an object: leave it where it was
            map.insert("payload".to_string(), other);
            None
        }
        None => None,
    }
}

/// Classify a decoded value and extract its payload.
pub fn unwrap_envelope(value: Value) -> Result<Envelope, DiscardReason> {
    let Value::Object(mut outer) = value else {
        return Err(DiscardReason::NotAnObject);
    };

    // Anything that is not a known envelope is a bare telemetry payload.
    let Some(kind) = outer
        .get("type")
        .and_then(Value::as_str)
        .and_then(MessageKind::from_tag)
    else {
        return Ok(Envelope {
            kind: MessageKind::Telemetry,
            payload: Value::Object(outer),
            outer: None,
        });
    };

    match take_payload(&mut outer) {
        Some(mut inner) => {
            let payload = take_payload(&mut inner).unwrap_or(inner);
            Ok(Envelope {
                kind,
                payload: Value::Object(payload),
                outer: Some(Value::Object(outer)),
            })
        }
        None => Ok(Envelope {
            kind,
            payload: Value::Object(outer),
            outer: None,
        }),
    }
}

/// Decode an already-parsed JSON value.
#[must_use]
pub fn decode_value(value: Value) -> FrameEvent {
    let envelope = match unwrap_envelope(value) {
        Ok(envelope) => envelope,
        Err(reason) => return FrameEvent::Discard(reason),
    };

    match envelope.kind {
        MessageKind::Telemetry => match normalize(&envelope.payload, envelope.outer.as_ref()) {
            Ok(record) => FrameEvent::Telemetry(record),
            Err(rejection) => FrameEvent::Discard(rejection.into()),
        },
        MessageKind::TrainingLive => match serde_json::from_value::<TrainingStats>(envelope.payload)
        {
            Ok(stats) => FrameEvent::TrainingStats(stats),
            Err(e) => FrameEvent::Discard(DiscardReason::InvalidTrainingStats(e.to_string())),
        },
    }
}

/// Decode one raw text frame.
#[must_use]
pub fn decode_frame(raw: &str) -> FrameEvent {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => decode_value(value),
        Err(e) => FrameEvent::Discard(DiscardReason::InvalidJson(e.to_string())),
    }
}
