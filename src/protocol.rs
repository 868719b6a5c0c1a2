//! Wire protocol spoken with the signaling server.
//!
//! Outbound text messages are JSON objects discriminated by a `type` field.
//! A frame travels as a `frame_meta` text message immediately followed by one
//! binary message with the raw JPEG bytes.
//!
//! Inbound text messages carrying a numeric `heading` are feedback; anything
//! else is ignored.

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::{FrameContext, FrameId, LocationFix};
use crate::Result;

/// Messages sent to the server as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "frame_meta")]
    FrameMeta(FrameMeta),
    #[serde(rename = "location")]
    Location(LocationReport),
    #[serde(rename = "Setting")]
    Setting(SettingChange),
    #[serde(rename = "stats")]
    Stats(StatsReport),
}

impl OutboundMessage {
    /// Encode as a JSON text message.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Metadata envelope that precedes every frame payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMeta {
    pub frame_id: FrameId,
    /// Wall clock send time in epoch milliseconds
    pub ts: u64,
    pub latency_ms: String,
    pub longitude: String,
    pub latitude: String,
    #[serde(rename = "selectedModel")]
    pub selected_model: String,
}

impl FrameMeta {
    /// Build the envelope for `frame_id` from the latest known context.
    pub fn new(frame_id: FrameId, ts: u64, context: &FrameContext, selected_model: &str) -> Self {
        let (longitude, latitude) = match context.location {
            Some(point) => (point.longitude.to_string(), point.latitude.to_string()),
            None => (String::new(), String::new()),
        };

        Self {
            frame_id,
            ts,
            latency_ms: format_latency(context.latency),
            longitude,
            latitude,
            selected_model: selected_model.to_string(),
        }
    }
}

/// Location telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationReport {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f32,
    pub ts: u64,
}

impl LocationReport {
    pub fn new(fix: &LocationFix, ts: u64) -> Self {
        Self {
            lat: fix.position.latitude,
            lon: fix.position.longitude,
            accuracy_m: fix.accuracy_m,
            ts,
        }
    }
}

/// Notification that the processing model selection changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingChange {
    #[serde(rename = "selectedModel")]
    pub selected_model: String,
}

/// Client-side statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub latency: String,
    pub longitude: String,
    pub latitude: String,
}

impl StatsReport {
    pub fn new(context: &FrameContext) -> Self {
        let meta = FrameMeta::new(0, 0, context, "");
        Self { latency: meta.latency_ms, longitude: meta.longitude, latitude: meta.latitude }
    }
}

/// Heading feedback received from the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    /// Suggested heading in degrees (0 = right, 90 = straight ahead)
    pub heading: f64,
    /// Frame the feedback refers to, when the server echoes it
    pub frame_id: Option<FrameId>,
}

impl Feedback {
    /// Parse an inbound text message.
    ///
    /// Returns `None` for malformed JSON, non-objects, and objects without a
    /// usable `heading`. Numbers encoded as strings are accepted, and a
    /// `frame_id` may be an integral float (`123.0`). A `frame_id` that is
    /// not a non-negative integer is treated as absent.
    pub fn parse(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;
        let heading = object.get("heading").and_then(lenient_f64)?;
        let frame_id = object.get("frame_id").and_then(lenient_frame_id);
        Some(Self { heading, frame_id })
    }
}

fn lenient_f64(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        other => other.as_f64()?,
    };
    number.is_finite().then_some(number)
}

fn lenient_frame_id(value: &serde_json::Value) -> Option<FrameId> {
    if let Some(id) = value.as_u64() {
        return Some(id);
    }
    if let serde_json::Value::String(s) = value {
        if let Ok(id) = s.trim().parse::<FrameId>() {
            return Some(id);
        }
    }
    let number = lenient_f64(value)?;
    (number >= 0.0 && number.fract() == 0.0 && number < u64::MAX as f64).then_some(number as FrameId)
}

/// Render a latency for the wire: whole milliseconds, empty when unknown.
pub fn format_latency(latency: Option<Duration>) -> String {
    latency.map(|l| l.as_millis().to_string()).unwrap_or_default()
}

/// Current wall clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoPoint;
    use serde_json::{Value, json};

    #[test]
    fn frame_meta_wire_shape() {
        let context = FrameContext::new(
            Some(Duration::from_millis(87)),
            Some(GeoPoint::new(51.0543, 3.7174)),
        );
        let message = OutboundMessage::FrameMeta(FrameMeta::new(42, 1_700_000_000_000, &context, "unrealsim.pt"));
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "frame_meta",
                "frame_id": 42,
                "ts": 1_700_000_000_000u64,
                "latency_ms": "87",
                "longitude": "3.7174",
                "latitude": "51.0543",
                "selectedModel": "unrealsim.pt"
            })
        );
    }

    #[test]
    fn frame_meta_with_unknown_context() {
        let meta = FrameMeta::new(1, 0, &FrameContext::default(), "m");
        assert_eq!(meta.latency_ms, "");
        assert_eq!(meta.longitude, "");
        assert_eq!(meta.latitude, "");
    }

    #[test]
    fn location_and_setting_shapes() {
        let fix = LocationFix::new(51.5, -0.12, 8.0);
        let location = OutboundMessage::Location(LocationReport::new(&fix, 1000)).to_json().unwrap();
        let value: Value = serde_json::from_str(&location).unwrap();
        assert_eq!(value, json!({"type": "location", "lat": 51.5, "lon": -0.12, "accuracy_m": 8.0, "ts": 1000}));

        let setting = OutboundMessage::Setting(SettingChange { selected_model: "yolo.pt".into() })
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&setting).unwrap();
        assert_eq!(value, json!({"type": "Setting", "selectedModel": "yolo.pt"}));
    }

    #[test]
    fn stats_shape() {
        let context = FrameContext::new(Some(Duration::from_millis(120)), None);
        let stats = OutboundMessage::Stats(StatsReport::new(&context)).to_json().unwrap();
        let value: Value = serde_json::from_str(&stats).unwrap();
        assert_eq!(value, json!({"type": "stats", "latency": "120", "longitude": "", "latitude": ""}));
    }

    #[test]
    fn feedback_with_and_without_frame_id() {
        assert_eq!(
            Feedback::parse(r#"{"heading": 87.12, "frame_id": 123}"#),
            Some(Feedback { heading: 87.12, frame_id: Some(123) })
        );
        assert_eq!(Feedback::parse(r#"{"heading": 90}"#), Some(Feedback { heading: 90.0, frame_id: None }));
        assert_eq!(
            Feedback::parse(r#"{"heading": 10.5, "frame_id": "abc"}"#),
            Some(Feedback { heading: 10.5, frame_id: None })
        );
    }

    #[test]
    fn non_feedback_messages_are_ignored() {
        assert_eq!(Feedback::parse("not json"), None);
        assert_eq!(Feedback::parse("[1, 2, 3]"), None);
        assert_eq!(Feedback::parse(r#"{"type": "location", "lat": 1.0}"#), None);
        assert_eq!(Feedback::parse(r#"{"heading": "north"}"#), None);
    }

    #[test]
    fn feedback_coerces_loose_numbers() {
        assert_eq!(
            Feedback::parse(r#"{"heading": "87.5", "frame_id": 123.0}"#),
            Some(Feedback { heading: 87.5, frame_id: Some(123) })
        );
        assert_eq!(
            Feedback::parse(r#"{"heading": 45, "frame_id": "7"}"#),
            Some(Feedback { heading: 45.0, frame_id: Some(7) })
        );
        assert_eq!(
            Feedback::parse(r#"{"heading": 45, "frame_id": 12.5}"#),
            Some(Feedback { heading: 45.0, frame_id: None })
        );
        assert_eq!(
            Feedback::parse(r#"{"heading": 45, "frame_id": -1}"#),
            Some(Feedback { heading: 45.0, frame_id: None })
        );
    }
}
