//! Frame identity and per-frame context

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Identifier assigned to a frame at send time.
///
/// Strictly increasing for the lifetime of an uplink, starting at 1, never reused.
pub type FrameId = u64;

/// A geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// A location fix as reported by the device location service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Position of the fix
    pub position: GeoPoint,
    /// Horizontal accuracy radius in meters
    pub accuracy_m: f32,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f32) -> Self {
        Self { position: GeoPoint::new(latitude, longitude), accuracy_m }
    }
}

/// Auxiliary values embedded in a frame's metadata envelope.
///
/// Always the most recently known values; they are never recomputed per frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameContext {
    /// Last measured round-trip latency, if any response has been matched yet
    pub latency: Option<Duration>,
    /// Last known device location
    pub location: Option<GeoPoint>,
    /// Processing model for this frame; the configured model when `None`
    pub selected_model: Option<String>,
}

impl FrameContext {
    pub fn new(latency: Option<Duration>, location: Option<GeoPoint>) -> Self {
        Self { latency, location, selected_model: None }
    }

    /// Request a specific processing model for this frame.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.selected_model = Some(model.into());
        self
    }
}

/// Record of a frame that was handed to the transport.
#[derive(Debug, Clone)]
pub struct SentFrame {
    /// Assigned frame identifier
    pub id: FrameId,
    /// Payload as transmitted (already clamped to the size limit)
    pub payload: Bytes,
    /// Monotonic instant at which the transport accepted the payload
    pub sent_at: Instant,
}

impl SentFrame {
    /// Number of payload bytes transmitted
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
