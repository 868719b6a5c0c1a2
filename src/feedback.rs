//! Heading feedback interpretation
//!
//! The server answers frames with a heading in degrees where 0 points right
//! and 90 points straight ahead. The presentation layer turns that into a
//! coarse left/forward/right cue, using a tolerance expressed as a percentage
//! of 90 degrees.

use serde::{Deserialize, Serialize};

use crate::config::MAX_HEADING_TOLERANCE_PCT;

/// Heading that means "straight ahead".
pub const FORWARD_HEADING: f64 = 90.0;

/// Coarse steering cue derived from a heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Forward,
    Right,
}

impl Direction {
    /// Classify `heading` with a tolerance of `tolerance_pct` percent of 90°.
    ///
    /// The tolerance is clamped to 0..=40. Headings at or below `90 - tol`
    /// are `Right`, at or above `90 + tol` are `Left`, the band in between is
    /// `Forward`.
    pub fn from_heading(heading: f64, tolerance_pct: u8) -> Self {
        let tolerance = tolerance_degrees(tolerance_pct);
        if heading <= FORWARD_HEADING - tolerance {
            Direction::Right
        } else if heading >= FORWARD_HEADING + tolerance {
            Direction::Left
        } else {
            Direction::Forward
        }
    }
}

/// Width of half the forward band in degrees.
pub fn tolerance_degrees(tolerance_pct: u8) -> f64 {
    FORWARD_HEADING * f64::from(tolerance_pct.min(MAX_HEADING_TOLERANCE_PCT)) / 100.0
}

/// Reports a direction only when it differs from the previous one.
#[derive(Debug, Default)]
pub struct DirectionTracker {
    last: Option<Direction>,
}

impl DirectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a new direction; returns it if it changed.
    pub fn observe(&mut self, direction: Direction) -> Option<Direction> {
        if self.last == Some(direction) {
            return None;
        }
        self.last = Some(direction);
        Some(direction)
    }

    pub fn current(&self) -> Option<Direction> {
        self.last
    }
}
