//! Core types shared across the uplink.
//!
//! - [`FrameId`] identifies a transmitted frame; responses carry it back
//! - [`FrameContext`] holds the latest latency/location values embedded in envelopes
//! - [`SentFrame`] records a frame the transport accepted
//! - [`ConnectionState`] tracks the lifecycle of the single logical connection

mod frame;
mod state;

pub use frame::{FrameContext, FrameId, GeoPoint, LocationFix, SentFrame};
pub use state::ConnectionState;
