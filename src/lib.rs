//! Rate-limited camera frame uplink over a persistent WebSocket.
//!
//! `ipcam-uplink` pushes encoded camera frames to a remote signaling server
//! at a bounded rate, streams location and settings telemetry over the same
//! link, and correlates the server's heading feedback with the frame that
//! caused it to measure round-trip latency.
//!
//! # Features
//!
//! - **Freshest frame wins**: at most one frame in flight, stale frames are dropped, never queued
//! - **Self-healing link**: fixed-delay reconnect, keepalive pings, clean shutdown
//! - **Latency correlation**: concurrent pending-frame ledger keyed by frame id
//! - **Non-blocking**: `submit` returns immediately from any thread
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use ipcam_uplink::{Uplink, UplinkConfig, UplinkEvent};
//!
//! #[tokio::main]
//! async fn main() -> ipcam_uplink::Result<()> {
//!     let config = UplinkConfig::from_path("uplink.yaml")?;
//!     let uplink = Uplink::start(config)?;
//!
//!     let mut events = Box::pin(uplink.events());
//!     tokio::spawn(async move {
//!         while let Some(event) = events.next().await {
//!             if let UplinkEvent::DirectionChanged(direction) = event {
//!                 println!("steer {:?}", direction);
//!             }
//!         }
//!     });
//!
//!     // Called from the camera callback for every encoded frame
//!     uplink.submit_frame(vec![0xFF, 0xD8, 0xFF, 0xD9]);
//!
//!     uplink.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod protocol;
#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;
pub mod types;

// Link management
pub mod connection;
pub mod transport;
pub mod transports;

// Upload pipeline
pub mod events;
pub mod feedback;
pub mod ledger;
pub mod scheduler;
pub mod throttle;
mod uplink;

// Core exports
pub use error::*;
pub use types::*;

pub use config::{Settings, UplinkConfig};
pub use events::{UplinkEvent, UplinkStatus};
pub use feedback::Direction;
pub use ledger::{HeadingUpdate, PendingLedger};
pub use scheduler::{DropCounts, DropReason, SubmitOutcome};
pub use transport::Transport;
pub use uplink::Uplink;

#[cfg(feature = "websocket")]
pub use transports::WebSocketTransport;
