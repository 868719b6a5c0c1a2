//! Connection lifecycle
//!
//! A single [`ConnectionManager`] owns the link to the signaling server. It
//! connects on demand, reconnects with a fixed delay after failures, keeps
//! the link alive with pings, and hands inbound text to its owner through a
//! bounded channel.

mod manager;

pub use manager::{CLOSE_TIMEOUT, ConnectionManager, ConnectionOptions, INBOUND_CAPACITY};
