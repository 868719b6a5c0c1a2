//! Connection lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the single logical connection owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection and no attempt in progress
    #[default]
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// The link is open and writable
    Open,
    /// Shutdown is closing the link
    Closing,
}

impl ConnectionState {
    /// True while a connect attempt is running or the link is open.
    pub fn is_connecting_or_open(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }

    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}
