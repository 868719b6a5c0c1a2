//! Error types for the frame uplink.
//!
//! Almost nothing in the upload path surfaces an error to its caller: frames
//! are dropped and the connection heals itself. Errors exist for the places
//! where a caller can act on them (construction, configuration loading) and
//! as internal plumbing between the transport and the components that log
//! and absorb failures.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: the endpoint could not be reached or the link died
//! - **Transport Errors**: a write on an open link failed
//! - **Configuration Errors**: unreadable or invalid configuration
//! - **Protocol Errors**: messages that could not be encoded
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use ipcam_uplink::UplinkError;
//!
//! let error = UplinkError::connection_failed("connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for uplink operations.
pub type Result<T, E = UplinkError> = std::result::Result<T, E>;

/// Main error type for uplink operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UplinkError {
    #[error("Failed to connect: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connection is not open")]
    NotConnected,

    #[error("Transport operation failed: {operation}")]
    Transport {
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration file error: {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {details}")]
    Config { details: String },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Message serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("No async runtime available: {details}")]
    Runtime { details: String },

    #[error("Uplink has been shut down")]
    ShutDown,
}

impl UplinkError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            UplinkError::Connection { .. } => true,
            UplinkError::NotConnected => true,
            UplinkError::Transport { .. } => true,
            UplinkError::Timeout { .. } => true,
            UplinkError::ConfigFile { .. } => false,
            UplinkError::Config { .. } => false,
            UplinkError::Parse { .. } => false,
            UplinkError::Serialization(_) => false,
            UplinkError::Runtime { .. } => false,
            UplinkError::ShutDown => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            UplinkError::Connection { .. } => vec![
                "Check that the signaling server is running",
                "Verify the ws:// or wss:// URL and port",
                "Check network connectivity from the device",
            ],
            UplinkError::NotConnected => vec![
                "Wait for the automatic reconnect to complete",
                "Drop the frame and retry with a newer one",
            ],
            UplinkError::Transport { .. } => vec![
                "Let the connection manager reconnect",
                "Check for proxies that cut idle WebSocket connections",
            ],
            UplinkError::ConfigFile { .. } => vec![
                "Check the configuration file exists and is readable",
                "Check file permissions",
            ],
            UplinkError::Config { .. } => vec![
                "Fix the reported configuration value",
                "Remove the field to fall back to its default",
            ],
            UplinkError::Parse { .. } => vec![
                "Check the YAML syntax of the configuration",
                "Verify field names and value types",
            ],
            UplinkError::Serialization(_) => vec![
                "Check telemetry values are finite numbers",
                "Report the failing message shape as a bug",
            ],
            UplinkError::Timeout { .. } => vec![
                "Increase the timeout duration",
                "Check server responsiveness",
            ],
            UplinkError::Runtime { .. } => vec![
                "Create the uplink from inside a tokio runtime",
                "Enable the tokio `rt` feature in the host application",
            ],
            UplinkError::ShutDown => vec![
                "Create a new uplink after shutdown",
                "Stop submitting frames once shutdown has been requested",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        UplinkError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        UplinkError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for transport write/close failures.
    pub fn transport_failed(
        operation: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        UplinkError::Transport { operation: operation.into(), source: Some(source) }
    }

    /// Helper constructor for configuration validation errors.
    pub fn config_invalid(details: impl Into<String>) -> Self {
        UplinkError::Config { details: details.into() }
    }

    /// Helper constructor for configuration file errors with path context.
    pub fn config_file_error(path: PathBuf, source: std::io::Error) -> Self {
        UplinkError::ConfigFile { path, source }
    }
}

impl From<serde_yaml_ng::Error> for UplinkError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        UplinkError::Parse { context: "configuration YAML".to_string(), details: err.to_string() }
    }
}
