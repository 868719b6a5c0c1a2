//! Uplink configuration
//!
//! [`UplinkConfig`] is the full startup configuration, loadable from YAML.
//! [`Settings`] is the subset that can change while the uplink runs; it is
//! published through a watch channel and read fresh for every frame.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Result, UplinkError};

/// Largest accepted heading tolerance, in percent of 90 degrees.
pub const MAX_HEADING_TOLERANCE_PCT: u8 = 40;

/// Default frame size ceiling (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default processing model requested from the server.
pub const DEFAULT_MODEL: &str = "unrealsim.pt";

/// Startup configuration for an [`Uplink`](crate::Uplink).
///
/// ```rust
/// use ipcam_uplink::UplinkConfig;
///
/// let config = UplinkConfig::from_yaml_str(r#"
/// url: ws://192.168.1.20:9000
/// min_interval_ms: 250
/// selected_model: yolov8n.pt
/// "#).unwrap();
///
/// assert_eq!(config.min_interval_ms, 250);
/// assert_eq!(config.heading_tolerance_pct, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Signaling server endpoint (`ws://` or `wss://`)
    pub url: String,
    /// Minimum time between two successful frame sends
    pub min_interval_ms: u64,
    /// Heading tolerance for the direction cue, clamped to 0..=40
    #[serde(deserialize_with = "deserialize_tolerance")]
    pub heading_tolerance_pct: u8,
    /// Frames larger than this are dropped at submission
    pub max_frame_bytes: usize,
    /// Processing model identifier sent with every frame
    pub selected_model: String,
    /// Fixed delay before an automatic reconnect
    pub reconnect_delay_ms: u64,
    /// Keepalive ping interval; 0 disables pings
    pub ping_interval_secs: u64,
    /// Age after which unanswered frames are evicted; `None` keeps them forever
    pub pending_ttl_ms: Option<u64>,
    /// Buffer size of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            min_interval_ms: 200,
            heading_tolerance_pct: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            selected_model: DEFAULT_MODEL.to_string(),
            reconnect_delay_ms: 1000,
            ping_interval_secs: 15,
            pending_ttl_ms: Some(30_000),
            event_capacity: 64,
        }
    }
}

impl UplinkConfig {
    /// Default configuration pointing at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: UplinkConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| UplinkError::config_file_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Check the configuration for values the uplink cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(UplinkError::config_invalid("url must not be empty"));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(UplinkError::config_invalid(format!(
                "url '{}' must use the ws:// or wss:// scheme",
                url
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(UplinkError::config_invalid("max_frame_bytes must be greater than 0"));
        }
        if self.event_capacity == 0 {
            return Err(UplinkError::config_invalid("event_capacity must be greater than 0"));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Keepalive interval, or `None` when pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    pub fn pending_ttl(&self) -> Option<Duration> {
        self.pending_ttl_ms.map(Duration::from_millis)
    }

    /// The hot-reloadable subset of this configuration.
    pub fn settings(&self) -> Settings {
        Settings {
            min_interval: Duration::from_millis(self.min_interval_ms),
            heading_tolerance_pct: clamp_tolerance(i64::from(self.heading_tolerance_pct)),
            max_frame_bytes: self.max_frame_bytes,
            selected_model: self.selected_model.clone(),
        }
    }
}

/// Settings that can change while the uplink is running.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Minimum spacing between successful sends
    pub min_interval: Duration,
    /// Direction cue tolerance (0..=40)
    pub heading_tolerance_pct: u8,
    /// Frame size ceiling in bytes
    pub max_frame_bytes: usize,
    /// Processing model identifier
    pub selected_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        UplinkConfig::default().settings()
    }
}

/// Accept any integer and clamp it, so out-of-range values still load.
fn deserialize_tolerance<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(clamp_tolerance(raw))
}

/// Clamp a raw tolerance value into `0..=MAX_HEADING_TOLERANCE_PCT`.
pub fn clamp_tolerance(pct: i64) -> u8 {
    pct.clamp(0, i64::from(MAX_HEADING_TOLERANCE_PCT)) as u8
}
