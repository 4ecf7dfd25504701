//! Transport configuration.
//!
//! All durations are milliseconds so the struct maps one-to-one onto a JSON
//! file. `None` disables the corresponding timer.
//!
//! ```
//! use igtlink_transport::TransportConfig;
//!
//! let config = TransportConfig::from_json_str(r#"{ "connect_timeout_ms": 1500 }"#).unwrap();
//! assert_eq!(config.connect_timeout_ms, 1500);
//! assert_eq!(config.keep_alive_interval_ms, Some(1000));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default connect timeout (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default keep-alive interval (ms).
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 1000;

/// Default inactivity threshold (ms).
pub const DEFAULT_NO_INCOMING_DATA_MS: u64 = 5000;

/// Default upper bound on a declared body length (256 MB).
pub const DEFAULT_MAX_BODY_LENGTH: u64 = 256 * 1024 * 1024;

/// Default outbound queue capacity per connection.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default socket read buffer (64 KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default capacity of the application-facing event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Recognized transport options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connect timeout for outbound connections.
    pub connect_timeout_ms: u64,
    /// Send a heartbeat when nothing was written for this long.
    pub keep_alive_interval_ms: Option<u64>,
    /// Report `NoIncomingData` when nothing was read for this long.
    pub no_incoming_data_ms: Option<u64>,
    /// Sanity bound on declared body lengths.
    pub max_body_length: u64,
    /// Outbound queue capacity per connection.
    pub channel_capacity: usize,
    /// Size of the per-connection read buffer.
    pub read_buffer_size: usize,
    /// Events beyond this many undrained ones are dropped.
    pub event_queue_capacity: usize,
    /// Device name stamped on outgoing heartbeats.
    pub device_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            keep_alive_interval_ms: Some(DEFAULT_KEEP_ALIVE_INTERVAL_MS),
            no_incoming_data_ms: Some(DEFAULT_NO_INCOMING_DATA_MS),
            max_body_length: DEFAULT_MAX_BODY_LENGTH,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            device_name: String::new(),
        }
    }
}

impl TransportConfig {
    /// Defaults for accepted server connections: no keep-alive, no
    /// inactivity reporting.
    pub fn server_default() -> Self {
        Self {
            keep_alive_interval_ms: None,
            no_incoming_data_ms: None,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keep-alive interval, if enabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_ms.map(Duration::from_millis)
    }

    /// Inactivity threshold, if enabled.
    pub fn no_incoming_data_threshold(&self) -> Option<Duration> {
        self.no_incoming_data_ms.map(Duration::from_millis)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
