//! Client and loopback server configuration
//!
//! Both configurations are plain serde structs stored as YAML. Missing
//! fields take their defaults, so a config file only needs the settings it
//! changes:
//!
//! ```yaml
//! name: recorder
//! use_exact_name: true
//! sync_timeout_us: 500000
//! ```

mod io;

use serde::{Deserialize, Serialize};

use crate::types::{Frames, Time};

pub use io::{load_config, save_config, ConfigFile};

/// Default sample rate of the loopback server (48kHz)
pub const DEFAULT_SAMPLE_RATE: Frames = 48_000;

/// Default cycle length of the loopback server (frames)
pub const DEFAULT_BUFFER_SIZE: Frames = 1024;

/// Largest cycle length a server accepts (frames)
pub const MAX_BUFFER_SIZE: Frames = 8192;

/// Default slow-sync timeout: two seconds
pub const DEFAULT_SYNC_TIMEOUT_US: Time = 2_000_000;

/// Settings for opening a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    /// Fail instead of renaming when the name is taken
    pub use_exact_name: bool,
    /// Fail instead of starting a server that is not running
    pub no_start_server: bool,
    /// Server to connect to; `None` selects the default server
    pub server_name: Option<String>,
    pub session_id: Option<String>,
    /// Slow-sync timeout applied after open, in microseconds
    pub sync_timeout_us: Option<Time>,
    /// Activate right after open
    pub auto_activate: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            name: "jackline".to_string(),
            use_exact_name: false,
            no_start_server: false,
            server_name: None,
            session_id: None,
            sync_timeout_us: None,
            auto_activate: false,
        }
    }
}

/// Settings of the in-process loopback server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Server name clients can select with `server_name`
    pub name: String,
    pub sample_rate: Frames,
    pub buffer_size: Frames,
    /// Reported by `Client::is_realtime`
    pub realtime: bool,
    pub sync_timeout_us: Time,
    /// Report an xrun when a cycle takes longer than its period
    pub detect_xruns: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            name: "default".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            realtime: false,
            sync_timeout_us: DEFAULT_SYNC_TIMEOUT_US,
            detect_xruns: false,
        }
    }
}

impl LoopbackConfig {
    /// Microseconds per cycle at the configured rate
    pub fn period_usecs(&self) -> Time {
        self.buffer_size as Time * 1_000_000 / self.sample_rate.max(1) as Time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: LoopbackConfig = serde_yaml::from_str("buffer_size: 256\n").unwrap();
        assert_eq!(config.buffer_size, 256);
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.sync_timeout_us, DEFAULT_SYNC_TIMEOUT_US);
    }

    #[test]
    fn test_period() {
        let config = LoopbackConfig {
            sample_rate: 50_000,
            buffer_size: 1000,
            ..Default::default()
        };
        assert_eq!(config.period_usecs(), 20_000);
    }
}
