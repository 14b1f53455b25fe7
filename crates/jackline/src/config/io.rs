//! Reading and writing client and loopback settings as YAML
//!
//! ```text
//!   file ──read──► serde_yaml ──► ConfigFile::settle() ──► config
//!     │ missing / unreadable / invalid
//!     └───────────────────────────────────────────────────► T::default()
//! ```
//!
//! Loading never fails: a client should still come up with stock settings
//! when its file is broken. Saving reports errors.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ClientConfig, LoopbackConfig, MAX_BUFFER_SIZE};

/// A settings type stored in its own YAML file
pub trait ConfigFile: Serialize + DeserializeOwned + Default {
    /// Used in log lines, e.g. "client settings"
    const WHAT: &'static str;

    /// Pull values the server could not honor back into range
    fn settle(self) -> Self {
        self
    }
}

impl ConfigFile for ClientConfig {
    const WHAT: &'static str = "client settings";

    fn settle(mut self) -> Self {
        if self.name.is_empty() || self.name.contains(':') {
            log::warn!("client settings: unusable name '{}', using default", self.name);
            self.name = ClientConfig::default().name;
        }
        self
    }
}

impl ConfigFile for LoopbackConfig {
    const WHAT: &'static str = "loopback settings";

    fn settle(mut self) -> Self {
        let defaults = LoopbackConfig::default();
        if self.sample_rate == 0 {
            log::warn!("loopback settings: sample rate 0, using {}", defaults.sample_rate);
            self.sample_rate = defaults.sample_rate;
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            log::warn!(
                "loopback settings: cycle of {} frames out of range, using {}",
                self.buffer_size,
                defaults.buffer_size
            );
            self.buffer_size = defaults.buffer_size;
        }
        self
    }
}

/// Load settings from `path`, falling back to defaults
///
/// ```ignore
/// let config: ClientConfig = load_config(Path::new("client.yaml"));
/// ```
pub fn load_config<T: ConfigFile>(path: &Path) -> T {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!("no {} at {:?}; using defaults", T::WHAT, path);
            return T::default();
        }
        Err(e) => {
            log::warn!("cannot read {} from {:?}: {}; using defaults", T::WHAT, path, e);
            return T::default();
        }
    };
    match serde_yaml::from_str::<T>(&contents) {
        Ok(config) => {
            log::info!("{} loaded from {:?}", T::WHAT, path);
            config.settle()
        }
        Err(e) => {
            log::warn!("{} in {:?} are invalid: {}; using defaults", T::WHAT, path, e);
            T::default()
        }
    }
}

/// Write settings to `path`, creating parent directories
pub fn save_config<T: ConfigFile>(config: &T, path: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(config).with_context(|| format!("encoding {}", T::WHAT))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {:?} for {}", parent, T::WHAT))?;
    }
    std::fs::write(path, yaml).with_context(|| format!("writing {} to {:?}", T::WHAT, path))?;
    log::info!("{} saved to {:?}", T::WHAT, path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config: ClientConfig = load_config(Path::new("/nonexistent/path/client.yaml"));
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_invalid_yaml_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "sample_rate: [not, a, number").unwrap();

        let config: LoopbackConfig = load_config(&path);
        assert_eq!(config, LoopbackConfig::default());
    }

    #[test]
    fn test_out_of_range_values_are_settled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "sample_rate: 0\nbuffer_size: 65536\nrealtime: true\n").unwrap();

        let config: LoopbackConfig = load_config(&path);
        assert_eq!(config.sample_rate, LoopbackConfig::default().sample_rate);
        assert_eq!(config.buffer_size, LoopbackConfig::default().buffer_size);
        assert!(config.realtime);

        std::fs::write(&path, "name: \"deck:1\"\nauto_activate: true\n").unwrap();
        let client: ClientConfig = load_config(&path);
        assert_eq!(client.name, ClientConfig::default().name);
        assert!(client.auto_activate);
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/client.yaml");

        let config = ClientConfig {
            name: "recorder".to_string(),
            use_exact_name: true,
            sync_timeout_us: Some(500_000),
            ..Default::default()
        };

        save_config(&config, &path).unwrap();
        let loaded: ClientConfig = load_config(&path);
        assert_eq!(loaded, config);
    }
}
