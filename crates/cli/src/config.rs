//! usb-perf configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use streamer::config::{DEFAULT_QUEUE_DEPTH, DEFAULT_REQUEST_SIZE};
use streamer::device::{DeviceFilter, KnownDevice};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Devices of interest; empty means every attached device
    #[serde(default = "PerfConfig::default_devices")]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// A device of interest
///
/// # Example Configuration
/// ```toml
/// [[devices]]
/// filter = "0x04b4:0x00f1"
/// description = "Cypress FX3"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// VID:PID pattern, e.g. "0x04b4:0x00f1" or "0x04b4:*"
    pub filter: String,
    #[serde(default)]
    pub description: String,
}

/// Defaults for the performance test, overridable on the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Packets (or bursts) per request
    #[serde(default = "StreamSettings::default_request_size")]
    pub request_size: usize,
    /// Requests kept in flight
    #[serde(default = "StreamSettings::default_queue_depth")]
    pub queue_depth: usize,
    /// Test duration in seconds (0 = until interrupted)
    #[serde(default = "StreamSettings::default_duration")]
    pub duration_secs: u64,
    #[serde(default = "StreamSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    #[serde(default = "StreamSettings::default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            request_size: Self::default_request_size(),
            queue_depth: Self::default_queue_depth(),
            duration_secs: Self::default_duration(),
            transfer_timeout_ms: Self::default_transfer_timeout(),
            refresh_interval_ms: Self::default_refresh_interval(),
        }
    }
}

impl StreamSettings {
    fn default_request_size() -> usize {
        DEFAULT_REQUEST_SIZE
    }

    fn default_queue_depth() -> usize {
        DEFAULT_QUEUE_DEPTH
    }

    fn default_duration() -> u64 {
        100
    }

    fn default_transfer_timeout() -> u64 {
        5000
    }

    fn default_refresh_interval() -> u64 {
        1000
    }

    /// Test duration, `None` when the test runs until interrupted
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            devices: Self::default_devices(),
            stream: StreamSettings::default(),
        }
    }
}

impl PerfConfig {
    fn default_devices() -> Vec<DeviceEntry> {
        [
            ("0x04b4:0x8613", "Cypress FX2LP"),
            ("0x04b4:0x00f1", "Cypress FX3"),
            ("0x04b4:0x00f3", "Cypress FX3 bootloader"),
        ]
        .into_iter()
        .map(|(filter, description)| DeviceEntry {
            filter: filter.to_string(),
            description: description.to_string(),
        })
        .collect()
    }

    /// Load configuration from file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-perf/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: PerfConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-perf").join("config.toml")
        } else {
            PathBuf::from(".config/usb-perf/config.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        for entry in &self.devices {
            Self::validate_filter(&entry.filter)?;
        }

        let stream = &self.stream;
        for (name, value) in [
            ("request_size", stream.request_size as u64),
            ("queue_depth", stream.queue_depth as u64),
            ("transfer_timeout_ms", stream.transfer_timeout_ms),
            ("refresh_interval_ms", stream.refresh_interval_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("stream.{} must be greater than zero", name));
            }
        }

        Ok(())
    }

    fn validate_filter(filter: &str) -> Result<DeviceFilter> {
        filter
            .parse::<DeviceFilter>()
            .with_context(|| format!("Invalid device filter in configuration: {}", filter))
    }

    /// Devices of interest as discovery filters
    pub fn known_devices(&self) -> Result<Vec<KnownDevice>> {
        self.devices
            .iter()
            .map(|entry| {
                Ok(KnownDevice::new(
                    Self::validate_filter(&entry.filter)?,
                    entry.description.clone(),
                ))
            })
            .collect()
    }
}

/// Load configuration from a path, with tilde expansion
pub fn load_config(path: &str) -> Result<PerfConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    PerfConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = PerfConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.stream.request_size, 16);
        assert_eq!(config.stream.queue_depth, 16);
        assert_eq!(config.stream.duration(), Some(Duration::from_secs(100)));
        assert_eq!(config.stream.transfer_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(PerfConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(PerfConfig::validate_filter("0x1234:*").is_ok());
        assert!(PerfConfig::validate_filter("*:0x5678").is_ok());
        assert!(PerfConfig::validate_filter("*:*").is_ok());
        assert!(PerfConfig::validate_filter("04b4:00f1").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(PerfConfig::validate_filter("0x1234").is_err());
        assert!(PerfConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(PerfConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(PerfConfig::validate_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PerfConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = PerfConfig::default();
        config.stream.queue_depth = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_depth"));
    }

    #[test]
    fn test_zero_duration_runs_until_interrupted() {
        let settings = StreamSettings {
            duration_secs: 0,
            ..StreamSettings::default()
        };
        assert_eq!(settings.duration(), None);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: PerfConfig = toml::from_str("[logging]\nlevel = \"debug\"\n").unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.devices, PerfConfig::default_devices());
        assert_eq!(config.stream, StreamSettings::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = PerfConfig::default();
        config.stream.queue_depth = 64;
        config.save(&path).unwrap();

        let loaded = PerfConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[[devices]]\nfilter = \"nonsense\"\n").unwrap();

        assert!(PerfConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_known_devices() {
        let known = PerfConfig::default().known_devices().unwrap();
        assert_eq!(known.len(), 3);
        assert!(known[1].filter.matches(0x04b4, 0x00f1));
        assert_eq!(known[1].description, "Cypress FX3");
    }
}
