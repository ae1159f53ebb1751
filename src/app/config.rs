use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const DEFAULT_PERFETTO_CMD: &str = "perfetto";
pub const DEFAULT_TRACE_DEVICE_DIR: &str = "/data/misc/perfetto-traces";
pub const DEFAULT_TRACE_EXTENSION: &str = "pftrace";
pub const MIN_STOP_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    pub command_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            command_timeout_secs: 10,
            transfer_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerfettoSettings {
    pub command: String,
    pub trace_device_dir: String,
    pub trace_extension: String,
    pub stop_poll_interval_ms: u64,
    /// Upper bound on how long a signalled session may take to exit.
    /// Zero waits indefinitely.
    pub stop_timeout_secs: u64,
}

impl Default for PerfettoSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_PERFETTO_CMD.to_string(),
            trace_device_dir: DEFAULT_TRACE_DEVICE_DIR.to_string(),
            trace_extension: DEFAULT_TRACE_EXTENSION.to_string(),
            stop_poll_interval_ms: MIN_STOP_POLL_INTERVAL_MS,
            stop_timeout_secs: 60,
        }
    }
}

impl PerfettoSettings {
    /// Device trace directory without a trailing slash.
    pub fn remote_dir(&self) -> &str {
        let trimmed = self.trace_device_dir.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(MIN_STOP_POLL_INTERVAL_MS))
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        if self.stop_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stop_timeout_secs))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectSettings {
    pub delete_after_transfer: bool,
}

impl Default for CollectSettings {
    fn default() -> Self {
        Self {
            delete_after_transfer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub perfetto: PerfettoSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub collect: CollectSettings,
    /// Host directory receiving `<serial>/<trace>` files. Filled from the CLI.
    #[serde(default)]
    pub output_dir: String,
    /// Perfetto TraceConfig streamed to the device on start. Filled from the CLI.
    #[serde(default)]
    pub trace_config_path: String,
}

impl FleetConfig {
    pub fn output_dir(&self) -> PathBuf {
        let trimmed = self.output_dir.trim();
        let without_slash = trimmed.trim_end_matches('/');
        if without_slash.is_empty() && trimmed.starts_with('/') {
            PathBuf::from("/")
        } else {
            PathBuf::from(without_slash)
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TRACE_FLEET_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trace_fleet_config.json")
}

pub fn load_config(explicit: Option<&Path>) -> Result<FleetConfig, AppError> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(AppError::config(
                    format!("Config file not found: {}", path.display()),
                    "",
                ));
            }
            load_config_from_path(path)
        }
        None => load_config_from_path(&config_path()),
    }
}

pub fn load_config_from_path(path: &Path) -> Result<FleetConfig, AppError> {
    if !path.exists() {
        return Ok(FleetConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::config(format!("Failed to read config: {err}"), ""))?;
    let config: FleetConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::config(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

fn validate_config(mut config: FleetConfig) -> FleetConfig {
    let defaults = FleetConfig::default();
    if config.adb.command_timeout_secs == 0 {
        config.adb.command_timeout_secs = defaults.adb.command_timeout_secs;
    }
    if config.adb.transfer_timeout_secs == 0 {
        config.adb.transfer_timeout_secs = defaults.adb.transfer_timeout_secs;
    }
    if config.perfetto.command.trim().is_empty() {
        config.perfetto.command = defaults.perfetto.command;
    }
    if config.perfetto.trace_device_dir.trim().is_empty() {
        config.perfetto.trace_device_dir = defaults.perfetto.trace_device_dir;
    }
    let extension = config.perfetto.trace_extension.trim().trim_start_matches('.');
    config.perfetto.trace_extension = if extension.is_empty() {
        defaults.perfetto.trace_extension
    } else {
        extension.to_string()
    };
    if config.perfetto.stop_poll_interval_ms < MIN_STOP_POLL_INTERVAL_MS {
        config.perfetto.stop_poll_interval_ms = MIN_STOP_POLL_INTERVAL_MS;
    }
    if config.monitor.poll_interval_ms < 100 {
        config.monitor.poll_interval_ms = defaults.monitor.poll_interval_ms;
    }
    config
}

/// Checks the fields the device manager cannot run without.
pub fn validate_for_device_manager(config: &FleetConfig) -> Result<(), AppError> {
    if config.output_dir.trim().is_empty() {
        return Err(AppError::config("traces directory is required", ""));
    }
    if config.trace_config_path.trim().is_empty() {
        return Err(AppError::config("perfetto config file is required", ""));
    }
    Ok(())
}
