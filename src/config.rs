//! Daemon settings.
//!
//! Loaded from an optional YAML file, with environment-variable overrides
//! for the few tunables that matter at deploy time. Defaults put all state
//! under `~/.activity-agent/`.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override for the reconciliation tick interval (seconds).
pub const ENV_TICK_SECS: &str = "ACTIVITY_AGENT_TICK_SECS";
/// Environment override for the activity snapshot path.
pub const ENV_DATA_PATH: &str = "ACTIVITY_AGENT_DATA_PATH";
/// Environment override for the reference timezone.
pub const ENV_TZ: &str = "ACTIVITY_AGENT_TZ";
/// Environment override for the event socket path.
pub const ENV_SOCKET: &str = "ACTIVITY_AGENT_SOCKET";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Path of the activity JSON snapshot.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Seconds between reconciliation ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Reference timezone naive timestamps are interpreted in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Path of the subscriber event socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".activity-agent")
}

fn default_data_path() -> PathBuf {
    data_dir().join("activities.json")
}

fn default_tick_secs() -> u64 {
    crate::scheduler::DEFAULT_TICK_SECS
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_socket_path() -> PathBuf {
    data_dir().join("events.sock")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            tick_secs: default_tick_secs(),
            timezone: default_timezone(),
            socket_path: default_socket_path(),
        }
    }
}

impl Settings {
    /// Loads settings from a YAML file, then applies env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut settings: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Default settings with env overrides applied (no config file).
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Some(secs) = std::env::var(ENV_TICK_SECS)
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.tick_secs = secs;
        }
        if let Ok(path) = std::env::var(ENV_DATA_PATH) {
            self.data_path = PathBuf::from(path);
        }
        if let Ok(tz) = std::env::var(ENV_TZ) {
            self.timezone = tz;
        }
        if let Ok(path) = std::env::var(ENV_SOCKET) {
            self.socket_path = PathBuf::from(path);
        }
    }

    /// Parses the configured reference timezone.
    pub fn reference_tz(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", self.timezone, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.tick_secs, 60);
        assert_eq!(settings.timezone, "UTC");
        assert!(settings.data_path.ends_with(".activity-agent/activities.json"));
    }

    #[test]
    fn test_load_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "tick_secs: 5\ntimezone: Europe/Warsaw\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.tick_secs, 5);
        assert_eq!(settings.timezone, "Europe/Warsaw");
        assert!(settings.data_path.ends_with("activities.json"));
    }

    #[test]
    fn test_reference_tz_parses_and_rejects() {
        let mut settings = Settings::default();
        assert_eq!(settings.reference_tz().unwrap(), chrono_tz::UTC);

        settings.timezone = "Europe/Warsaw".to_string();
        assert!(settings.reference_tz().is_ok());

        settings.timezone = "Not/AZone".to_string();
        assert!(settings.reference_tz().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_win() {
        std::env::set_var(ENV_TICK_SECS, "7");
        std::env::set_var(ENV_TZ, "America/New_York");

        let settings = Settings::from_env();
        assert_eq!(settings.tick_secs, 7);
        assert_eq!(settings.timezone, "America/New_York");

        std::env::remove_var(ENV_TICK_SECS);
        std::env::remove_var(ENV_TZ);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(Settings::load(Path::new("/nonexistent/config.yaml")).is_err());
    }
}
