//! Configuration loading and validation

use anyhow::Result;
use rigbridge_core::ScaleOffsets;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub scale: ScaleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the session and status server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Pose update interval in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl DaemonConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

fn default_bind() -> String {
    "0.0.0.0:9002".to_string()
}

fn default_tick_interval() -> u64 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of simulated input devices
    #[serde(default = "default_inputs")]
    pub inputs: usize,
    /// Drive the device's standard rig until a user rig is imported
    #[serde(default)]
    pub standard_rig: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            inputs: default_inputs(),
            standard_rig: false,
        }
    }
}

fn default_inputs() -> usize {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Mapping (nnb) file path
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Save the mapping to `path` after each successful connect
    #[serde(default)]
    pub autosave: bool,
    /// Reapply the mapping file at startup
    #[serde(default)]
    pub load_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleConfig {
    #[serde(default = "default_user_rig_scale")]
    pub user_rig: f32,
    #[serde(default = "default_standard_rig_scale")]
    pub standard_rig: f32,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            user_rig: default_user_rig_scale(),
            standard_rig: default_standard_rig_scale(),
        }
    }
}

fn default_user_rig_scale() -> f32 {
    ScaleOffsets::default().user_rig
}

fn default_standard_rig_scale() -> f32 {
    ScaleOffsets::default().standard_rig
}

impl ScaleConfig {
    pub fn offsets(&self) -> ScaleOffsets {
        ScaleOffsets {
            user_rig: self.user_rig,
            standard_rig: self.standard_rig,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        mapping: MappingConfig {
            path: Some(PathBuf::from("rigbridge.nnb")),
            autosave: true,
            load_on_start: false,
        },
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.bind, "0.0.0.0:9002");
        assert_eq!(config.daemon.tick_interval(), Duration::from_millis(16));
        assert_eq!(config.device.inputs, 1);
        assert!(!config.device.standard_rig);
        assert!(config.mapping.path.is_none());
        assert_eq!(config.scale.offsets(), ScaleOffsets::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rigbridge.toml");
        std::fs::write(
            &path,
            "[daemon]\nbind = \"127.0.0.1:9100\"\n\n[scale]\nuser_rig = 1.0\n\n[mapping]\npath = \"rig.nnb\"\nautosave = true\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.bind, "127.0.0.1:9100");
        assert_eq!(config.daemon.tick_interval_ms, 16);
        assert_eq!(config.scale.user_rig, 1.0);
        assert_eq!(config.scale.standard_rig, 0.2);
        assert_eq!(config.mapping.path, Some(PathBuf::from("rig.nnb")));
        assert!(config.mapping.autosave);
        assert!(!config.mapping.load_on_start);
    }

    #[test]
    fn test_default_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rigbridge.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.bind, "0.0.0.0:9002");
        assert_eq!(config.mapping.path, Some(PathBuf::from("rigbridge.nnb")));
        assert!(config.mapping.autosave);
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[daemon\nbind = 1").unwrap();
        assert!(load_config(&path).is_err());
    }
}
