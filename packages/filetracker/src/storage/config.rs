// Tracker configuration management
use crate::error::{TrackerError, TrackerResult};
use crate::hash::DEFAULT_PARTITION_POWER;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Configuration for the tracker of one disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Root directory of the disk
    pub root: PathBuf,

    /// Number of high hash bits used to pick a partition (1-8)
    #[serde(default = "default_partition_power")]
    pub partition_power: u8,

    /// Connection budget of each partition's index
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_partition_power() -> u8 {
    DEFAULT_PARTITION_POWER
}

fn default_max_connections() -> u32 {
    4
}

impl TrackerConfig {
    /// Configuration for `root` with default settings.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partition_power: default_partition_power(),
            max_connections: default_max_connections(),
        }
    }

    /// Load configuration with the following priority:
    /// 1. FILETRACKER_ROOT (and FILETRACKER_PARTITION_POWER) environment variables
    /// 2. config.toml file
    /// 3. Default: <data dir>/filetracker
    pub async fn load() -> Result<Self> {
        // Priority 1: Environment variable
        if let Ok(env_path) = std::env::var("FILETRACKER_ROOT") {
            let mut config = Self::with_root(env_path);
            if let Ok(power) = std::env::var("FILETRACKER_PARTITION_POWER") {
                config.partition_power = power
                    .parse()
                    .with_context(|| format!("Invalid FILETRACKER_PARTITION_POWER: {}", power))?;
            }
            return Ok(config);
        }

        // Priority 2: Config file
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let content = fs::read_to_string(&config_path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                let config: TrackerConfig = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

                return Ok(config);
            }
        }

        // Priority 3: Default
        Ok(Self::default())
    }

    /// Get the config file path (~/.config/filetracker/config.toml)
    pub fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("filetracker").join("config.toml"))
    }

    /// Save configuration to config file
    pub async fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_file_path()
            .context("Failed to determine config directory")?;

        // Create parent directory
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&config_path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(config_path)
    }

    /// Reject settings the tracker cannot run with.
    pub fn validate(&self) -> TrackerResult<()> {
        if !(1..=8).contains(&self.partition_power) {
            return Err(TrackerError::InvalidConfig(format!(
                "partition_power must be between 1 and 8, got {}",
                self.partition_power
            )));
        }
        if self.max_connections == 0 {
            return Err(TrackerError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Scratch area for in-progress writes
    pub fn temp_path(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Directory of partition `index`
    pub fn partition_dir(&self, index: usize) -> PathBuf {
        self.root.join(format!("{:02x}", index))
    }

    /// Index database of partition `index`
    pub fn index_path(&self, index: usize) -> PathBuf {
        crate::db::index_file(&self.partition_dir(index), index)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filetracker");

        Self::with_root(root)
    }
}
