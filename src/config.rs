//! Configuration management for tandem recorder

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Recording session and buffer limits
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Upload configuration
    #[serde(default)]
    pub upload: UploadConfig,

    /// Shared registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Identity of the page this peer is showing
    #[serde(default)]
    pub page: PageConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Interval between periodic buffer flushes (ms)
    #[serde(default = "default_upload_interval")]
    pub upload_interval_ms: u64,

    /// Hard cap on buffered events
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Maximum events per upload batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum recording duration before auto-stop (ms)
    #[serde(default = "default_max_duration")]
    pub max_duration_ms: u64,

    /// Interval between last-active heartbeats (ms)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Hard timeout for one batch delivery (ms)
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_ms: u64,

    /// Pause between batches of one flush (ms)
    #[serde(default = "default_batch_yield")]
    pub batch_yield_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Base URL of the collector (`{sink_url}/{record_id}/upload`)
    pub sink_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory shared by all peers of one origin
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageConfig {
    /// URL of the page this peer shows
    #[serde(default = "default_page_url")]
    pub url: String,

    /// Client description sent as `uaInfo`
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

// Default value functions
fn default_upload_interval() -> u64 {
    3000
}

fn default_max_events() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_max_duration() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_upload_timeout() -> u64 {
    15_000
}

fn default_batch_yield() -> u64 {
    10
}

fn default_page_url() -> String {
    "about:blank".to_string()
}

fn default_user_agent() -> String {
    format!(
        "tandem-recorder/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            upload_interval_ms: default_upload_interval(),
            max_events: default_max_events(),
            batch_size: default_batch_size(),
            max_duration_ms: default_max_duration(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            upload_timeout_ms: default_upload_timeout(),
            batch_yield_ms: default_batch_yield(),
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            url: default_page_url(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording: RecordingConfig::default(),
            upload: UploadConfig::default(),
            registry: RegistryConfig::default(),
            page: PageConfig::default(),
            config_path: None,
        }
    }
}

impl RecordingConfig {
    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn batch_yield(&self) -> Duration {
        Duration::from_millis(self.batch_yield_ms)
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(config_path)
    }

    /// Load configuration from an explicit path, creating it if missing
    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(config_path),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "tandem", "recorder")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Shared registry directory, falling back to the per-user data dir
    pub fn registry_directory(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.registry.directory {
            return Ok(dir.clone());
        }
        let proj_dirs = directories::ProjectDirs::from("dev", "tandem", "recorder")
            .context("Failed to determine data directory")?;
        Ok(proj_dirs.data_local_dir().join("registry"))
    }
}
