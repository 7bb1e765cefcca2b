use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Resources the console host keeps subscribed
  #[serde(default)]
  pub resources: Vec<ResourceConfig>,
  /// Directory for rolling log files (logs go to stderr if unset)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: String,
  /// Cheap, always-authorized endpoint used for health probes
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
}

fn default_probe_path() -> String {
  "/health".to_string()
}

fn default_request_timeout_ms() -> u64 {
  10_000
}

impl BackendConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  pub name: String,
  pub path: String,
  /// Overrides `sync.fetch.default_ttl_ms` for this resource
  pub ttl_ms: Option<u64>,
}

/// Timing policy for the synchronization core.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
  #[serde(default)]
  pub connection: MonitorConfig,
  #[serde(default)]
  pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
  /// Passive probe interval while visible and connected
  pub ping_interval_ms: u64,
  /// First reconnect backoff delay; doubles on every failed attempt
  pub base_delay_ms: u64,
  pub max_attempts: u32,
  pub probe_timeout_ms: u64,
  /// Ask the backend to refresh held credentials before each reconnect probe
  pub refresh_credentials: bool,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      ping_interval_ms: 30_000,
      base_delay_ms: 2_000,
      max_attempts: 5,
      probe_timeout_ms: 5_000,
      refresh_credentials: true,
    }
  }
}

impl MonitorConfig {
  pub fn ping_interval(&self) -> Duration {
    Duration::from_millis(self.ping_interval_ms)
  }

  pub fn base_delay(&self) -> Duration {
    Duration::from_millis(self.base_delay_ms)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
  /// Minimum time between two non-forced fetches of the same key
  pub throttle_window_ms: u64,
  /// Bounded wait per fetch attempt, independent of the transport timeout
  pub fetch_timeout_ms: u64,
  pub default_ttl_ms: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      throttle_window_ms: 1_000,
      fetch_timeout_ms: 6_000,
      default_ttl_ms: 60_000,
    }
  }
}

impl FetchConfig {
  pub fn throttle_window(&self) -> Duration {
    Duration::from_millis(self.throttle_window_ms)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.fetch_timeout_ms)
  }

  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }
}

impl SyncConfig {
  /// Validate configuration values
  pub fn validate(&self) -> Result<(), SyncError> {
    let conn = &self.connection;
    if conn.ping_interval_ms == 0 {
      return Err(SyncError::Config("ping_interval_ms must be > 0".to_string()));
    }
    if conn.base_delay_ms == 0 {
      return Err(SyncError::Config("base_delay_ms must be > 0".to_string()));
    }
    if conn.max_attempts == 0 {
      return Err(SyncError::Config("max_attempts must be >= 1".to_string()));
    }
    if conn.probe_timeout_ms == 0 || conn.probe_timeout_ms >= conn.ping_interval_ms {
      return Err(SyncError::Config(
        "probe_timeout_ms must be > 0 and < ping_interval_ms".to_string(),
      ));
    }

    let fetch = &self.fetch;
    if fetch.fetch_timeout_ms == 0 {
      return Err(SyncError::Config("fetch_timeout_ms must be > 0".to_string()));
    }
    if fetch.default_ttl_ms == 0 {
      return Err(SyncError::Config("default_ttl_ms must be > 0".to_string()));
    }
    Ok(())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./resync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/resync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/resync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("resync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("resync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config
      .sync
      .validate()
      .map_err(|e| eyre!("{} ({})", e, path.display()))?;

    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks RESYNC_API_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RESYNC_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// TTL for a configured resource
  pub fn resource_ttl(&self, resource: &ResourceConfig) -> Duration {
    resource
      .ttl_ms
      .map(Duration::from_millis)
      .unwrap_or_else(|| self.sync.fetch.default_ttl())
  }
}
