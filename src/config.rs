use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application directory name under the platform config/data dirs.
pub const APP_DIR: &str = "nexus-store";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub crypto: CryptoConfig,
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/nexus-store/store.db)
  pub path: Option<PathBuf>,
  /// Master switch for value encryption. Numbers are never encrypted.
  pub encryption: bool,
  /// Sweep expired entries when the store is opened
  pub cleanup_on_open: bool,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      encryption: true,
      cleanup_on_open: true,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
  /// Directory holding the device id and master key slots
  pub secrets_dir: Option<PathBuf>,
  /// Fall back to a process-only key when the secret store is unusable.
  /// Data written in this mode cannot be read after a restart.
  pub allow_ephemeral_key: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub timeout_secs: u64,
  /// Resends allowed after a 429 before giving up
  pub max_rate_limit_retries: u32,
  /// Wait used when a 429 carries no Retry-After header
  pub default_retry_after_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "https://api.otakus-nexus.app/v1/".to_string(),
      timeout_secs: 30,
      max_rate_limit_retries: 3,
      default_retry_after_secs: 5,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_size: usize,
  pub max_retries: u32,
  pub drain_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_size: 100,
      max_retries: 3,
      drain_interval_secs: 30,
    }
  }
}

impl QueueConfig {
  pub fn drain_interval(&self) -> Duration {
    Duration::from_secs(self.drain_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive, overridden by RUST_LOG
  pub level: String,
  /// Directory for daily-rolling log files; stderr only when unset
  pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./nexus-store.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/nexus-store/config.yaml
  ///
  /// Without any file the defaults apply.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("nexus-store.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Application data directory ($XDG_DATA_HOME/nexus-store).
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join(APP_DIR))
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("store.db")),
    }
  }

  pub fn secrets_dir(&self) -> Result<PathBuf> {
    match &self.crypto.secrets_dir {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("secrets")),
    }
  }

  /// Bearer token supplied through the environment, if any.
  ///
  /// Checks NEXUS_API_TOKEN.
  pub fn api_token_from_env() -> Option<String> {
    std::env::var("NEXUS_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
