use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::agent::AgentConfig;
use crate::cache::SqliteStorage;

/// Store version. Bump whenever the core assets or the caching policy change
/// so that activation purges the previous store.
pub const DEFAULT_CACHE_NAME: &str = "training-app-v1";

/// Resources required for the application to start offline.
pub const DEFAULT_CORE_ASSETS: [&str; 3] = ["/", "/static/mobile.css", "/static/manifest.webmanifest"];

pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:5001";

/// Environment variable overriding `origin`.
pub const ORIGIN_ENV: &str = "OFFLINE_AGENT_ORIGIN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the application the agent serves (scheme, host, port)
  pub origin: String,
  /// Name of the current store
  pub cache_name: String,
  /// Paths fetched and stored at install time
  pub core_assets: Vec<String>,
  /// SQLite database path (defaults to the user data directory)
  pub database: Option<PathBuf>,
  pub network: NetworkConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: DEFAULT_ORIGIN.to_string(),
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      core_assets: DEFAULT_CORE_ASSETS.iter().map(|s| s.to_string()).collect(),
      database: None,
      network: NetworkConfig::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Transport timeout in seconds. Unset means wait indefinitely.
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default level, overridden by RUST_LOG
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
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
  /// 2. ./offline-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-agent/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    Ok(config.with_origin_override(std::env::var(ORIGIN_ENV).ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-agent").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Replace the origin if an override is present.
  pub fn with_origin_override(self, origin: Option<String>) -> Self {
    match origin {
      Some(origin) => Config { origin, ..self },
      None => self,
    }
  }

  /// Path of the SQLite cache database.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Validate and build the configuration handed to the agent.
  pub fn agent(&self) -> Result<AgentConfig> {
    let origin = Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    AgentConfig::new(origin, self.cache_name.clone(), self.core_assets.clone())
  }
}
