use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::schema::SchemaDescriptor;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Schema descriptor registered with the store
  #[serde(default)]
  pub schema: SchemaDescriptor,
  pub adapter: AdapterConfig,
  #[serde(default)]
  pub query_cache: QueryCacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
  /// Base URL, e.g. "https://api.example.com"
  pub host: String,
  /// Path prefix between host and model name, e.g. "api/v1"
  pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryCacheConfig {
  /// Seconds before a loaded query result is fetched again. Unset keeps
  /// results until they are unloaded.
  pub stale_secs: Option<u64>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./m3-store.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/m3-store/config.yaml
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
        "No configuration file found. Create one at ~/.config/m3-store/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("m3-store.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("m3-store").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn query_stale_time(&self) -> Option<chrono::Duration> {
    self
      .query_cache
      .stale_secs
      .and_then(|secs| i64::try_from(secs).ok())
      .map(chrono::Duration::seconds)
  }
}
