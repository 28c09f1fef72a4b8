use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::PersistencePolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the entity service, e.g. "https://notes.example.com/api"
  #[serde(default = "default_url")]
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: default_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_url() -> String {
  "http://localhost:8080/api".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Persist the cache across runs. When false nothing is written to disk.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Database location (defaults to $XDG_DATA_HOME/draftcache/cache.db)
  pub db_path: Option<PathBuf>,
  #[serde(default = "default_heavy_slots")]
  pub heavy_slots: usize,
  #[serde(default = "default_light_slots")]
  pub light_slots: usize,
  /// Serialized bytes allowed per entity kind; unset means the built-in limit
  pub byte_budget: Option<usize>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      db_path: None,
      heavy_slots: default_heavy_slots(),
      light_slots: default_light_slots(),
      byte_budget: None,
    }
  }
}

impl CacheConfig {
  pub fn policy(&self) -> PersistencePolicy {
    let defaults = PersistencePolicy::default();
    PersistencePolicy {
      heavy_slots: self.heavy_slots,
      light_slots: self.light_slots,
      byte_budget: self.byte_budget.or(defaults.byte_budget),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_heavy_slots() -> usize {
  PersistencePolicy::default().heavy_slots
}

fn default_light_slots() -> usize {
  PersistencePolicy::default().light_slots
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
  /// How many fresh identities to try before leaving a create queued
  #[serde(default = "default_max_collision_retries")]
  pub max_collision_retries: u32,
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      max_collision_retries: default_max_collision_retries(),
    }
  }
}

fn default_max_collision_retries() -> u32 {
  3
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./draftcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/draftcache/config.yaml
  ///
  /// Without any file the defaults are used.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("draftcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("draftcache").join("config.yaml");
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
    // An empty document deserializes as null, not as an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the remote API token from environment variables.
  ///
  /// Checks DRAFTCACHE_TOKEN first, then DRAFTCACHE_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("DRAFTCACHE_TOKEN")
      .or_else(|_| std::env::var("DRAFTCACHE_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set DRAFTCACHE_TOKEN or DRAFTCACHE_API_TOKEN environment variable.")
      })
  }
}
