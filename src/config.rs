use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL of the managed backend (e.g. "https://abc.supabase.co")
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Namespace prefix for persisted slots
  #[serde(default = "default_storage_prefix")]
  pub storage_prefix: String,
  /// Mirror entries to disk
  #[serde(default = "default_true")]
  pub persist: bool,
  /// Database location (defaults to the user data directory)
  pub database_path: Option<PathBuf>,
  /// Unforced refetches of a key within this window are served from memory
  #[serde(default = "default_min_refetch_interval")]
  pub min_refetch_interval_secs: u64,
  #[serde(default)]
  pub entities: EntityTtls,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      storage_prefix: default_storage_prefix(),
      persist: true,
      database_path: None,
      min_refetch_interval_secs: default_min_refetch_interval(),
      entities: EntityTtls::default(),
    }
  }
}

impl CacheConfig {
  pub fn min_refetch_interval(&self) -> Duration {
    seconds(self.min_refetch_interval_secs)
  }
}

/// Per-entity freshness windows.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityTtls {
  #[serde(default = "default_organization_ttl")]
  pub organization_settings: TtlConfig,
  #[serde(default = "default_profile_ttl")]
  pub profile: TtlConfig,
  #[serde(default = "default_preferences_ttl")]
  pub user_preferences: TtlConfig,
}

impl Default for EntityTtls {
  fn default() -> Self {
    Self {
      organization_settings: default_organization_ttl(),
      profile: default_profile_ttl(),
      user_preferences: default_preferences_ttl(),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TtlConfig {
  pub ttl_secs: u64,
}

impl TtlConfig {
  pub fn ttl(&self) -> Duration {
    seconds(self.ttl_secs)
  }
}

/// Anything longer than this is as good as forever.
const MAX_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn seconds(secs: u64) -> Duration {
  Duration::seconds(secs.min(MAX_SECS) as i64)
}

fn default_storage_prefix() -> String {
  "studio:".to_string()
}

fn default_true() -> bool {
  true
}

fn default_min_refetch_interval() -> u64 {
  60
}

fn default_organization_ttl() -> TtlConfig {
  TtlConfig { ttl_secs: 5 * 60 }
}

fn default_profile_ttl() -> TtlConfig {
  TtlConfig { ttl_secs: 30 }
}

fn default_preferences_ttl() -> TtlConfig {
  TtlConfig {
    ttl_secs: 12 * 60 * 60,
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./studio-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/studio-cache/config.yaml
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
        "No configuration file found. Create one at ~/.config/studio-cache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("studio-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("studio-cache").join("config.yaml");
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
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks STUDIO_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("STUDIO_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set STUDIO_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Get the signed-in user's access token from environment variables.
  ///
  /// Checks STUDIO_ACCESS_TOKEN.
  pub fn get_access_token() -> Result<String> {
    std::env::var("STUDIO_ACCESS_TOKEN").map_err(|_| {
      eyre!("Access token not found. Set STUDIO_ACCESS_TOKEN environment variable.")
    })
  }
}
