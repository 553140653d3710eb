use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Engine configuration.
///
/// Everything the engine needs is passed in through this struct; there is no
/// global state. Secrets never live here, see [`Config::get_api_token`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the relative URLs (seed list, offline page) resolve against
  pub origin: String,
  /// SQLite file (defaults to $XDG_DATA_HOME/dreamsw/dreamsw.db)
  pub database: Option<PathBuf>,
  pub cache: CacheConfig,
  pub routing: RoutingConfig,
  pub sync: SyncConfig,
  pub push: PushConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080/".to_string(),
      database: None,
      cache: CacheConfig::default(),
      routing: RoutingConfig::default(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Current generation for precached static assets
  pub static_namespace: String,
  /// Current generation for pages and API responses cached at runtime
  pub dynamic_namespace: String,
  /// Path of the offline page, also seeded on install
  pub offline_page: String,
  /// Paths fetched and stored on install
  pub seed_urls: Vec<String>,
  pub network_timeout_ms: u64,
  pub bridge_timeout_ms: u64,
  /// Cached assets older than this are refreshed in the background after serving
  pub revalidate_after_secs: u64,
  /// Total body bytes the cache may hold
  pub max_bytes: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_namespace: "dreamos-static-v4".to_string(),
      dynamic_namespace: "dreamos-dynamic-v4".to_string(),
      offline_page: "/offline.html".to_string(),
      seed_urls: [
        "/",
        "/index.html",
        "/manifest.json",
        "/css/main.css",
        "/js/main.js",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      network_timeout_ms: 5_000,
      bridge_timeout_ms: 8_000,
      revalidate_after_secs: 0,
      max_bytes: None,
    }
  }
}

impl CacheConfig {
  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network_timeout_ms)
  }

  pub fn bridge_timeout(&self) -> Duration {
    Duration::from_millis(self.bridge_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Path patterns that must never be served from cache
  pub always_fresh: Vec<String>,
  /// Path patterns of the sync/bridge/API surface
  pub bridge: Vec<String>,
  /// Extensions served cache-first (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      always_fresh: vec!["^/admin(/|$)".to_string()],
      bridge: vec![
        "^/api/".to_string(),
        "^/sync(/|$)".to_string(),
        "^/bridge(/|$)".to_string(),
      ],
      static_extensions: [
        "css", "js", "json", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2",
        "ttf", "eot",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync tags that trigger a replay
  pub tags: Vec<String>,
  /// Periodic sync tag that triggers a replay
  pub periodic_tag: String,
  /// Deadline for each replayed request
  pub replay_timeout_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tags: vec![
        "sync-data".to_string(),
        "sync-offline-data".to_string(),
        "sync-api-requests".to_string(),
      ],
      periodic_tag: "periodic-sync".to_string(),
      replay_timeout_ms: 10_000,
    }
  }
}

impl SyncConfig {
  pub fn replay_timeout(&self) -> Duration {
    Duration::from_millis(self.replay_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub default_title: String,
  pub default_body: String,
  pub icon: String,
  pub badge: String,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      default_title: "Dream OS Notification".to_string(),
      default_body: "You have a new notification".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dreamsw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dreamsw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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
    // Check current directory
    let local = PathBuf::from("dreamsw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dreamsw").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the origin API token from the environment.
  ///
  /// Checks DREAMSW_API_TOKEN. Tokens are never read from the config file.
  pub fn get_api_token() -> Option<String> {
    std::env::var("DREAMSW_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL {}: {}", path, e))
  }

  /// Seed list resolved against the origin; the offline page is always included.
  pub fn seed_urls(&self) -> Result<Vec<Url>> {
    let mut urls = Vec::with_capacity(self.cache.seed_urls.len() + 1);
    for path in &self.cache.seed_urls {
      let url = self.resolve(path)?;
      if !urls.contains(&url) {
        urls.push(url);
      }
    }
    let offline = self.offline_page_url()?;
    if !urls.contains(&offline) {
      urls.push(offline);
    }
    Ok(urls)
  }

  pub fn offline_page_url(&self) -> Result<Url> {
    self.resolve(&self.cache.offline_page)
  }
}
