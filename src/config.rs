use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::Generation;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Prefix for generation names (e.g. "buildfolio")
  pub app: String,
  /// Bumping this on deploy busts both generations at next activation
  #[serde(default = "default_version")]
  pub version: u32,
  /// Title used for push notifications (defaults to `app` if not set)
  pub display_name: Option<String>,
  /// Origin of the host application; responses from it are `basic`
  pub origin: String,
  #[serde(default = "default_static_assets")]
  pub static_assets: Vec<String>,
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  #[serde(default = "default_submit_endpoint")]
  pub submit_endpoint: String,
  #[serde(default = "default_sync_tag")]
  pub sync_tag: String,
  /// Request headers that take part in the cache key (case-insensitive)
  #[serde(default, deserialize_with = "deserialize_lowercase_set")]
  pub vary_headers: BTreeSet<String>,
  /// Registration only happens in production builds
  #[serde(default = "default_production")]
  pub production: bool,
  /// SQLite path (default: $XDG_DATA_HOME/offline-shell/<app>.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Oldest submissions are dropped once this many are pending
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
  /// Failed attempts before a submission is given up on
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_base_backoff_secs")]
  pub base_backoff_secs: u64,
  #[serde(default = "default_max_backoff_secs")]
  pub max_backoff_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_entries: default_max_entries(),
      max_attempts: default_max_attempts(),
      base_backoff_secs: default_base_backoff_secs(),
      max_backoff_secs: default_max_backoff_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
  /// Body shown when a push arrives without text
  #[serde(default = "default_body")]
  pub default_body: String,
  #[serde(default = "default_icon")]
  pub icon: String,
  #[serde(default = "default_icon")]
  pub badge: String,
  #[serde(default = "default_vibrate")]
  pub vibrate: Vec<u32>,
  #[serde(default = "default_actions")]
  pub actions: Vec<ActionConfig>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_body: default_body(),
      icon: default_icon(),
      badge: default_icon(),
      vibrate: default_vibrate(),
      actions: default_actions(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
  pub action: String,
  pub title: String,
  pub icon: Option<String>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

fn default_version() -> u32 {
  1
}

fn default_static_assets() -> Vec<String> {
  [
    "/",
    "/index.html",
    "/logo.svg",
    "/static/js/bundle.js",
    "/static/css/main.css",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_offline_fallback() -> String {
  "/index.html".to_string()
}

fn default_submit_endpoint() -> String {
  "/api/submit".to_string()
}

fn default_sync_tag() -> String {
  "background-sync".to_string()
}

fn default_production() -> bool {
  true
}

fn default_max_entries() -> usize {
  500
}

fn default_max_attempts() -> u32 {
  10
}

fn default_base_backoff_secs() -> u64 {
  30
}

fn default_max_backoff_secs() -> u64 {
  3600
}

fn default_body() -> String {
  "New update available!".to_string()
}

fn default_icon() -> String {
  "/logo.svg".to_string()
}

fn default_vibrate() -> Vec<u32> {
  vec![100, 50, 100]
}

fn default_actions() -> Vec<ActionConfig> {
  vec![
    ActionConfig {
      action: "explore".to_string(),
      title: "View Portfolio".to_string(),
      icon: Some(default_icon()),
    },
    ActionConfig {
      action: "close".to_string(),
      title: "Close".to_string(),
      icon: Some(default_icon()),
    },
  ]
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-shell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-shell/config.yaml
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
        "No configuration file found. Create one at ~/.config/offline-shell/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-shell.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-shell").join("config.yaml");
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
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Invalid configuration: {}", e))?;

    let origin = config.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be http or https, got {}", origin));
    }
    if config.app.trim().is_empty() {
      return Err(eyre!("`app` must not be empty"));
    }
    if config.queue.max_entries == 0 {
      return Err(eyre!("`queue.max_entries` must be at least 1"));
    }
    if config.queue.max_attempts == 0 {
      return Err(eyre!("`queue.max_attempts` must be at least 1"));
    }

    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a root-relative path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  pub fn static_generation(&self) -> Generation {
    Generation::static_for(&self.app, self.version)
  }

  pub fn dynamic_generation(&self) -> Generation {
    Generation::dynamic_for(&self.app, self.version)
  }

  pub fn notification_title(&self) -> &str {
    self.display_name.as_deref().unwrap_or(&self.app)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("app: buildfolio\norigin: https://example.test\n").unwrap();

    assert_eq!(config.version, 1);
    assert_eq!(config.static_assets.len(), 5);
    assert_eq!(config.offline_fallback, "/index.html");
    assert_eq!(config.sync_tag, "background-sync");
    assert!(config.production);
    assert_eq!(config.queue.max_entries, 500);
    assert_eq!(config.notification.vibrate, vec![100, 50, 100]);
    assert_eq!(config.notification_title(), "buildfolio");
  }

  #[test]
  fn test_generation_names() {
    let config =
      Config::from_yaml("app: buildfolio\nversion: 3\norigin: https://example.test\n").unwrap();

    assert_eq!(config.static_generation().name(), "buildfolio-static-v3");
    assert_eq!(config.dynamic_generation().name(), "buildfolio-dynamic-v3");
  }

  #[test]
  fn test_vary_headers_are_lowercased() {
    let config = Config::from_yaml(
      "app: a\norigin: https://example.test\nvary_headers: [Accept-Language, ACCEPT]\n",
    )
    .unwrap();

    let names: Vec<_> = config.vary_headers.iter().map(String::as_str).collect();
    assert_eq!(names, vec!["accept", "accept-language"]);
  }

  #[test]
  fn test_rejects_non_http_origin() {
    assert!(Config::from_yaml("app: a\norigin: ftp://example.test\n").is_err());
    assert!(Config::from_yaml("app: a\norigin: not a url\n").is_err());
  }

  #[test]
  fn test_rejects_zero_queue_limits() {
    let base = "app: a\norigin: https://example.test\n";
    assert!(Config::from_yaml(&format!("{}queue:\n  max_entries: 0\n", base)).is_err());
    assert!(Config::from_yaml(&format!("{}queue:\n  max_attempts: 0\n", base)).is_err());
    assert!(Config::from_yaml(&format!("{}queue:\n  max_entries: 1\n", base)).is_ok());
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::from_yaml("app: a\norigin: https://example.test\n").unwrap();
    assert_eq!(
      config.resolve("/index.html").unwrap().as_str(),
      "https://example.test/index.html"
    );
  }
}
