use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::coordinator::CoordinatorConfig;
use crate::notify::NotificationStyle;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Application origin, e.g. https://learn.example.com
  pub origin: Url,
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  #[serde(default = "default_static_cache_name")]
  pub static_cache_name: String,
  #[serde(default = "default_dynamic_cache_name")]
  pub dynamic_cache_name: String,
  /// Paths (relative to the origin) precached on install
  #[serde(default = "default_asset_manifest")]
  pub asset_manifest: Vec<String>,
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  #[serde(default = "default_network_first_timeout_ms")]
  pub network_first_timeout_ms: u64,
  #[serde(default = "default_cache_first_timeout_ms")]
  pub cache_first_timeout_ms: u64,
  #[serde(default = "default_sync_tag")]
  pub sync_tag: String,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub notifications: NotificationsConfig,
  #[serde(default)]
  pub database: DatabaseConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_ms: u64,
  pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_ms: 5_000,
      probe_timeout_ms: 2_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
  pub title: String,
  pub icon: String,
  pub badge: String,
}

impl Default for NotificationsConfig {
  fn default() -> Self {
    Self {
      title: "swcache".to_string(),
      icon: "/logo192.png".to_string(),
      badge: "/favicon.ico".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
  /// SQLite file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter used when RUST_LOG is unset
  pub level: String,
  /// Log file directory (defaults to the platform data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_static_cache_name() -> String {
  "static-v1".to_string()
}

fn default_dynamic_cache_name() -> String {
  "dynamic-v1".to_string()
}

fn default_asset_manifest() -> Vec<String> {
  ["/", "/static/js/bundle.js", "/static/css/main.css", "/manifest.json", "/favicon.ico"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_network_first_timeout_ms() -> u64 {
  5_000
}

fn default_cache_first_timeout_ms() -> u64 {
  10_000
}

fn default_sync_tag() -> String {
  "background-sync".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
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
        "No configuration file found. Create one at ~/.config/swcache/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("origin must be an absolute http(s) URL: {}", self.origin));
    }
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/': {}", self.api_prefix));
    }
    if self.static_cache_name == self.dynamic_cache_name {
      return Err(eyre!(
        "static_cache_name and dynamic_cache_name must differ ({})",
        self.static_cache_name
      ));
    }
    Ok(())
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {} for origin {}: {}", path, self.origin, e))
  }

  pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
    Ok(CoordinatorConfig {
      origin: self.origin.clone(),
      api_prefix: self.api_prefix.clone(),
      static_cache_name: self.static_cache_name.clone(),
      dynamic_cache_name: self.dynamic_cache_name.clone(),
      asset_manifest: self
        .asset_manifest
        .iter()
        .map(|p| self.resolve(p))
        .collect::<Result<_>>()?,
      offline_page: self.resolve(&self.offline_page)?,
      network_first_timeout: Duration::from_millis(self.network_first_timeout_ms),
      cache_first_timeout: Duration::from_millis(self.cache_first_timeout_ms),
      sync_tag: self.sync_tag.clone(),
    })
  }

  pub fn notification_style(&self) -> Result<NotificationStyle> {
    Ok(NotificationStyle {
      title: self.notifications.title.clone(),
      icon: self.notifications.icon.clone(),
      badge: self.notifications.badge.clone(),
      root: self.resolve("/")?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_minimal_config_uses_defaults() {
    let file = write_config("origin: https://learn.example.com\n");

    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.api_prefix, "/api/");
    assert_eq!(config.sync_tag, "background-sync");
    assert_eq!(config.connectivity.probe_interval_ms, 5_000);
    assert_eq!(config.logging.level, "info");
    assert!(config.database.path.is_none());

    let coordinator = config.coordinator_config().unwrap();
    assert_eq!(coordinator.asset_manifest.len(), 5);
    assert_eq!(
      coordinator.offline_page.as_str(),
      "https://learn.example.com/offline.html"
    );
    assert_eq!(coordinator.network_first_timeout, Duration::from_secs(5));
  }

  #[test]
  fn test_full_config() {
    let file = write_config(
      r#"
origin: https://learn.example.com
api_prefix: /v2/
static_cache_name: static-v7
dynamic_cache_name: dynamic-v7
asset_manifest: ["/", "/app.js"]
network_first_timeout_ms: 1500
notifications:
  title: Learn
database:
  path: /tmp/swcache-test.db
logging:
  level: debug
"#,
    );

    let config = Config::load(Some(file.path())).unwrap();
    let coordinator = config.coordinator_config().unwrap();

    assert_eq!(coordinator.api_prefix, "/v2/");
    assert_eq!(coordinator.static_cache_name, "static-v7");
    assert_eq!(
      coordinator.asset_manifest[1].as_str(),
      "https://learn.example.com/app.js"
    );
    assert_eq!(coordinator.network_first_timeout, Duration::from_millis(1500));
    assert_eq!(config.notifications.title, "Learn");
    assert_eq!(config.notifications.icon, "/logo192.png");
    assert_eq!(config.logging.level, "debug");
    assert_eq!(
      config.notification_style().unwrap().root.as_str(),
      "https://learn.example.com/"
    );
  }

  #[test]
  fn test_missing_origin_is_rejected() {
    let file = write_config("api_prefix: /api/\n");

    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_identical_cache_names_are_rejected() {
    let file = write_config(
      "origin: https://learn.example.com\nstatic_cache_name: v1\ndynamic_cache_name: v1\n",
    );

    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("must differ"));
  }

  #[test]
  fn test_explicit_path_must_exist() {
    let err = Config::load(Some(Path::new("/nonexistent/swcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
