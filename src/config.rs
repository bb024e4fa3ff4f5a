use color_eyre::{eyre::eyre, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::Database;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub store: StoreConfig,
  pub cache: CacheConfig,
  pub jobs: JobsConfig,
  pub daily_sync: DailySyncConfig,
  pub periodic_sync: PeriodicSyncConfig,
  pub rate_limit: RateLimitConfig,
  pub origin: OriginConfig,
  pub logging: LoggingConfig,
  /// File the settings were read from, if any
  #[serde(skip)]
  pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Database file; defaults to `<data_dir>/novelcache/cache.db`
  pub path: Option<PathBuf>,
  pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      busy_timeout_ms: 5000,
    }
  }
}

impl StoreConfig {
  pub fn resolve_path(&self) -> Result<PathBuf> {
    self
      .path
      .clone()
      .or_else(Database::default_path)
      .ok_or_else(|| eyre!("Could not determine a data directory; set store.path in the config"))
  }

  pub fn busy_timeout(&self) -> Duration {
    Duration::from_millis(self.busy_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_secs: u64,
  pub max_items: usize,
  /// Chapter references committed per transaction
  pub chapter_batch_size: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 900,
      max_items: 500,
      chapter_batch_size: 100,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
  pub workers: usize,
  /// Minimum gap between two job starts across all workers
  pub rate_limit_ms: u64,
  pub cooldown_secs: u64,
  pub job_timeout_secs: u64,
  pub shutdown_timeout_secs: u64,
}

impl Default for JobsConfig {
  fn default() -> Self {
    Self {
      workers: 2,
      rate_limit_ms: 1000,
      cooldown_secs: 300,
      job_timeout_secs: 300,
      shutdown_timeout_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DailySyncConfig {
  pub enabled: bool,
  pub hour: u32,
  pub minute: u32,
  /// Pause between two enqueued books
  pub slow_rate_limit_ms: u64,
  pub check_interval_secs: u64,
  pub stale_syncing_secs: u64,
  pub prune_after_days: u32,
}

impl Default for DailySyncConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      hour: 0,
      minute: 0,
      slow_rate_limit_ms: 5000,
      check_interval_secs: 60,
      stale_syncing_secs: 3600,
      prune_after_days: 7,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeriodicSyncConfig {
  pub enabled: bool,
  pub interval_hours: u64,
  pub priority: i32,
  pub initial_delay_secs: u64,
  pub check_interval_secs: u64,
}

impl Default for PeriodicSyncConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      interval_hours: 6,
      priority: 3,
      initial_delay_secs: 60,
      check_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  #[serde(deserialize_with = "deserialize_whitelist")]
  pub whitelist: Whitelist,
}

/// Exact addresses and networks exempt from throttling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Whitelist {
  pub ips: Vec<IpAddr>,
  pub networks: Vec<IpNetwork>,
  /// Entries that are neither an address nor a network
  pub invalid: Vec<String>,
}

impl Whitelist {
  /// Sort entries into addresses and networks. Anything else is set aside in `invalid`.
  pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
    let mut whitelist = Self::default();
    for entry in entries {
      let entry = entry.as_ref().trim();
      if let Ok(ip) = entry.parse::<IpAddr>() {
        whitelist.ips.push(ip);
      } else if let Ok(network) = entry.parse::<IpNetwork>() {
        whitelist.networks.push(network);
      } else {
        whitelist.invalid.push(entry.to_string());
      }
    }
    whitelist
  }
}

fn deserialize_whitelist<'de, D>(deserializer: D) -> Result<Whitelist, D::Error>
where
  D: Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(Whitelist::parse(&v))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
  pub base_url: String,
  pub timeout_secs: u64,
  pub user_agent: String,
  /// Status label the origin uses for finished books
  pub finished_status: String,
}

impl Default for OriginConfig {
  fn default() -> Self {
    Self {
      base_url: "https://m.xsw.tw".to_string(),
      timeout_secs: 10,
      user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
                   Chrome/120.0 Safari/537.36"
        .to_string(),
      finished_status: "已完成".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  pub level: String,
  /// Write daily-rolling log files here in addition to stderr
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

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./novelcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/novelcache/config.yaml
  ///
  /// Without any file every setting takes its default.
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
    let local = PathBuf::from("novelcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("novelcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(Self {
      source: Some(path.to_path_buf()),
      ..config
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty document means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.jobs.workers, 2);
    assert_eq!(config.jobs.cooldown_secs, 300);
    assert_eq!(config.cache.ttl_secs, 900);
    assert_eq!(config.cache.chapter_batch_size, 100);
    assert_eq!(config.periodic_sync.interval_hours, 6);
    assert_eq!(config.origin.finished_status, "已完成");
    assert!(config.rate_limit.whitelist.ips.is_empty());
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let yaml = r#"
jobs:
  workers: 4
daily_sync:
  hour: 3
  minute: 30
rate_limit:
  whitelist:
    - 127.0.0.1
    - 10.0.0.0/8
    - not-an-ip
store:
  path: /tmp/novelcache-test.db
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.jobs.workers, 4);
    assert_eq!(config.jobs.rate_limit_ms, 1000);
    assert_eq!((config.daily_sync.hour, config.daily_sync.minute), (3, 30));
    assert_eq!(config.daily_sync.slow_rate_limit_ms, 5000);
    assert_eq!(config.rate_limit.whitelist.ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    assert_eq!(config.rate_limit.whitelist.networks.len(), 1);
    assert_eq!(config.rate_limit.whitelist.invalid, vec!["not-an-ip".to_string()]);
    assert_eq!(
      config.store.resolve_path().unwrap(),
      PathBuf::from("/tmp/novelcache-test.db")
    );
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("novelcache.yaml");
    std::fs::write(&path, "origin:\n  base_url: http://localhost:9000\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.source.as_deref(), Some(path.as_path()));
    assert_eq!(config.origin.base_url, "http://localhost:9000");
    assert_eq!(config.origin.timeout_secs, 10);
  }
}
