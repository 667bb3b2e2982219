use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  /// Client-side request limiter; disabled when absent
  pub rate_limit: Option<RateLimitConfig>,
  #[serde(default)]
  pub stats: StatsConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  pub messaging: Option<MessagingConfig>,
  pub payments: Option<PaymentsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL, e.g. https://abc.supabase.co
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Seconds before a cached read is refreshed
  pub stale_after_secs: u64,
  /// Seconds before a cached read is dropped
  pub expire_after_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: 300,
      expire_after_secs: 1800,
    }
  }
}

impl CacheConfig {
  pub fn stale_after(&self) -> Duration {
    Duration::from_secs(self.stale_after_secs)
  }

  pub fn expire_after(&self) -> Duration {
    Duration::from_secs(self.expire_after_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Additional attempts after the first failure
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// Upper bound on time spent waiting out rate limits for one request
  pub max_rate_limit_wait_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 2,
      base_delay_ms: 250,
      max_delay_ms: 5_000,
      max_rate_limit_wait_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
  pub max_requests: u32,
  pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
  pub window_secs: u64,
}

impl Default for StatsConfig {
  fn default() -> Self {
    Self { window_secs: 60 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// SQLite file for pending mutations (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// Replay pending mutations on this interval while a command runs
  pub replay_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
  pub url: String,
  #[serde(default = "default_min_interval_ms")]
  pub min_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 {
  1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
  /// Base URL of the serverless functions, e.g. https://abc.supabase.co/functions/v1/
  pub functions_url: String,
  #[serde(default = "default_checkout_function")]
  pub checkout_function: String,
  pub success_url: String,
  pub cancel_url: String,
}

fn default_checkout_function() -> String {
  "create-checkout-session".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bizsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bizsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/bizsync/config.yaml\n\
                 with at least a `backend.url` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("bizsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("bizsync").join("config.yaml");
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
    if config.cache.expire_after_secs < config.cache.stale_after_secs {
      return Err(eyre!(
        "cache.expire_after_secs ({}) must not be shorter than cache.stale_after_secs ({})",
        config.cache.expire_after_secs,
        config.cache.stale_after_secs
      ));
    }
    Ok(config)
  }

  /// Directory for the queue database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("bizsync"))
  }

  /// Get the project API key from environment variables.
  ///
  /// Checks BIZSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("BIZSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set BIZSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Signed-in user's access token, if any.
  pub fn get_access_token() -> Option<String> {
    std::env::var("BIZSYNC_ACCESS_TOKEN").ok()
  }

  pub fn get_messaging_token() -> Result<String> {
    std::env::var("BIZSYNC_MESSAGING_TOKEN").map_err(|_| {
      eyre!("Messaging token not found. Set BIZSYNC_MESSAGING_TOKEN environment variable.")
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("backend:\n  url: https://abc.supabase.co\n").unwrap();
    assert_eq!(config.backend.timeout_secs, 30);
    assert_eq!(config.cache.stale_after(), Duration::from_secs(300));
    assert_eq!(config.retry.max_retries, 2);
    assert_eq!(config.retry.max_rate_limit_wait_ms, 10_000);
    assert_eq!(config.stats.window_secs, 60);
    assert!(config.rate_limit.is_none());
    assert!(config.messaging.is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
backend:
  url: https://abc.supabase.co
  timeout_secs: 10
cache:
  stale_after_secs: 30
  expire_after_secs: 600
retry:
  max_retries: 4
rate_limit:
  max_requests: 20
  window_secs: 10
queue:
  replay_interval_secs: 15
messaging:
  url: https://graph.example.com/v1/
payments:
  functions_url: https://abc.supabase.co/functions/v1/
  success_url: https://app.example.com/ok
  cancel_url: https://app.example.com/cancel
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.retry.max_retries, 4);
    assert_eq!(config.retry.base_delay_ms, 250);
    assert_eq!(config.rate_limit.unwrap().max_requests, 20);
    assert_eq!(config.queue.replay_interval_secs, Some(15));
    assert_eq!(config.messaging.unwrap().min_interval_ms, 1_000);
    assert_eq!(
      config.payments.unwrap().checkout_function,
      "create-checkout-session"
    );
  }

  #[test]
  fn test_expire_shorter_than_stale_is_rejected() {
    let yaml = "backend:\n  url: x\ncache:\n  stale_after_secs: 60\n  expire_after_secs: 10\n";
    assert!(Config::from_yaml(yaml).is_err());
  }
}
