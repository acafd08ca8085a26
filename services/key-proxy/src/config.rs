//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Keys come from the API_KEYS env var, else keys_file, else the inline
//! `keys` list. Prefer the first two so credentials stay out of the TOML.

use common::ApiKey;
use key_pool::{PoolConfig, RetryPolicy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Key pool settings
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    /// Inline keys. Replaced by the resolved key set after `Config::load`.
    #[serde(default)]
    pub keys: Vec<ApiKey>,
    /// File with one key per line; blank lines and `#` comments skipped.
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
}

/// Backoff between rate-limited attempts
#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_rate_limit_cooldown() -> u64 {
    60
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    20
}

fn default_max_attempts() -> u32 {
    5
}

fn default_jitter() -> bool {
    true
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            keys_file: None,
            tick_interval_ms: default_tick_interval_ms(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl PoolSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Key resolution order:
    /// 1. API_KEYS env var (comma separated)
    /// 2. keys_file path from config
    /// 3. inline keys
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Validate upstream_url is a valid URL with http(s) scheme
        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.tick_interval_ms == 0 {
            return Err(common::Error::Config(
                "tick_interval_ms must be greater than 0".into(),
            ));
        }

        if config.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if config.retry.base_delay_ms > config.retry.max_delay_secs.saturating_mul(1000) {
            return Err(common::Error::Config(format!(
                "base_delay_ms ({}) must not exceed max_delay_secs ({})",
                config.retry.base_delay_ms, config.retry.max_delay_secs
            )));
        }

        // Resolve keys: env var takes precedence over file, file over inline
        let inline = std::mem::take(&mut config.pool.keys);
        config.pool.keys = if let Ok(raw) = std::env::var("API_KEYS") {
            info!("using keys from API_KEYS");
            parse_keys(raw.split(','))
        } else if let Some(ref keys_file) = config.pool.keys_file {
            let raw = std::fs::read_to_string(keys_file).map_err(|source| {
                common::Error::KeysFile {
                    path: keys_file.clone(),
                    source,
                }
            })?;
            info!(path = %keys_file.display(), "using keys from keys_file");
            parse_keys(raw.lines().filter(|line| !line.trim_start().starts_with('#')))
        } else {
            parse_keys(inline.iter().map(ApiKey::expose))
        };

        Ok(config)
    }

    /// Backoff policy; the penalty for a rate-limited key follows the pool's
    /// rate-limit cooldown.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            max_attempts: self.retry.max_attempts,
            penalty: Duration::from_secs(self.pool.rate_limit_cooldown_secs),
            jitter: self.retry.jitter,
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-proxy.toml")
    }
}

/// Trim, drop blanks, keep first occurrence order.
fn parse_keys<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<ApiKey> {
    let mut keys: Vec<ApiKey> = Vec::new();
    for key in raw.map(str::trim).filter(|k| !k.is_empty()) {
        if !keys.iter().any(|k| k.expose() == key) {
            keys.push(ApiKey::from(key));
        }
    }
    keys
}
