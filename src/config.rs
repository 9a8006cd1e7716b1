//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::activelimit::CounterScope;
use crate::error::{FloodgateError, Result};

/// Prefix for environment variable overrides, e.g. `FLOODGATE__RATE_LIMIT__RATE=50`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Active request limiting configuration
    #[serde(default)]
    pub active_limit: ActiveLimitConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process counters, for single-instance deployments
    #[default]
    Memory,
    /// Redis counters shared by every instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the Redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key
    #[serde(default = "default_store_key_prefix")]
    pub key_prefix: String,

    /// Expiration of active counters in milliseconds, refreshed on every acquire
    #[serde(default)]
    pub counter_ttl_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_store_key_prefix(),
            counter_ttl_ms: None,
        }
    }
}

impl StoreConfig {
    /// Expiration of active counters, if configured.
    pub fn counter_ttl(&self) -> Option<Duration> {
        self.counter_ttl_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

fn default_store_key_prefix() -> String {
    "floodgate".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether the rate limit middleware is installed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum requests admitted per window
    #[serde(default = "default_rate")]
    pub rate: u64,

    /// Window length in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Prefix of the per-client limiting key
    #[serde(default = "default_ip_key_prefix")]
    pub key_prefix: String,

    /// Trust `X-Forwarded-For`/`X-Real-IP` for the client address.
    ///
    /// Only enable behind a reverse proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            rate: default_rate(),
            interval_ms: default_interval_ms(),
            key_prefix: default_ip_key_prefix(),
            trust_proxy: false,
        }
    }
}

impl RateLimitConfig {
    /// Window length.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_rate() -> u64 {
    100
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_ip_key_prefix() -> String {
    "ip-limiter".to_string()
}

/// Active request limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveLimitConfig {
    /// Whether requests are counted; when false every request is admitted
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum requests in flight per key
    #[serde(default = "default_max_active")]
    pub max_active: i64,

    /// Limiting key shared by every request
    #[serde(default = "default_active_key")]
    pub key: String,

    /// Counter scope for the in-process limiter
    #[serde(default)]
    pub scope: CounterScope,
}

impl Default for ActiveLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_active: default_max_active(),
            key: default_active_key(),
            scope: CounterScope::default(),
        }
    }
}

fn default_max_active() -> i64 {
    100
}

fn default_active_key() -> String {
    "active-limiter".to_string()
}

impl FloodgateConfig {
    /// Load configuration from a file, with `FLOODGATE__*` environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(env_source())
            .build()?;

        let config: FloodgateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults and environment overrides only.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(env_source()).build()?;

        let config: FloodgateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make a limiter misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.enabled && self.rate_limit.interval_ms == 0 {
            return Err(FloodgateError::Config(
                "rate_limit.interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.active_limit.max_active < 0 {
            return Err(FloodgateError::Config(
                "active_limit.max_active must not be negative".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(FloodgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
