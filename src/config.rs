//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::TokenBucketSettings;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Which counter store to use
    #[serde(default)]
    pub store: StoreBackend,

    /// Redis connection configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Limits applied by the admission middleware
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Token bucket shape
    #[serde(default)]
    pub token_bucket: TokenBucketConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local store; limits are not shared between instances
    Memory,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Budget for one rate limit check in milliseconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            check_timeout_ms: default_check_timeout(),
        }
    }
}

impl ServerConfig {
    /// Budget for one rate limit check.
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_check_timeout() -> u64 {
    250
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl RedisConfig {
    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

/// Limits applied by the admission middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Headers whose values identify a client
    #[serde(default = "default_client_headers")]
    pub client_headers: Vec<String>,

    /// Requests permitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            client_headers: default_client_headers(),
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl LimitsConfig {
    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_client_headers() -> Vec<String> {
    vec!["X-Client-ID".to_string()]
}

fn default_max_requests() -> u64 {
    5
}

fn default_window_secs() -> u64 {
    60
}

/// Token bucket shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Bucket capacity
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,

    /// Seconds between refills
    #[serde(default = "default_refill_interval")]
    pub refill_interval_secs: u64,

    /// Tokens added per refill
    #[serde(default = "default_refill_amount")]
    pub refill_amount: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_interval_secs: default_refill_interval(),
            refill_amount: default_refill_amount(),
        }
    }
}

impl TokenBucketConfig {
    /// Settings for [`crate::ratelimit::TokenBucketLimiter`].
    pub fn settings(&self) -> TokenBucketSettings {
        TokenBucketSettings {
            max_tokens: self.max_tokens,
            refill_interval: Duration::from_secs(self.refill_interval_secs),
            refill_amount: self.refill_amount,
        }
    }
}

fn default_max_tokens() -> u64 {
    10
}

fn default_refill_interval() -> u64 {
    60
}

fn default_refill_amount() -> u64 {
    5
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional file with `TURNSTILE__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TURNSTILE")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no strategy can work with.
    pub fn validate(&self) -> Result<()> {
        if self.limits.client_headers.iter().all(|h| h.trim().is_empty()) {
            return Err(TurnstileError::Config(
                "limits.client_headers must name at least one header".to_string(),
            ));
        }
        if self.limits.max_requests == 0 {
            return Err(TurnstileError::Config(
                "limits.max_requests must be positive".to_string(),
            ));
        }
        if self.limits.window_secs == 0 {
            return Err(TurnstileError::Config(
                "limits.window_secs must be positive".to_string(),
            ));
        }
        if self.token_bucket.max_tokens == 0 || self.token_bucket.refill_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "token_bucket.max_tokens and refill_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
