//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (QUERYGATE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [gateway]
//! pool_size = 8
//! default_timeout_secs = 20
//!
//! [cache]
//! dir = "/var/lib/querygate/cache"
//! summary_token_threshold = 4000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! QUERYGATE_GATEWAY__POOL_SIZE=2
//! QUERYGATE_ENGINE__ENDPOINT=http://graph:7878/query
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Query execution gateway settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Number of concurrent calls allowed into the engine
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Timeout applied when a query carries none
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Requested timeouts above this are clamped
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Maximum query text length in bytes
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Keywords the downstream engine cannot execute
    #[serde(default = "default_denied_constructs")]
    pub denied_constructs: Vec<String>,

    /// Maximum rows returned per result. 0 = unlimited.
    #[serde(default)]
    pub max_result_rows: usize,

    /// Minimum remaining budget needed to attempt the aggregation fallback
    #[serde(default = "default_fallback_min_budget_ms")]
    pub fallback_min_budget_ms: u64,
}

/// Adaptive result cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for the filesystem blob store
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Warn when a single entry is larger than this
    #[serde(default = "default_entry_warn_bytes")]
    pub entry_warn_bytes: u64,

    /// Warn when all entries together are larger than this
    #[serde(default = "default_total_warn_bytes")]
    pub total_warn_bytes: u64,

    /// Rows kept in a summary
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,

    /// Results estimated above this many tokens are summarized
    #[serde(default = "default_summary_token_threshold")]
    pub summary_token_threshold: u64,

    /// Size heuristic divisor (serialized bytes per token)
    #[serde(default = "default_bytes_per_token")]
    pub bytes_per_token: u64,

    /// Background cleanup removes entries older than this. 0 = disabled.
    #[serde(default)]
    pub max_age_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

/// Token bucket settings for downstream metered calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Window used to compute the observed rate
    #[serde(default = "default_stats_window_secs")]
    pub stats_window_secs: u64,

    /// Acquisition timestamps kept for statistics
    #[serde(default = "default_stats_history")]
    pub stats_history: usize,
}

/// Pattern ledger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Records kept in memory (oldest dropped first)
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Optional JSON-lines file records are appended to
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// SPARQL endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// HTTP request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_pool_size() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
/// Upper bound for any query budget, in seconds
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

fn default_max_timeout_secs() -> u64 {
    300
}
fn default_max_query_length() -> usize {
    10_000
}
fn default_denied_constructs() -> Vec<String> {
    ["SERVICE", "LOAD", "CLEAR", "DROP", "CREATE", "INSERT", "DELETE"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_fallback_min_budget_ms() -> u64 {
    250
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}
fn default_entry_warn_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_total_warn_bytes() -> u64 {
    500 * 1024 * 1024
}
fn default_sample_rows() -> usize {
    10
}
fn default_summary_token_threshold() -> u64 {
    5000
}
fn default_bytes_per_token() -> u64 {
    4
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_capacity() -> u32 {
    10
}
fn default_requests_per_minute() -> u32 {
    50
}
fn default_stats_window_secs() -> u64 {
    60
}
fn default_stats_history() -> usize {
    1000
}
fn default_retention() -> usize {
    100
}
fn default_endpoint() -> String {
    "http://localhost:7878/query".to_string()
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (QUERYGATE_* prefix)
    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("QUERYGATE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("QUERYGATE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (no env overlay)
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.gateway.pool_size == 0 {
            return Err(invalid("gateway.pool_size", "must be at least 1"));
        }
        if self.gateway.default_timeout_secs == 0 {
            return Err(invalid("gateway.default_timeout_secs", "must be at least 1"));
        }
        if self.gateway.max_timeout_secs < self.gateway.default_timeout_secs {
            return Err(invalid(
                "gateway.max_timeout_secs",
                "must not be below default_timeout_secs",
            ));
        }
        if self.gateway.max_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(invalid("gateway.max_timeout_secs", "must not exceed 86400"));
        }
        if self.gateway.max_query_length == 0 {
            return Err(invalid("gateway.max_query_length", "must be at least 1"));
        }
        if self.cache.bytes_per_token == 0 {
            return Err(invalid("cache.bytes_per_token", "must be at least 1"));
        }
        if self.rate_limit.capacity == 0 {
            return Err(invalid("rate_limit.capacity", "must be at least 1"));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(invalid("rate_limit.requests_per_minute", "must be at least 1"));
        }
        if self.ledger.retention == 0 {
            return Err(invalid("ledger.retention", "must be at least 1"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(invalid("logging.format", "expected 'text' or 'json'"));
        }
        Ok(())
    }
}

impl GatewayConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn fallback_min_budget(&self) -> Duration {
        Duration::from_millis(self.fallback_min_budget_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            pool_size: default_pool_size(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            max_query_length: default_max_query_length(),
            denied_constructs: default_denied_constructs(),
            max_result_rows: 0,
            fallback_min_budget_ms: default_fallback_min_budget_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            dir: default_cache_dir(),
            entry_warn_bytes: default_entry_warn_bytes(),
            total_warn_bytes: default_total_warn_bytes(),
            sample_rows: default_sample_rows(),
            summary_token_threshold: default_summary_token_threshold(),
            bytes_per_token: default_bytes_per_token(),
            max_age_secs: 0,
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            capacity: default_capacity(),
            requests_per_minute: default_requests_per_minute(),
            stats_window_secs: default_stats_window_secs(),
            stats_history: default_stats_history(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            retention: default_retention(),
            path: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            endpoint: default_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}
