//! Configuration for Graph traffic control.
//!
//! Values can be deserialized directly, built in code, or read from any
//! [`ConfigSource`] through named options.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{GraphResult, GraphSyncError};

/// Largest number of sub-requests Graph accepts in one `$batch` call.
pub const GRAPH_BATCH_LIMIT: usize = 20;

/// Named options understood by [`GraphSyncConfig::from_source`].
pub mod options {
    pub const GRAPH_BASE_URL: &str = "graph_base_url";
    pub const RATE_LIMIT_CAPACITY: &str = "rate_limit_capacity";
    pub const RATE_LIMIT_REFILL: &str = "rate_limit_refill";
    pub const RATE_LIMIT_WINDOW_SECS: &str = "rate_limit_window_secs";
    pub const RATE_LIMIT_MIN_WAIT_MS: &str = "rate_limit_min_wait_ms";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const BASE_DELAY_SECS: &str = "base_delay_secs";
    pub const BATCH_BACKOFF_SECS: &str = "batch_backoff_secs";
    pub const MAX_OWNERS: &str = "max_owners";
    pub const MAX_PARALLELISM: &str = "max_parallelism";
    pub const REQUEST_TIMEOUT_SECS: &str = "request_timeout_secs";
}

/// Configuration for rate limiting, retries, batching and reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSyncConfig {
    /// Graph endpoint including the API version.
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,

    /// Token bucket capacity (default: 2000).
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: u32,

    /// Tokens granted per window (default: same as capacity).
    #[serde(default)]
    pub rate_limit_refill: Option<u32>,

    /// Length of one rate limit window in seconds (default: 60).
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Shortest sleep while waiting for tokens, in milliseconds (default: 50).
    #[serde(default = "default_rate_limit_min_wait_ms")]
    pub rate_limit_min_wait_ms: u64,

    /// Operations per `$batch` call (default: 20, the Graph maximum).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts for one unit of work, and passes for one batch (default: 7).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff step for single calls in seconds (default: 5).
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Linear backoff step between batch passes in seconds (default: 8).
    #[serde(default = "default_batch_backoff_secs")]
    pub batch_backoff_secs: u64,

    /// Provider maximum of owners per entity (default: 100).
    #[serde(default = "default_max_owners")]
    pub max_owners: usize,

    /// Entities reconciled concurrently (default: 4).
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// HTTP request timeout in seconds (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_rate_limit_capacity() -> u32 {
    2000
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_min_wait_ms() -> u64 {
    50
}

fn default_batch_size() -> usize {
    GRAPH_BATCH_LIMIT
}

fn default_max_retries() -> u32 {
    7
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_batch_backoff_secs() -> u64 {
    8
}

fn default_max_owners() -> usize {
    100
}

fn default_max_parallelism() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GraphSyncConfig {
    fn default() -> Self {
        Self {
            graph_base_url: default_graph_base_url(),
            rate_limit_capacity: default_rate_limit_capacity(),
            rate_limit_refill: None,
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_min_wait_ms: default_rate_limit_min_wait_ms(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            batch_backoff_secs: default_batch_backoff_secs(),
            max_owners: default_max_owners(),
            max_parallelism: default_max_parallelism(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl GraphSyncConfig {
    /// Creates a new configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration with zero backoff, for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            rate_limit_capacity: 1000,
            rate_limit_window_secs: 1,
            rate_limit_min_wait_ms: 1,
            max_retries: 3,
            base_delay_secs: 0,
            batch_backoff_secs: 0,
            ..Self::default()
        }
    }

    /// Tokens added per window.
    #[must_use]
    pub fn refill_quantity(&self) -> u32 {
        self.rate_limit_refill.unwrap_or(self.rate_limit_capacity)
    }

    /// Length of one rate limit window.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> GraphResult<()> {
        if self.rate_limit_capacity == 0 {
            return Err(GraphSyncError::Config("rate_limit_capacity must be > 0".into()));
        }
        if self.refill_quantity() == 0 {
            return Err(GraphSyncError::Config("rate_limit_refill must be > 0".into()));
        }
        if self.rate_limit_window_secs == 0 {
            return Err(GraphSyncError::Config("rate_limit_window_secs must be > 0".into()));
        }
        if !(1..=GRAPH_BATCH_LIMIT).contains(&self.batch_size) {
            return Err(GraphSyncError::Config(format!(
                "batch_size must be in range [1, {GRAPH_BATCH_LIMIT}]"
            )));
        }
        // A batch envelope costs one token on top of its items.
        if (self.batch_size as u64) + 1 > u64::from(self.rate_limit_capacity) {
            return Err(GraphSyncError::Config(
                "rate_limit_capacity must cover batch_size + 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(GraphSyncError::Config("max_retries must be > 0".into()));
        }
        if self.max_owners == 0 {
            return Err(GraphSyncError::Config("max_owners must be > 0".into()));
        }
        if self.max_parallelism == 0 {
            return Err(GraphSyncError::Config("max_parallelism must be > 0".into()));
        }
        url::Url::parse(&self.graph_base_url)?;
        Ok(())
    }

    /// Reads named options from `source`, falling back to defaults.
    pub fn from_source(source: &dyn ConfigSource) -> GraphResult<Self> {
        let defaults = Self::default();
        let config = Self {
            graph_base_url: source
                .get(options::GRAPH_BASE_URL)
                .unwrap_or(defaults.graph_base_url),
            rate_limit_capacity: parse_option(source, options::RATE_LIMIT_CAPACITY)?
                .unwrap_or(defaults.rate_limit_capacity),
            rate_limit_refill: parse_option(source, options::RATE_LIMIT_REFILL)?,
            rate_limit_window_secs: parse_option(source, options::RATE_LIMIT_WINDOW_SECS)?
                .unwrap_or(defaults.rate_limit_window_secs),
            rate_limit_min_wait_ms: parse_option(source, options::RATE_LIMIT_MIN_WAIT_MS)?
                .unwrap_or(defaults.rate_limit_min_wait_ms),
            batch_size: parse_option(source, options::BATCH_SIZE)?.unwrap_or(defaults.batch_size),
            max_retries: parse_option(source, options::MAX_RETRIES)?
                .unwrap_or(defaults.max_retries),
            base_delay_secs: parse_option(source, options::BASE_DELAY_SECS)?
                .unwrap_or(defaults.base_delay_secs),
            batch_backoff_secs: parse_option(source, options::BATCH_BACKOFF_SECS)?
                .unwrap_or(defaults.batch_backoff_secs),
            max_owners: parse_option(source, options::MAX_OWNERS)?.unwrap_or(defaults.max_owners),
            max_parallelism: parse_option(source, options::MAX_PARALLELISM)?
                .unwrap_or(defaults.max_parallelism),
            request_timeout_secs: parse_option(source, options::REQUEST_TIMEOUT_SECS)?
                .unwrap_or(defaults.request_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_option<T: std::str::FromStr>(
    source: &dyn ConfigSource,
    name: &str,
) -> GraphResult<Option<T>> {
    match source.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| GraphSyncError::Config(format!("invalid value for {name}: {raw:?}"))),
    }
}

/// Source of named configuration options, supplied by the host.
pub trait ConfigSource: Send + Sync {
    /// Returns the raw value of `name`, if set.
    fn get(&self, name: &str) -> Option<String>;
}

/// In-memory option map.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    values: HashMap<String, String>,
}

impl MapConfigSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.values.insert(name.into(), value.to_string());
        self
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Reads options from environment variables named `<PREFIX><OPTION>` in upper case.
#[derive(Debug, Clone)]
pub struct EnvConfigSource {
    prefix: String,
}

impl EnvConfigSource {
    /// Default variable prefix.
    pub const DEFAULT_PREFIX: &'static str = "XAVYO_GRAPH_";

    /// Creates a source using [`Self::DEFAULT_PREFIX`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    /// Creates a source with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EnvConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for EnvConfigSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, name.to_ascii_uppercase())).ok()
    }
}
