//! Cache configuration types, builder and loaders
//!
//! Capacity, default TTL and preload delays are deployment parameters, not
//! constants. A configuration can be built in code, parsed from TOML or JSON,
//! or overlaid from environment variables.
//!
//! ## Environment Variables
//! - `ADAPTIVE_CACHE_MAX_ENTRIES`: maximum number of live entries
//! - `ADAPTIVE_CACHE_DEFAULT_TTL_MS`: default TTL in milliseconds (0 = none)
//! - `ADAPTIVE_CACHE_ALLOW_STALE`: retain expired entries for stale serving
//! - `ADAPTIVE_CACHE_RESOURCE_TTL_MS`: TTL for named resources in milliseconds
//! - `ADAPTIVE_CACHE_TRACK_METRICS`: enable metric accumulation

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::preload::Priority;

/// Default maximum number of entries
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Default entry time-to-live (15 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Default time-to-live for named resources (1 hour)
pub const DEFAULT_RESOURCE_TTL: Duration = Duration::from_secs(60 * 60);

/// Default time allowed for background tasks to drain on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay applied before a preload runs, per priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadDelays {
    /// Delay for `Priority::High`
    #[serde(with = "duration_millis")]
    pub high: Duration,
    /// Delay for `Priority::Medium`
    #[serde(with = "duration_millis")]
    pub medium: Duration,
    /// Delay for `Priority::Low`
    #[serde(with = "duration_millis")]
    pub low: Duration,
}

impl Default for PreloadDelays {
    fn default() -> Self {
        Self {
            high: Duration::ZERO,
            medium: Duration::from_millis(100),
            low: Duration::from_millis(500),
        }
    }
}

impl PreloadDelays {
    /// No delay for any priority
    pub fn immediate() -> Self {
        Self { high: Duration::ZERO, medium: Duration::ZERO, low: Duration::ZERO }
    }

    /// Delay for the given priority
    pub fn for_priority(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

/// Configuration for cache behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,

    /// TTL applied when a resolve call does not give one (None = no expiry)
    #[serde(with = "option_duration_millis")]
    pub default_ttl: Option<Duration>,

    /// Keep expired entries for stale serving and error fallback until they
    /// are replaced, evicted or invalidated
    pub allow_stale: bool,

    /// Preload delay per priority
    pub preload_delays: PreloadDelays,

    /// TTL for entries loaded through the named-resource loader
    #[serde(with = "option_duration_millis")]
    pub resource_ttl: Option<Duration>,

    /// How long `shutdown` waits for background tasks
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Whether to accumulate metrics
    pub track_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl: Some(DEFAULT_TTL),
            allow_stale: true,
            preload_delays: PreloadDelays::default(),
            resource_ttl: Some(DEFAULT_RESOURCE_TTL),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            track_metrics: true,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Quick preset for a bounded cache with the default TTL
    ///
    /// # Example
    /// ```
    /// use adaptive_cache::CacheConfig;
    ///
    /// let config = CacheConfig::lru(250);
    /// assert_eq!(config.max_entries, 250);
    /// ```
    pub fn lru(max_entries: usize) -> Self {
        Self { max_entries, ..Self::default() }
    }

    /// Combined TTL + capacity preset
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    ///
    /// use adaptive_cache::CacheConfig;
    ///
    /// let config = CacheConfig::ttl_lru(Duration::from_secs(60), 100);
    /// assert_eq!(config.default_ttl, Some(Duration::from_secs(60)));
    /// ```
    pub fn ttl_lru(ttl: Duration, max_entries: usize) -> Self {
        Self { max_entries, default_ttl: Some(ttl), ..Self::default() }
    }

    /// Check the configuration for values the cache cannot honor
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_entries == 0 {
            return Err(CacheError::config_field("max_entries", "must be greater than zero"));
        }
        Ok(())
    }

    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| CacheError::config(format!("Invalid TOML format: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document
    pub fn from_json_str(contents: &str) -> CacheResult<Self> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| CacheError::config(format!("Invalid JSON format: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, format detected by extension
    pub fn load_from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CacheError::config(format!("Config file not found: {}", path.display())));
        }

        tracing::info!(path = %path.display(), "Loading cache configuration from file");

        let contents = std::fs::read_to_string(path)
            .map_err(|e| CacheError::config(format!("Failed to read config file: {e}")))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("toml") {
            "toml" => Self::from_toml_str(&contents),
            "json" => Self::from_json_str(&contents),
            other => Err(CacheError::config(format!("Unsupported config format: {other}"))),
        }
    }

    /// Overlay `ADAPTIVE_CACHE_*` environment variables on the defaults
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlay variables resolved by `lookup` on the defaults
    ///
    /// `from_env` delegates here; tests pass a map-backed lookup instead of
    /// mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("ADAPTIVE_CACHE_MAX_ENTRIES") {
            config.max_entries = parse_field("max_entries", &raw)?;
        }
        if let Some(raw) = lookup("ADAPTIVE_CACHE_DEFAULT_TTL_MS") {
            config.default_ttl = non_zero_millis(parse_field("default_ttl", &raw)?);
        }
        if let Some(raw) = lookup("ADAPTIVE_CACHE_ALLOW_STALE") {
            config.allow_stale = parse_bool("allow_stale", &raw)?;
        }
        if let Some(raw) = lookup("ADAPTIVE_CACHE_RESOURCE_TTL_MS") {
            config.resource_ttl = non_zero_millis(parse_field("resource_ttl", &raw)?);
        }
        if let Some(raw) = lookup("ADAPTIVE_CACHE_TRACK_METRICS") {
            config.track_metrics = parse_bool("track_metrics", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_field<T>(field: &str, raw: &str) -> CacheResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| CacheError::config_field(field, format!("invalid value '{raw}': {e}")))
}

fn parse_bool(field: &str, raw: &str) -> CacheResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CacheError::config_field(field, format!("invalid boolean '{raw}'"))),
    }
}

fn non_zero_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

/// Builder for CacheConfig with fluent API
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of entries
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.config.max_entries = max_entries;
        self
    }

    /// Set the default time-to-live
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = Some(ttl);
        self
    }

    /// Disable time-based expiry by default
    pub fn no_default_ttl(mut self) -> Self {
        self.config.default_ttl = None;
        self
    }

    /// Retain expired entries for stale serving
    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.config.allow_stale = allow;
        self
    }

    /// Set preload delays
    pub fn preload_delays(mut self, delays: PreloadDelays) -> Self {
        self.config.preload_delays = delays;
        self
    }

    /// Set named-resource TTL
    pub fn resource_ttl(mut self, ttl: Duration) -> Self {
        self.config.resource_ttl = Some(ttl);
        self
    }

    /// Set shutdown drain timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Enable or disable metrics tracking
    pub fn track_metrics(mut self, enabled: bool) -> Self {
        self.config.track_metrics = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

/// Serde helpers encoding `Duration` as milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize milliseconds (u64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde helpers for optional durations; `0` and absent both mean `None`
pub mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize as milliseconds, `None` as `0`
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        let millis = duration.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        serializer.serialize_u64(millis)
    }

    /// Deserialize milliseconds, mapping `0` to `None`
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?.unwrap_or(0);
        Ok(super::non_zero_millis(millis))
    }
}
