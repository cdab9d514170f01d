//! Error types for the adaptive cache
//!
//! The cache surfaces a small, closed taxonomy:
//!
//! | Variant | Raised by | Surfaced to callers |
//! |---------|-----------|---------------------|
//! | `FetchFailed` | a producer returned an error on a cache miss | yes, unless a stale fallback exists |
//! | `UnknownResource` | `ResourceLoader::load` with an unregistered name | always |
//! | `CacheCorruption` | an internal invariant check | only from `check_integrity` |
//! | `MetricsSinkUnavailable` | a metrics sink | never from cache operations |
//! | `Config` | configuration loading / validation | yes |
//! | `ShuttingDown` / `ShutdownTimeout` | lifecycle | yes |
//!
//! Errors produced by background revalidation are recorded as metrics and
//! logged; they never reach a caller because that caller already received a
//! value.
//!
//! All variants implement [`ErrorClassification`] so hosts can make uniform
//! retry and alerting decisions.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Type-erased error returned by producers
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Standard result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the cache
///
/// `CacheError` is `Clone` so that one fetch outcome can be handed to several
/// observers; producer errors are kept behind an `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The producer for `key` failed and no stale value was available
    #[error("fetch failed for key '{key}': {source}")]
    FetchFailed {
        /// Cache key whose producer failed
        key: String,
        /// Underlying producer error
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },

    /// A named-resource request used a name absent from the registry
    #[error("unknown resource: {name}")]
    UnknownResource {
        /// Requested resource name
        name: String,
    },

    /// An internal invariant check failed
    #[error("cache corruption detected for key '{key}': {detail}")]
    CacheCorruption {
        /// Key the inconsistency was found on
        key: String,
        /// What was inconsistent
        detail: String,
    },

    /// Forwarding metrics to an external sink failed
    #[error("metrics sink '{sink}' unavailable: {message}")]
    MetricsSinkUnavailable {
        /// Sink name
        sink: String,
        /// Failure description
        message: String,
    },

    /// Invalid or unreadable configuration
    #[error("configuration error{}: {message}", field.as_ref().map(|f| format!(" in '{f}'")).unwrap_or_default())]
    Config {
        /// Failure description
        message: String,
        /// Offending field, when known
        field: Option<String>,
    },

    /// The cache has been shut down and accepts no new work
    #[error("cache is shutting down")]
    ShuttingDown,

    /// Background tasks did not finish within the shutdown timeout
    #[error("{pending} background task(s) still running after {timeout:?}")]
    ShutdownTimeout {
        /// Tasks still running when the timeout elapsed
        pending: usize,
        /// Configured shutdown timeout
        timeout: Duration,
    },
}

impl CacheError {
    /// Wrap a producer failure for `key`
    pub fn fetch_failed(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let source: BoxError = source.into();
        Self::FetchFailed { key: key.into(), source: Arc::from(source) }
    }

    /// Unknown named resource
    pub fn unknown_resource(name: impl Into<String>) -> Self {
        Self::UnknownResource { name: name.into() }
    }

    /// Internal invariant violation
    pub fn corruption(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::CacheCorruption { key: key.into(), detail: detail.into() }
    }

    /// Metrics sink failure
    pub fn sink_unavailable(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MetricsSinkUnavailable { sink: sink.into(), message: message.into() }
    }

    /// Configuration error without a specific field
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Configuration error for a specific field
    pub fn config_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Cache key this error concerns, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::FetchFailed { key, .. } | Self::CacheCorruption { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Stable label suitable for metrics and logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchFailed { .. } => "fetch_failed",
            Self::UnknownResource { .. } => "unknown_resource",
            Self::CacheCorruption { .. } => "cache_corruption",
            Self::MetricsSinkUnavailable { .. } => "metrics_sink_unavailable",
            Self::Config { .. } => "config",
            Self::ShuttingDown => "shutting_down",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
        }
    }
}

/// Classification of errors by their characteristics
///
/// Mirrors the classification used across the host workspace so cache errors
/// plug into the same retry and alerting decisions.
pub trait ErrorClassification {
    /// Check if this error is retryable
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl ErrorClassification for CacheError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::MetricsSinkUnavailable { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::FetchFailed { .. } | Self::MetricsSinkUnavailable { .. } => {
                ErrorSeverity::Warning
            }
            Self::UnknownResource { .. } | Self::Config { .. } => ErrorSeverity::Error,
            Self::CacheCorruption { .. } => ErrorSeverity::Critical,
            Self::ShuttingDown => ErrorSeverity::Info,
            Self::ShutdownTimeout { .. } => ErrorSeverity::Warning,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::CacheCorruption { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}
