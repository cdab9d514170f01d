//! # Adaptive Cache
//!
//! An in-process cache placed between application code and slow or
//! rate-limited producers. It bounds memory with strict LRU eviction, expires
//! entries lazily by TTL, collapses concurrent refreshes of the same key into
//! one, serves stale values while revalidating in the background, and
//! invalidates related entries in bulk by tag.
//!
//! ## Modules
//! - [`clock`]: time abstraction, with a mock clock for tests
//! - [`config`]: capacity, TTL and preload settings with file/env loaders
//! - [`error`]: error taxonomy and classification
//! - [`store`]: arena-backed LRU + TTL store and its tag index
//! - [`inflight`]: per-key registry of running fetches
//! - [`coordinator`]: [`AdaptiveCache`], the resolve/invalidate surface
//! - [`preload`]: delayed speculative population
//! - [`resources`]: closed registry of named resources
//! - [`metrics`](crate::metrics): counters, timings and sinks
//!
//! ## Quick start
//! ```
//! use std::time::Duration;
//!
//! use adaptive_cache::{AdaptiveCache, CacheConfig, ResolveOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), adaptive_cache::CacheError> {
//! let cache: AdaptiveCache<Vec<u8>> = AdaptiveCache::new(CacheConfig::default());
//!
//! let options = ResolveOptions::new()
//!     .ttl(Duration::from_secs(60))
//!     .stale_while_revalidate(true)
//!     .tag("user:42");
//!
//! let body = cache
//!     .resolve("profile:42", || async { Ok::<_, std::io::Error>(b"{}".to_vec()) }, options)
//!     .await?;
//! assert_eq!(body, b"{}");
//!
//! assert_eq!(cache.invalidate_by_tags(["user:42"]), 1);
//! cache.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod inflight;
pub mod metrics;
pub mod preload;
pub mod resources;
pub mod store;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{CacheConfig, CacheConfigBuilder, PreloadDelays};
pub use coordinator::{AdaptiveCache, AdaptiveCacheBuilder, ResolveOptions};
pub use error::{BoxError, CacheError, CacheResult, ErrorClassification, ErrorSeverity};
pub use inflight::{InFlightRegistry, InFlightToken, InFlightWait, TryBegin};
#[cfg(feature = "metrics-exporter")]
pub use self::metrics::MetricsFacadeSink;
pub use self::metrics::{
    MetricEvent, MetricKind, MetricsRecorder, MetricsSink, MetricsSnapshot, NoopSink, TracingSink,
};
pub use preload::{PreloadOutcome, Priority};
pub use resources::{
    ResourceLoader, ResourceRegistry, ResourceRegistryBuilder, RESOURCE_KEY_PREFIX, RESOURCE_TAG,
};
pub use store::{CacheStore, Lookup, TagIndex, TagRemoval};
