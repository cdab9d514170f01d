//! Cache metrics accumulation and best-effort sink forwarding
//!
//! [`MetricsRecorder`] sums every recorded value per metric name in a
//! concurrent map and exposes a sorted snapshot. Each event is also offered
//! to an optional [`MetricsSink`]; sink failures are counted and logged but
//! never reach cache callers.
//!
//! ## Metric names
//!
//! | Name | Kind | Meaning |
//! |------|------|---------|
//! | `cache_hit` | counter | fresh entry served without calling the producer |
//! | `stale_hit` | counter | expired-but-retained entry served |
//! | `cache_miss` | counter | producer ran on the caller's path and succeeded |
//! | `fetch_time` | timing (ms) | producer duration on the miss path |
//! | `error_fallback` | counter | miss-path failure answered from a retained entry |
//! | `background_revalidation` | counter | background refresh stored a new value |
//! | `background_revalidation_error` | counter | background refresh failed |
//! | `revalidation_deduped` | counter | refresh skipped, one already in flight |
//! | `cache_invalidation` | counter | entries removed by explicit invalidation |
//! | `cache_eviction` | counter | entries removed by LRU pressure |
//! | `cache_corruption` | counter | dangling index associations dropped |
//! | `preload_scheduled` | counter | preload accepted |
//! | `preload_error` | counter | preload producer failed |
//! | `resource_load_<name>` | timing (ms) | named resource producer duration |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::CacheResult;

/// Metric names recorded by the cache
pub mod names {
    /// Fresh hit
    pub const CACHE_HIT: &str = "cache_hit";
    /// Stale entry served
    pub const STALE_HIT: &str = "stale_hit";
    /// Miss resolved by the producer
    pub const CACHE_MISS: &str = "cache_miss";
    /// Producer duration on the miss path
    pub const FETCH_TIME: &str = "fetch_time";
    /// Miss-path failure answered from a retained entry
    pub const ERROR_FALLBACK: &str = "error_fallback";
    /// Background refresh succeeded
    pub const BACKGROUND_REVALIDATION: &str = "background_revalidation";
    /// Background refresh failed
    pub const BACKGROUND_REVALIDATION_ERROR: &str = "background_revalidation_error";
    /// Refresh skipped because one was in flight
    pub const REVALIDATION_DEDUPED: &str = "revalidation_deduped";
    /// Entries removed by invalidation
    pub const CACHE_INVALIDATION: &str = "cache_invalidation";
    /// Entries removed by LRU pressure
    pub const CACHE_EVICTION: &str = "cache_eviction";
    /// Dangling index associations found
    pub const CACHE_CORRUPTION: &str = "cache_corruption";
    /// Preload accepted
    pub const PRELOAD_SCHEDULED: &str = "preload_scheduled";
    /// Preload failed
    pub const PRELOAD_ERROR: &str = "preload_error";

    /// Load-duration metric for a named resource
    pub fn resource_load(name: &str) -> String {
        format!("resource_load_{name}")
    }
}

/// Accumulated metric values, sorted by name
pub type MetricsSnapshot = BTreeMap<String, f64>;

/// How a metric value should be interpreted by sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic count
    Counter,
    /// Duration in milliseconds
    Timing,
}

/// A single recorded metric event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricEvent<'a> {
    /// Metric name
    pub name: &'a str,
    /// Value added by this event
    pub value: f64,
    /// Counter or timing
    pub kind: MetricKind,
}

/// External reporting channel for metrics
///
/// Implementations must not block; errors are swallowed by the recorder.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Sink name used in logs and errors
    fn name(&self) -> &str;

    /// Forward one event
    fn forward(&self, event: &MetricEvent<'_>) -> CacheResult<()>;

    /// Push a full snapshot
    fn publish(&self, _snapshot: &MetricsSnapshot) -> CacheResult<()> {
        Ok(())
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn name(&self) -> &str {
        "noop"
    }

    fn forward(&self, _event: &MetricEvent<'_>) -> CacheResult<()> {
        Ok(())
    }
}

/// Sink that emits metrics as tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn forward(&self, event: &MetricEvent<'_>) -> CacheResult<()> {
        debug!(metric = event.name, value = event.value, kind = ?event.kind, "cache metric");
        Ok(())
    }

    fn publish(&self, snapshot: &MetricsSnapshot) -> CacheResult<()> {
        for (name, value) in snapshot {
            info!(metric = %name, value = *value, "cache metric total");
        }
        Ok(())
    }
}

/// Sink forwarding to the `metrics` facade
///
/// Counters map to `counter!`, timings to `histogram!` (milliseconds). Whatever
/// recorder the host installed receives the events.
#[cfg(feature = "metrics-exporter")]
#[derive(Debug, Clone, Default)]
pub struct MetricsFacadeSink {
    prefix: Option<String>,
}

#[cfg(feature = "metrics-exporter")]
impl MetricsFacadeSink {
    /// Create a sink emitting unprefixed names
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink emitting `<prefix>.<name>`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { prefix: Some(prefix.into()) }
    }

    fn metric_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        }
    }
}

#[cfg(feature = "metrics-exporter")]
impl MetricsSink for MetricsFacadeSink {
    fn name(&self) -> &str {
        "metrics"
    }

    fn forward(&self, event: &MetricEvent<'_>) -> CacheResult<()> {
        let name = self.metric_name(event.name);
        match event.kind {
            MetricKind::Counter => {
                // Counters are integral; fractional values are not recorded by the cache.
                ::metrics::counter!(name).increment(event.value.max(0.0) as u64);
            }
            MetricKind::Timing => ::metrics::histogram!(name).record(event.value),
        }
        Ok(())
    }
}

struct RecorderInner {
    values: DashMap<String, f64>,
    sink: Option<Arc<dyn MetricsSink>>,
    enabled: bool,
    sink_failures: AtomicU64,
}

/// Thread-safe metrics accumulator
///
/// Cloning shares the underlying map.
#[derive(Clone)]
pub struct MetricsRecorder {
    inner: Arc<RecorderInner>,
}

impl fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("enabled", &self.inner.enabled)
            .field("metrics", &self.inner.values.len())
            .field("sink", &self.inner.sink.as_ref().map(|s| s.name().to_string()))
            .field("sink_failures", &self.sink_failures())
            .finish()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MetricsRecorder {
    /// Recorder without a sink
    pub fn new(enabled: bool) -> Self {
        Self::build(enabled, None)
    }

    /// Recorder forwarding every event to `sink`
    pub fn with_sink(enabled: bool, sink: Arc<dyn MetricsSink>) -> Self {
        Self::build(enabled, Some(sink))
    }

    fn build(enabled: bool, sink: Option<Arc<dyn MetricsSink>>) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                values: DashMap::new(),
                sink,
                enabled,
                sink_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Whether values are accumulated
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Add `value` to counter `name`
    pub fn record(&self, name: &str, value: f64) {
        self.emit(MetricEvent { name, value, kind: MetricKind::Counter });
    }

    /// Add one to counter `name`
    pub fn increment(&self, name: &str) {
        self.record(name, 1.0);
    }

    /// Add `elapsed` in milliseconds to timing `name`
    pub fn record_timing(&self, name: &str, elapsed: Duration) {
        self.emit(MetricEvent { name, value: elapsed.as_secs_f64() * 1000.0, kind: MetricKind::Timing });
    }

    fn emit(&self, event: MetricEvent<'_>) {
        if !self.inner.enabled {
            return;
        }

        *self.inner.values.entry(event.name.to_string()).or_insert(0.0) += event.value;

        if let Some(sink) = &self.inner.sink {
            if let Err(err) = sink.forward(&event) {
                self.note_sink_failure(sink.name(), &err.to_string());
            }
        }
    }

    fn note_sink_failure(&self, sink: &str, error: &str) {
        let previous = self.inner.sink_failures.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            warn!(sink = %sink, error = %error, "Metrics sink unavailable; continuing without it");
        } else {
            debug!(sink = %sink, error = %error, failures = previous + 1, "Metrics sink still failing");
        }
    }

    /// Current value of `name`, zero when never recorded
    pub fn get(&self, name: &str) -> f64 {
        self.inner.values.get(name).map_or(0.0, |v| *v)
    }

    /// Read-only copy of every accumulated value
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.values.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
    }

    /// Push the full snapshot to the sink
    ///
    /// Returns the sink's error so explicit callers can report it; the cache
    /// itself ignores the result.
    pub fn flush(&self) -> CacheResult<()> {
        let Some(sink) = &self.inner.sink else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        sink.publish(&snapshot).inspect_err(|err| {
            self.note_sink_failure(sink.name(), &err.to_string());
        })
    }

    /// Drop every accumulated value
    pub fn reset(&self) {
        self.inner.values.clear();
    }

    /// Number of sink calls that failed
    pub fn sink_failures(&self) -> u64 {
        self.inner.sink_failures.load(Ordering::Relaxed)
    }
}
