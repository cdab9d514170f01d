//! Revalidation coordinator: hit, miss, stale-serve and background refresh
//!
//! [`AdaptiveCache`] is the public face of the crate. Every decision is made
//! in one short critical section over the entry store, the in-flight registry
//! and the preload queue; producers always run with the lock released.
//!
//! # Resolve
//!
//! | Entry | `stale_while_revalidate` | In flight | Outcome |
//! |-------|--------------------------|-----------|---------|
//! | fresh | false | - | return cached value (`cache_hit`) |
//! | fresh or stale | true | no | return cached value, refresh in background |
//! | fresh or stale | true | yes | return cached value (`revalidation_deduped`) |
//! | stale or absent | false | no | run producer on the caller's task |
//! | stale or absent | false | yes | wait for the running fetch, then re-check |
//!
//! A failed miss-path fetch falls back to any retained entry
//! (`error_fallback`) before surfacing [`CacheError::FetchFailed`]. A failed
//! background refresh leaves the stale entry in place.
//!
//! # Lifecycle
//!
//! Background work runs on the ambient tokio runtime, tracked by a
//! [`TaskTracker`]. Each operation carries a child of the cache's root
//! [`CancellationToken`]; invalidation cancels the operation for the removed
//! key and [`AdaptiveCache::shutdown`] cancels all of them. A cancelled
//! operation never writes to the store.

use std::collections::BTreeSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{BoxError, CacheError, CacheResult};
use crate::inflight::{InFlightRegistry, InFlightToken, InFlightWait, TryBegin};
use crate::metrics::{names, MetricsRecorder, MetricsSink, MetricsSnapshot};
use crate::preload::PreloadQueue;
use crate::store::{CacheStore, Lookup};

/// Per-call resolve options
///
/// Options only describe how the entry is stored and served; they are not
/// part of the key. A `ttl` of `None` falls back to
/// [`CacheConfig::default_ttl`], and a zero TTL stores the entry without
/// expiry. Tags are replaced, not merged, when the key is written again.
///
/// # Example
/// ```
/// use std::time::Duration;
///
/// use adaptive_cache::ResolveOptions;
///
/// let options = ResolveOptions::new()
///     .ttl(Duration::from_secs(30))
///     .stale_while_revalidate(true)
///     .tags(["user:42", "profile"]);
///
/// assert!(options.stale_while_revalidate);
/// assert_eq!(options.tags.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Entry TTL; `None` uses the configured default, zero disables expiry
    pub ttl: Option<Duration>,
    /// Serve the cached value immediately and refresh in the background
    pub stale_while_revalidate: bool,
    /// Labels for bulk invalidation
    pub tags: BTreeSet<String>,
}

impl ResolveOptions {
    /// Options with the configured default TTL and no tags
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Enable or disable stale-while-revalidate
    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    /// Add one tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Everything guarded by the single cache lock.
pub(crate) struct CacheState<V> {
    pub(crate) store: CacheStore<V>,
    pub(crate) inflight: InFlightRegistry,
    pub(crate) preloads: PreloadQueue,
}

pub(crate) struct Inner<V> {
    pub(crate) state: Mutex<CacheState<V>>,
    pub(crate) config: CacheConfig,
    pub(crate) metrics: MetricsRecorder,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) root: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

enum Plan<V> {
    Hit(V),
    Serve { value: V, stale: bool, refresh: Option<InFlightToken> },
    Fetch(InFlightToken),
    Wait(InFlightWait),
}

enum Commit {
    Stored { evicted: Option<String> },
    Discarded,
}

/// Releases an in-flight record on every exit path.
///
/// Must not be dropped while the state lock is held; use `finish` inside a
/// critical section instead.
struct InFlightGuard<V> {
    inner: Arc<Inner<V>>,
    token: Option<InFlightToken>,
}

impl<V> InFlightGuard<V> {
    fn new(inner: Arc<Inner<V>>, token: InFlightToken) -> Self {
        Self { inner, token: Some(token) }
    }

    fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(InFlightToken::is_cancelled)
    }

    fn cancellation(&self) -> CancellationToken {
        self.token.as_ref().map_or_else(CancellationToken::new, |t| t.cancellation().clone())
    }

    fn finish(mut self, state: &mut CacheState<V>) {
        if let Some(token) = self.token.take() {
            state.inflight.end(token);
        }
    }
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.inner.state.lock().inflight.end(token);
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
    fn commit(
        &self,
        guard: InFlightGuard<V>,
        key: &str,
        value: V,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
    ) -> Commit {
        let mut state = self.state.lock();
        if guard.is_cancelled() || self.root.is_cancelled() {
            guard.finish(&mut state);
            return Commit::Discarded;
        }
        state.preloads.supersede(key);
        let evicted = state.store.set(key, value, ttl, tags);
        guard.finish(&mut state);
        Commit::Stored { evicted }
    }

    fn fallback(&self, guard: InFlightGuard<V>, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        let value = state.store.lookup(key).into_value();
        guard.finish(&mut state);
        value
    }

    fn record_eviction(&self, evicted: Option<String>) {
        if let Some(evicted) = evicted {
            debug!(key = %evicted, "Entry evicted to make room");
            self.metrics.increment(names::CACHE_EVICTION);
        }
    }

    pub(crate) fn spawn_tracked<Fut>(&self, handle: &Handle, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        drop(self.tracker.spawn_on(task, handle));
    }
}

/// In-process adaptive cache
///
/// Cloning is cheap and every clone shares the same state.
///
/// # Example
/// ```
/// use adaptive_cache::{AdaptiveCache, CacheConfig, ResolveOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache: AdaptiveCache<String> = AdaptiveCache::new(CacheConfig::default());
/// let value = cache
///     .resolve("greeting", || async { Ok::<_, std::io::Error>("hello".to_string()) }, ResolveOptions::new())
///     .await
///     .unwrap();
/// assert_eq!(value, "hello");
/// # }
/// ```
pub struct AdaptiveCache<V> {
    pub(crate) inner: Arc<Inner<V>>,
}

impl<V> Clone for AdaptiveCache<V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V: Clone> std::fmt::Debug for AdaptiveCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AdaptiveCache")
            .field("len", &state.store.len())
            .field("capacity", &state.store.capacity())
            .field("in_flight", &state.inflight.len())
            .field("queued_preloads", &state.preloads.len())
            .field("shut_down", &self.inner.root.is_cancelled())
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> AdaptiveCache<V> {
    /// Create a cache on the system clock without a metrics sink
    ///
    /// A zero `max_entries` is clamped to one; use [`AdaptiveCache::builder`]
    /// to reject invalid configurations instead.
    pub fn new(config: CacheConfig) -> Self {
        let metrics = MetricsRecorder::new(config.track_metrics);
        Self::from_parts(config, Arc::new(SystemClock), metrics)
    }

    /// Create a cache reading time from `clock`
    pub fn with_clock(config: CacheConfig, clock: impl Clock) -> Self {
        let metrics = MetricsRecorder::new(config.track_metrics);
        Self::from_parts(config, Arc::new(clock), metrics)
    }

    /// Create a cache forwarding metrics to `sink`
    pub fn with_sink(config: CacheConfig, sink: Arc<dyn MetricsSink>) -> Self {
        let metrics = MetricsRecorder::with_sink(config.track_metrics, sink);
        Self::from_parts(config, Arc::new(SystemClock), metrics)
    }

    /// Builder validating the configuration
    pub fn builder(config: CacheConfig) -> AdaptiveCacheBuilder<V> {
        AdaptiveCacheBuilder { config, clock: None, sink: None, _marker: PhantomData }
    }

    fn from_parts(config: CacheConfig, clock: Arc<dyn Clock>, metrics: MetricsRecorder) -> Self {
        let root = CancellationToken::new();
        let store = CacheStore::new(config.max_entries, config.allow_stale, Arc::clone(&clock));

        info!(
            max_entries = store.capacity(),
            default_ttl_ms = config.default_ttl.map(|d| d.as_millis() as u64),
            allow_stale = config.allow_stale,
            "Adaptive cache initialized"
        );

        let state = CacheState {
            store,
            inflight: InFlightRegistry::new(root.clone()),
            preloads: PreloadQueue::new(root.clone()),
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                config,
                metrics,
                clock,
                root,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Resolve `key`, calling `producer` only when the cache cannot answer
    ///
    /// On a miss the producer is awaited on the caller's task. With
    /// `stale_while_revalidate` set and an entry present, the cached value is
    /// returned at once and at most one background refresh runs per key.
    ///
    /// # Errors
    /// - [`CacheError::FetchFailed`] when the producer fails and no entry is
    ///   retained for the key
    /// - [`CacheError::ShuttingDown`] after [`AdaptiveCache::shutdown`]
    #[instrument(level = "debug", skip(self, producer, options))]
    pub async fn resolve<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: ResolveOptions,
    ) -> CacheResult<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if self.inner.root.is_cancelled() {
            return Err(CacheError::ShuttingDown);
        }

        let ResolveOptions { ttl, stale_while_revalidate, tags } = options;
        let ttl = ttl.or(self.inner.config.default_ttl);
        let mut waited = false;

        loop {
            match self.plan(key, stale_while_revalidate, waited) {
                Plan::Hit(value) => {
                    debug!(key = %key, "Cache hit");
                    self.inner.metrics.increment(names::CACHE_HIT);
                    return Ok(value);
                }
                Plan::Serve { value, stale, refresh } => {
                    let metric = if stale { names::STALE_HIT } else { names::CACHE_HIT };
                    self.inner.metrics.increment(metric);
                    match refresh {
                        Some(token) => self.spawn_refresh(key, token, producer, ttl, tags),
                        None => {
                            debug!(key = %key, "Revalidation already in flight; skipping");
                            self.inner.metrics.increment(names::REVALIDATION_DEDUPED);
                        }
                    }
                    return Ok(value);
                }
                Plan::Fetch(token) => return self.fetch(key, token, producer, ttl, tags).await,
                Plan::Wait(wait) => {
                    debug!(key = %key, "Fetch already in flight; waiting for it to settle");
                    wait.settled().await;
                    if self.inner.root.is_cancelled() {
                        return Err(CacheError::ShuttingDown);
                    }
                    waited = true;
                }
            }
        }
    }

    fn plan(&self, key: &str, stale_while_revalidate: bool, waited: bool) -> Plan<V> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let lookup = state.store.lookup(key);
        let stale = matches!(lookup, Lookup::Stale(_));

        match lookup.into_value() {
            Some(value) if !stale && (!stale_while_revalidate || waited) => Plan::Hit(value),
            Some(value) if stale_while_revalidate => {
                let refresh = match state.inflight.try_begin(key, now) {
                    TryBegin::Started(token) => Some(token),
                    TryBegin::AlreadyRunning(_) => None,
                };
                Plan::Serve { value, stale, refresh }
            }
            _ => match state.inflight.try_begin(key, now) {
                TryBegin::Started(token) => Plan::Fetch(token),
                TryBegin::AlreadyRunning(wait) => Plan::Wait(wait),
            },
        }
    }

    async fn fetch<F, Fut, E>(
        &self,
        key: &str,
        token: InFlightToken,
        producer: F,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
    ) -> CacheResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        let guard = InFlightGuard::new(Arc::clone(&self.inner), token);
        let started = self.inner.clock.now();
        let outcome: Result<V, BoxError> = producer().await.map_err(Into::into);
        let elapsed = self.inner.clock.now().saturating_duration_since(started);

        match outcome {
            Ok(value) => {
                match self.inner.commit(guard, key, value.clone(), ttl, tags) {
                    Commit::Stored { evicted } => self.inner.record_eviction(evicted),
                    Commit::Discarded => {
                        debug!(key = %key, "Fetch result not stored; operation was cancelled");
                    }
                }
                self.inner.metrics.increment(names::CACHE_MISS);
                self.inner.metrics.record_timing(names::FETCH_TIME, elapsed);
                debug!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "Cache miss resolved");
                Ok(value)
            }
            Err(err) => match self.inner.fallback(guard, key) {
                Some(value) => {
                    warn!(key = %key, error = %err, "Fetch failed; serving retained entry");
                    self.inner.metrics.increment(names::ERROR_FALLBACK);
                    Ok(value)
                }
                None => {
                    warn!(key = %key, error = %err, "Fetch failed with no fallback");
                    Err(CacheError::fetch_failed(key, err))
                }
            },
        }
    }

    fn spawn_refresh<F, Fut, E>(
        &self,
        key: &str,
        token: InFlightToken,
        producer: F,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let guard = InFlightGuard::new(Arc::clone(&self.inner), token);
        let Ok(handle) = Handle::try_current() else {
            warn!(key = %key, "No tokio runtime available; skipping background revalidation");
            return;
        };

        debug!(key = %key, "Starting background revalidation");
        let inner = Arc::clone(&self.inner);
        let cancel = guard.cancellation();
        let key = key.to_string();

        self.inner.spawn_tracked(&handle, async move {
            let outcome: Option<Result<V, BoxError>> = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = producer() => Some(result.map_err(Into::into)),
            };

            match outcome {
                None => debug!(key = %key, "Background revalidation cancelled"),
                Some(Ok(value)) => match inner.commit(guard, &key, value, ttl, tags) {
                    Commit::Stored { evicted } => {
                        inner.record_eviction(evicted);
                        inner.metrics.increment(names::BACKGROUND_REVALIDATION);
                        debug!(key = %key, "Background revalidation stored fresh value");
                    }
                    Commit::Discarded => {
                        debug!(key = %key, "Background revalidation result discarded");
                    }
                },
                Some(Err(err)) => {
                    drop(guard);
                    inner.metrics.increment(names::BACKGROUND_REVALIDATION_ERROR);
                    warn!(key = %key, error = %err, "Background revalidation failed; keeping stale entry");
                }
            }
        });
    }

    /// Remove every entry carrying any of `tags`, returning how many were removed
    ///
    /// Background refreshes for removed keys are cancelled and will not write.
    /// Preloads queued for them that have not started are dropped.
    pub fn invalidate_by_tags<I, S>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: Vec<String> = tags.into_iter().map(|t| t.as_ref().to_string()).collect();
        let outcome = {
            let mut state = self.inner.state.lock();
            let outcome = state.store.remove_by_tags(&tags);
            for key in &outcome.removed {
                state.inflight.cancel(key);
                state.preloads.supersede(key);
            }
            outcome
        };

        let removed = outcome.removed.len();
        self.inner.metrics.record(names::CACHE_INVALIDATION, removed as f64);
        if !outcome.dangling.is_empty() {
            self.inner.metrics.record(names::CACHE_CORRUPTION, outcome.dangling.len() as f64);
        }
        info!(tags = ?tags, removed, "Invalidated entries by tag");
        removed
    }

    /// Remove one entry and cancel any operation running for it
    ///
    /// A preload queued for `key` that has not started yet is dropped too,
    /// whether or not an entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            state.inflight.cancel(key);
            state.preloads.supersede(key);
            state.store.delete(key)
        };
        if removed {
            self.inner.metrics.increment(names::CACHE_INVALIDATION);
            debug!(key = %key, "Invalidated entry");
        }
        removed
    }

    /// Drop every entry, in-flight operation and queued preload
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let entries = state.store.len();
        state.store.clear();
        let cancelled = state.inflight.cancel_all();
        let preloads = state.preloads.cancel_all();
        drop(state);
        info!(entries, cancelled, preloads, "Cache cleared");
    }

    /// Number of stored entries, including retained stale ones
    pub fn len(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a fresh entry exists for `key`; does not affect recency
    pub fn contains(&self, key: &str) -> bool {
        self.inner.state.lock().store.contains_fresh(key)
    }

    /// Number of fetches and refreshes currently running
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().inflight.len()
    }

    /// Number of preloads waiting or running
    pub fn queued_preloads(&self) -> usize {
        self.inner.state.lock().preloads.len()
    }

    /// Remove every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let purged = self.inner.state.lock().store.purge_expired();
        if !purged.is_empty() {
            debug!(purged = purged.len(), "Purged expired entries");
        }
        purged.len()
    }

    /// Verify store, recency list and tag index agree
    ///
    /// # Errors
    /// [`CacheError::CacheCorruption`] describing the first inconsistency.
    pub fn check_integrity(&self) -> CacheResult<()> {
        let result = self.inner.state.lock().store.verify_integrity();
        if let Err(err) = &result {
            tracing::error!(error = %err, "Cache integrity check failed");
            self.inner.metrics.increment(names::CACHE_CORRUPTION);
        }
        result
    }

    /// Read-only copy of accumulated metrics
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The metrics recorder
    pub fn metrics(&self) -> &MetricsRecorder {
        &self.inner.metrics
    }

    /// The active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Whether [`AdaptiveCache::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Cancel background work, wait for it to drain and flush metrics
    ///
    /// Later `resolve` calls fail with [`CacheError::ShuttingDown`] and
    /// `preload` calls are rejected. Calling this twice is harmless.
    ///
    /// # Errors
    /// [`CacheError::ShutdownTimeout`] if tasks are still running after
    /// `shutdown_timeout`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> CacheResult<()> {
        info!(tasks = self.inner.tracker.len(), "Shutting down adaptive cache");

        self.inner.root.cancel();
        {
            let mut state = self.inner.state.lock();
            state.inflight.cancel_all();
            state.preloads.cancel_all();
        }
        self.inner.tracker.close();

        let timeout = self.inner.config.shutdown_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let pending = self.inner.tracker.len();
                warn!(pending, timeout_ms = timeout.as_millis() as u64, "Background tasks did not drain in time");
                Err(CacheError::ShutdownTimeout { pending, timeout })
            }
        };

        // Sink failures are already logged and counted by the recorder.
        let _ = self.inner.metrics.flush();
        info!("Adaptive cache shut down");
        result
    }
}

/// Builder for [`AdaptiveCache`]
pub struct AdaptiveCacheBuilder<V> {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn MetricsSink>>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for AdaptiveCacheBuilder<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveCacheBuilder")
            .field("config", &self.config)
            .field("custom_clock", &self.clock.is_some())
            .field("sink", &self.sink)
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> AdaptiveCacheBuilder<V> {
    /// Read time from `clock`
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Forward metrics to `sink`
    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and build the cache
    pub fn build(self) -> CacheResult<AdaptiveCache<V>> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = match self.sink {
            Some(sink) => MetricsRecorder::with_sink(self.config.track_metrics, sink),
            None => MetricsRecorder::new(self.config.track_metrics),
        };
        Ok(AdaptiveCache::from_parts(self.config, clock, metrics))
    }
}
