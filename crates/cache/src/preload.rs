//! Speculative cache population with priority-based delay
//!
//! A preload is accepted only when the key is neither fresh in the store nor
//! already queued; both checks and the enqueue happen under the cache lock.
//! Accepted requests sleep for their priority's delay, then resolve the key
//! with `stale_while_revalidate` forced off. The queue marker is removed when
//! the task ends, whatever the outcome, so a failed preload can be retried.
//!
//! A direct cache write for a queued key supersedes the request: the marker
//! is dropped and the delayed task is cancelled before it calls the producer.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::{AdaptiveCache, Inner, ResolveOptions};
use crate::error::{BoxError, CacheError};
use crate::metrics::names;

/// Preload urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Run immediately
    High,
    /// Short delay
    #[default]
    Medium,
    /// Longest delay, yields to user-triggered fetches
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(CacheError::config_field("priority", format!("unknown priority '{other}'"))),
        }
    }
}

/// What `preload` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// Queued; the producer runs after the priority delay
    Scheduled,
    /// A fresh entry already exists
    AlreadyCached,
    /// A preload for the key is already queued or running
    AlreadyQueued,
    /// The cache is shut down or no tokio runtime is available
    Rejected,
}

impl PreloadOutcome {
    /// Whether a new preload was queued
    pub fn is_scheduled(self) -> bool {
        self == Self::Scheduled
    }
}

#[derive(Debug)]
struct PreloadRequest {
    id: u64,
    priority: Priority,
    enqueued_at: Instant,
    cancel: CancellationToken,
    started: bool,
}

/// Queued preload markers, at most one per key.
#[derive(Debug)]
pub(crate) struct PreloadQueue {
    requests: HashMap<String, PreloadRequest>,
    next_id: u64,
    root: CancellationToken,
}

impl PreloadQueue {
    pub(crate) fn new(root: CancellationToken) -> Self {
        Self { requests: HashMap::new(), next_id: 0, root }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.requests.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// Caller must have checked `contains` in the same critical section.
    pub(crate) fn enqueue(
        &mut self,
        key: &str,
        priority: Priority,
        now: Instant,
    ) -> (u64, CancellationToken) {
        self.next_id += 1;
        let id = self.next_id;
        let cancel = self.root.child_token();
        self.requests.insert(
            key.to_string(),
            PreloadRequest { id, priority, enqueued_at: now, cancel: cancel.clone(), started: false },
        );
        (id, cancel)
    }

    /// Mark the request as running; false if it was superseded meanwhile.
    pub(crate) fn mark_started(&mut self, key: &str, id: u64) -> bool {
        match self.requests.get_mut(key) {
            Some(request) if request.id == id && !request.cancel.is_cancelled() => {
                request.started = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn complete(&mut self, key: &str, id: u64) -> Option<(Priority, Instant)> {
        match self.requests.get(key) {
            Some(request) if request.id == id => {
                self.requests.remove(key).map(|r| (r.priority, r.enqueued_at))
            }
            _ => None,
        }
    }

    /// Drop a request that has not started yet.
    pub(crate) fn supersede(&mut self, key: &str) -> bool {
        match self.requests.get(key) {
            Some(request) if !request.started => {
                if let Some(request) = self.requests.remove(key) {
                    request.cancel.cancel();
                    debug!(key = %key, priority = %request.priority, "Queued preload superseded by cache write");
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) -> usize {
        let count = self.requests.len();
        for (_, request) in self.requests.drain() {
            request.cancel.cancel();
        }
        count
    }
}

/// Clears the queue marker when the preload task ends.
struct PreloadMarker<V> {
    inner: Arc<Inner<V>>,
    key: String,
    id: u64,
}

impl<V> Drop for PreloadMarker<V> {
    fn drop(&mut self) {
        let finished = self.inner.state.lock().preloads.complete(&self.key, self.id);
        if let Some((priority, enqueued_at)) = finished {
            let waited = self.inner.clock.now().saturating_duration_since(enqueued_at);
            debug!(key = %self.key, %priority, elapsed_ms = waited.as_millis() as u64, "Preload finished");
        }
    }
}

impl<V: Clone + Send + Sync + 'static> AdaptiveCache<V> {
    /// Schedule a speculative `resolve` for `key`
    ///
    /// Returns immediately. The producer runs after the delay configured for
    /// `priority` unless the key is written or invalidated first.
    pub fn preload<F, Fut, E>(&self, key: &str, producer: F, priority: Priority) -> PreloadOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.preload_with(key, producer, priority, ResolveOptions::new())
    }

    /// [`AdaptiveCache::preload`] with explicit TTL and tags
    ///
    /// `options.stale_while_revalidate` is ignored.
    pub fn preload_with<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        priority: Priority,
        options: ResolveOptions,
    ) -> PreloadOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        if self.inner.root.is_cancelled() {
            debug!(key = %key, "Preload rejected; cache is shut down");
            return PreloadOutcome::Rejected;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(key = %key, "No tokio runtime available; preload rejected");
            return PreloadOutcome::Rejected;
        };

        let (id, cancel) = {
            let now = self.inner.clock.now();
            let mut state = self.inner.state.lock();
            if state.store.contains_fresh(key) {
                return PreloadOutcome::AlreadyCached;
            }
            if state.preloads.contains(key) {
                return PreloadOutcome::AlreadyQueued;
            }
            state.preloads.enqueue(key, priority, now)
        };

        let delay = self.inner.config.preload_delays.for_priority(priority);
        self.inner.metrics.increment(names::PRELOAD_SCHEDULED);
        debug!(key = %key, %priority, delay_ms = delay.as_millis() as u64, "Preload scheduled");

        let cache = self.clone();
        let key = key.to_string();
        let options = options.stale_while_revalidate(false);

        self.inner.spawn_tracked(&handle, async move {
            let _marker = PreloadMarker { inner: Arc::clone(&cache.inner), key: key.clone(), id };

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(key = %key, "Preload cancelled before running");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if !cache.start_preload(&key, id) {
                debug!(key = %key, "Preload superseded before running");
                return;
            }

            if let Err(err) = cache.resolve(&key, producer, options).await {
                cache.inner.metrics.increment(names::PRELOAD_ERROR);
                warn!(key = %key, error = %err, "Preload failed");
            }
        });

        PreloadOutcome::Scheduled
    }

    fn start_preload(&self, key: &str, id: u64) -> bool {
        self.inner.state.lock().preloads.mark_started(key, id)
    }
}
