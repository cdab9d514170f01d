//! Named resources over a closed, statically built registry
//!
//! Hosts register every resource name and its producer once, at startup.
//! [`ResourceLoader::load`] resolves only those names; anything else fails
//! with [`CacheError::UnknownResource`] before any producer or cache state is
//! touched. There is no path from a caller-supplied string to code that was
//! not registered up front.
//!
//! Loaded resources are cached under `resource:<name>` with the configured
//! `resource_ttl` and tagged [`RESOURCE_TAG`], and each producer run is timed
//! as `resource_load_<name>`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{instrument, warn};

use crate::coordinator::{AdaptiveCache, ResolveOptions};
use crate::error::{BoxError, CacheError, CacheResult};
use crate::metrics::names;
use crate::preload::{Priority, PreloadOutcome};

/// Tag carried by every cached resource
pub const RESOURCE_TAG: &str = "resource";

/// Key prefix for cached resources
pub const RESOURCE_KEY_PREFIX: &str = "resource:";

type ResourceProducer<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V, BoxError>> + Send + Sync>;

struct ResourceEntry<V> {
    producer: ResourceProducer<V>,
    ttl: Option<Duration>,
}

/// Immutable name -> producer mapping
pub struct ResourceRegistry<V> {
    entries: BTreeMap<&'static str, ResourceEntry<V>>,
}

impl<V> fmt::Debug for ResourceRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry").field("names", &self.entries.keys().collect::<Vec<_>>()).finish()
    }
}

impl<V: Send + 'static> ResourceRegistry<V> {
    /// Start building a registry
    pub fn builder() -> ResourceRegistryBuilder<V> {
        ResourceRegistryBuilder { entries: Vec::new() }
    }
}

impl<V> ResourceRegistry<V> {
    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Number of registered resources
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for [`ResourceRegistry`]
pub struct ResourceRegistryBuilder<V> {
    entries: Vec<(&'static str, ResourceEntry<V>)>,
}

impl<V> fmt::Debug for ResourceRegistryBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistryBuilder")
            .field("names", &self.entries.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .finish()
    }
}

impl<V: Send + 'static> ResourceRegistryBuilder<V> {
    /// Register `name` using the cache's `resource_ttl`
    pub fn register<F, Fut, E>(self, name: &'static str, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.insert(name, None, producer)
    }

    /// Register `name` with its own TTL (zero disables expiry)
    pub fn register_with_ttl<F, Fut, E>(self, name: &'static str, ttl: Duration, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.insert(name, Some(ttl), producer)
    }

    fn insert<F, Fut, E>(mut self, name: &'static str, ttl: Option<Duration>, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let producer: ResourceProducer<V> =
            Arc::new(move || -> BoxFuture<'static, Result<V, BoxError>> {
                let fut = producer();
                Box::pin(async move { fut.await.map_err(|e| -> BoxError { e.into() }) })
            });
        self.entries.push((name, ResourceEntry { producer, ttl }));
        self
    }

    /// Freeze the registry
    ///
    /// # Errors
    /// [`CacheError::Config`] for an empty or duplicated name.
    pub fn build(self) -> CacheResult<ResourceRegistry<V>> {
        let mut entries = BTreeMap::new();
        for (name, entry) in self.entries {
            if name.trim().is_empty() {
                return Err(CacheError::config_field("resources", "resource name must not be empty"));
            }
            if entries.insert(name, entry).is_some() {
                return Err(CacheError::config_field(
                    "resources",
                    format!("resource '{name}' registered twice"),
                ));
            }
        }
        Ok(ResourceRegistry { entries })
    }
}

/// Loads registered resources through an [`AdaptiveCache`]
pub struct ResourceLoader<V> {
    cache: AdaptiveCache<V>,
    registry: Arc<ResourceRegistry<V>>,
}

impl<V> Clone for ResourceLoader<V> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone(), registry: Arc::clone(&self.registry) }
    }
}

impl<V> fmt::Debug for ResourceLoader<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLoader").field("registry", &self.registry).finish()
    }
}

impl<V: Clone + Send + Sync + 'static> ResourceLoader<V> {
    /// Create a loader over `cache` restricted to `registry`
    pub fn new(cache: AdaptiveCache<V>, registry: impl Into<Arc<ResourceRegistry<V>>>) -> Self {
        Self { cache, registry: registry.into() }
    }

    /// Cache key a resource is stored under
    pub fn key_for(name: &str) -> String {
        format!("{RESOURCE_KEY_PREFIX}{name}")
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.registry.names()
    }

    /// The underlying cache
    pub fn cache(&self) -> &AdaptiveCache<V> {
        &self.cache
    }

    fn lookup(&self, name: &str) -> CacheResult<(ResourceProducer<V>, ResolveOptions)> {
        let Some(entry) = self.registry.entries.get(name) else {
            warn!(resource = %name, "Requested resource is not registered");
            return Err(CacheError::unknown_resource(name));
        };
        let ttl = entry.ttl.or(self.cache.config().resource_ttl).unwrap_or(Duration::ZERO);
        let options = ResolveOptions::new().ttl(ttl).tag(RESOURCE_TAG);
        Ok((Arc::clone(&entry.producer), options))
    }

    fn timed(
        &self,
        name: &str,
        producer: ResourceProducer<V>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<V, BoxError>> + Send + 'static {
        let metric = names::resource_load(name);
        let metrics = self.cache.metrics().clone();
        let clock = Arc::clone(&self.cache.inner.clock);
        move || -> BoxFuture<'static, Result<V, BoxError>> {
            Box::pin(async move {
                let started = clock.now();
                let result = producer().await;
                metrics.record_timing(&metric, clock.now().saturating_duration_since(started));
                result
            })
        }
    }

    /// Load `name`, from cache when fresh
    ///
    /// # Errors
    /// - [`CacheError::UnknownResource`] for an unregistered name
    /// - [`CacheError::FetchFailed`] when the producer fails with nothing cached
    #[instrument(skip(self))]
    pub async fn load(&self, name: &str) -> CacheResult<V> {
        let (producer, options) = self.lookup(name)?;
        let producer = self.timed(name, producer);
        self.cache.resolve(&Self::key_for(name), producer, options).await
    }

    /// Schedule a preload for `name`
    ///
    /// # Errors
    /// [`CacheError::UnknownResource`] for an unregistered name.
    pub fn preload(&self, name: &str, priority: Priority) -> CacheResult<PreloadOutcome> {
        let (producer, options) = self.lookup(name)?;
        let producer = self.timed(name, producer);
        Ok(self.cache.preload_with(&Self::key_for(name), producer, priority, options))
    }

    /// Invalidate every cached resource
    pub fn invalidate_all(&self) -> usize {
        self.cache.invalidate_by_tags([RESOURCE_TAG])
    }
}
