//! Integration tests for resolve
//!
//! Covers the hit short-circuit, stale-while-revalidate dedupe, TTL expiry,
//! stale fallback on refresh failure, miss coalescing and cancellation of
//! refreshes by invalidation and shutdown.

mod support;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use adaptive_cache::metrics::names;
use adaptive_cache::{AdaptiveCache, CacheConfig, CacheError, CacheResult, MockClock, ResolveOptions};
use support::{init_tracing, wait_until, CallCounter};
use tokio::sync::Notify;

fn mock_cache(config: CacheConfig) -> CacheResult<(AdaptiveCache<u32>, MockClock)> {
    let clock = MockClock::new();
    let cache = AdaptiveCache::builder(config).clock(clock.clone()).build()?;
    Ok((cache, clock))
}

/// Seed `key` with `value` and move the clock past its TTL.
async fn seed_stale(
    cache: &AdaptiveCache<u32>,
    clock: &MockClock,
    key: &str,
    value: u32,
) -> CacheResult<()> {
    let options = ResolveOptions::new().ttl(Duration::from_secs(1));
    cache.resolve(key, move || async move { Ok::<_, io::Error>(value) }, options).await?;
    clock.advance(Duration::from_secs(2));
    Ok(())
}

/// Verifies a fresh entry is served without invoking the producer.
///
/// # Test Steps
/// 1. Populate `k`
/// 2. Resolve `k` again with a producer that panics if called
/// 3. Verify the cached value is returned and `cache_hit` incremented
#[tokio::test]
async fn test_fresh_hit_never_invokes_producer() {
    init_tracing();
    let cache: AdaptiveCache<u32> = AdaptiveCache::new(CacheConfig::default());
    cache.resolve("k", || async { Ok::<_, io::Error>(1) }, ResolveOptions::new()).await.unwrap();

    let value = cache
        .resolve(
            "k",
            || -> std::future::Ready<Result<u32, io::Error>> {
                panic!("producer must not run on a fresh hit")
            },
            ResolveOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(value, 1);
    assert_eq!(cache.metrics().get(names::CACHE_HIT), 1.0);
    assert_eq!(cache.metrics().get(names::CACHE_MISS), 1.0);
}

/// Validates that concurrent stale reads trigger exactly one refresh.
///
/// # Test Steps
/// 1. Seed a stale entry for `hot`
/// 2. Issue 10 concurrent stale-while-revalidate resolves with gated producers
/// 3. Verify every caller got the stale value immediately
/// 4. Release the refresh and verify one producer invocation in total
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_while_revalidate_dedupes_refreshes() {
    init_tracing();
    let (cache, clock) = mock_cache(CacheConfig::default()).unwrap();
    seed_stale(&cache, &clock, "hot", 1).await.unwrap();

    let calls = CallCounter::new();
    let gate = Arc::new(Notify::new());
    let options = ResolveOptions::new().ttl(Duration::from_secs(60)).stale_while_revalidate(true);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let producer = calls.gated(&gate, 2);
        let options = options.clone();
        handles.push(tokio::spawn(async move { cache.resolve("hot", producer, options).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    gate.notify_one();
    wait_until(|| cache.in_flight_count() == 0).await;

    assert_eq!(calls.count(), 1);
    assert_eq!(cache.metrics().get(names::STALE_HIT), 10.0);
    assert_eq!(cache.metrics().get(names::REVALIDATION_DEDUPED), 9.0);
    assert_eq!(cache.metrics().get(names::BACKGROUND_REVALIDATION), 1.0);

    let refreshed = cache.resolve("hot", calls.returning(3), ResolveOptions::new()).await.unwrap();
    assert_eq!(refreshed, 2);
    assert_eq!(calls.count(), 1);
}

/// Verifies lazy TTL expiry against the real clock.
///
/// # Test Steps
/// 1. Resolve `k` with a 100ms TTL
/// 2. Sleep 150ms
/// 3. Verify the next resolve invokes the producer again
#[tokio::test]
async fn test_ttl_expiry_triggers_refetch() {
    init_tracing();
    let cache: AdaptiveCache<u32> = AdaptiveCache::new(CacheConfig::default());
    let calls = CallCounter::new();
    let options = ResolveOptions::new().ttl(Duration::from_millis(100));

    assert_eq!(cache.resolve("k", calls.returning(1), options.clone()).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.resolve("k", calls.returning(2), options).await.unwrap(), 2);

    assert_eq!(calls.count(), 2);
    assert_eq!(cache.metrics().get(names::CACHE_MISS), 2.0);
}

/// Validates that a failed background refresh keeps the stale value.
///
/// # Test Steps
/// 1. Seed a stale entry
/// 2. Resolve with stale-while-revalidate and a failing producer
/// 3. Verify the old value was returned and `background_revalidation_error` is 1
/// 4. Verify a later resolve still returns the old value
#[tokio::test]
async fn test_failed_refresh_keeps_stale_entry() {
    init_tracing();
    let (cache, clock) = mock_cache(CacheConfig::default()).unwrap();
    seed_stale(&cache, &clock, "k", 7).await.unwrap();

    let calls = CallCounter::new();
    let options = ResolveOptions::new().stale_while_revalidate(true);

    let value = cache.resolve("k", calls.failing("upstream down"), options.clone()).await.unwrap();
    assert_eq!(value, 7);

    wait_until(|| cache.in_flight_count() == 0).await;
    assert_eq!(calls.count(), 1);
    assert_eq!(cache.metrics().get(names::BACKGROUND_REVALIDATION_ERROR), 1.0);
    assert_eq!(cache.len(), 1);

    let again = cache.resolve("k", calls.failing("still down"), options).await.unwrap();
    assert_eq!(again, 7);
}

/// Verifies concurrent misses share one producer call.
///
/// # Test Steps
/// 1. Start a miss for `k` whose producer waits on a gate
/// 2. Start a second resolve for `k` while the first is in flight
/// 3. Release the gate; both callers observe the same value
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_misses_coalesce() {
    init_tracing();
    let cache: AdaptiveCache<u32> = AdaptiveCache::new(CacheConfig::default());
    let calls = CallCounter::new();
    let gate = Arc::new(Notify::new());

    let first = {
        let cache = cache.clone();
        let producer = calls.gated(&gate, 5);
        tokio::spawn(async move { cache.resolve("k", producer, ResolveOptions::new()).await })
    };
    wait_until(|| cache.in_flight_count() == 1).await;

    let second = {
        let cache = cache.clone();
        let producer = calls.returning(6);
        tokio::spawn(async move { cache.resolve("k", producer, ResolveOptions::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.notify_one();

    assert_eq!(first.await.unwrap().unwrap(), 5);
    assert_eq!(second.await.unwrap().unwrap(), 5);
    assert_eq!(calls.count(), 1);
}

/// Verifies a waiter runs its own producer when the shared fetch fails.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiter_retries_after_failed_fetch() {
    init_tracing();
    let cache: AdaptiveCache<u32> = AdaptiveCache::new(CacheConfig::default());
    let gate = Arc::new(Notify::new());

    let first = {
        let cache = cache.clone();
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            cache
                .resolve(
                    "k",
                    move || async move {
                        gate.notified().await;
                        Err::<u32, _>(io::Error::other("boom"))
                    },
                    ResolveOptions::new(),
                )
                .await
        })
    };
    wait_until(|| cache.in_flight_count() == 1).await;

    let second = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache.resolve("k", || async { Ok::<_, io::Error>(9) }, ResolveOptions::new()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.notify_one();

    assert!(matches!(first.await.unwrap(), Err(CacheError::FetchFailed { .. })));
    assert_eq!(second.await.unwrap().unwrap(), 9);
}

/// Validates that invalidation cancels a running refresh before it writes.
///
/// # Test Steps
/// 1. Seed a stale tagged entry and start a gated background refresh
/// 2. Invalidate by tag while the refresh is blocked
/// 3. Release the gate and drain background work
/// 4. Verify the entry stays absent and no revalidation was recorded
#[tokio::test]
async fn test_invalidation_cancels_refresh() {
    init_tracing();
    let (cache, clock) = mock_cache(CacheConfig::default()).unwrap();
    let seeded = ResolveOptions::new().ttl(Duration::from_secs(1)).tag("g");
    cache.resolve("k", || async { Ok::<_, io::Error>(1) }, seeded).await.unwrap();
    clock.advance(Duration::from_secs(2));

    let calls = CallCounter::new();
    let gate = Arc::new(Notify::new());
    let options = ResolveOptions::new().stale_while_revalidate(true).tag("g");
    assert_eq!(cache.resolve("k", calls.gated(&gate, 2), options).await.unwrap(), 1);
    assert_eq!(cache.in_flight_count(), 1);

    assert_eq!(cache.invalidate_by_tags(["g"]), 1);
    assert_eq!(cache.in_flight_count(), 0);
    gate.notify_one();
    cache.shutdown().await.unwrap();

    assert!(!cache.contains("k"));
    assert!(cache.is_empty());
    assert_eq!(cache.metrics().get(names::BACKGROUND_REVALIDATION), 0.0);
}

/// Verifies shutdown stops background refreshes and new resolves.
#[tokio::test]
async fn test_shutdown_drains_background_work() {
    init_tracing();
    let (cache, clock) = mock_cache(CacheConfig::default()).unwrap();
    seed_stale(&cache, &clock, "k", 1).await.unwrap();

    let calls = CallCounter::new();
    let gate = Arc::new(Notify::new());
    let options = ResolveOptions::new().stale_while_revalidate(true);
    cache.resolve("k", calls.gated(&gate, 2), options).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), cache.shutdown()).await.unwrap().unwrap();

    assert_eq!(cache.in_flight_count(), 0);
    let err = cache.resolve("k", calls.returning(3), ResolveOptions::new()).await.unwrap_err();
    assert!(matches!(err, CacheError::ShuttingDown));
    cache.shutdown().await.unwrap();
}
