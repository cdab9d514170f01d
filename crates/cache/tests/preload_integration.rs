//! Integration tests for delayed preloads

mod support;

use std::io;
use std::time::Duration;

use adaptive_cache::metrics::names;
use adaptive_cache::{
    AdaptiveCache, CacheConfig, MockClock, PreloadDelays, PreloadOutcome, Priority, ResolveOptions,
};
use support::{init_tracing, wait_until, CallCounter};

fn fast_delays() -> PreloadDelays {
    PreloadDelays {
        high: Duration::ZERO,
        medium: Duration::from_millis(20),
        low: Duration::from_millis(100),
    }
}

fn cache() -> AdaptiveCache<u32> {
    AdaptiveCache::new(CacheConfig::builder().preload_delays(fast_delays()).build())
}

/// Verifies duplicate preloads before the delay elapses run once.
///
/// # Test Steps
/// 1. Preload `k` at low priority twice back to back
/// 2. Wait for the queue to drain
/// 3. Verify one producer invocation and a cached value
#[tokio::test]
async fn test_duplicate_preload_runs_once() {
    init_tracing();
    let cache = cache();
    let calls = CallCounter::new();

    assert_eq!(cache.preload("k", calls.returning(1), Priority::Low), PreloadOutcome::Scheduled);
    assert_eq!(cache.preload("k", calls.returning(2), Priority::Low), PreloadOutcome::AlreadyQueued);
    assert_eq!(cache.queued_preloads(), 1);

    wait_until(|| cache.queued_preloads() == 0).await;

    assert_eq!(calls.count(), 1);
    assert!(cache.contains("k"));
    assert_eq!(cache.metrics().get(names::PRELOAD_SCHEDULED), 1.0);
}

/// Verifies a low-priority preload waits for its delay.
#[tokio::test]
async fn test_low_priority_waits_for_delay() {
    let cache = cache();
    let calls = CallCounter::new();

    cache.preload("k", calls.returning(1), Priority::Low);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.count(), 0);

    wait_until(|| cache.contains("k")).await;
    assert_eq!(calls.count(), 1);
}

/// Verifies a failed preload clears its marker so it can be retried.
///
/// # Test Steps
/// 1. Preload with a failing producer and wait for the queue to drain
/// 2. Verify `preload_error` and that nothing was cached
/// 3. Preload again; verify it is scheduled and succeeds
#[tokio::test]
async fn test_failed_preload_can_retry() {
    init_tracing();
    let cache = cache();
    let calls = CallCounter::new();

    cache.preload("k", calls.failing("not yet"), Priority::High);
    wait_until(|| cache.queued_preloads() == 0).await;

    assert_eq!(cache.metrics().get(names::PRELOAD_ERROR), 1.0);
    assert!(!cache.contains("k"));

    assert_eq!(cache.preload("k", calls.returning(4), Priority::High), PreloadOutcome::Scheduled);
    wait_until(|| cache.contains("k")).await;
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_preload_of_cached_key_is_noop() {
    let cache = cache();
    cache.resolve("k", || async { Ok::<_, io::Error>(1) }, ResolveOptions::new()).await.unwrap();

    let calls = CallCounter::new();
    assert_eq!(cache.preload("k", calls.returning(2), Priority::High), PreloadOutcome::AlreadyCached);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.count(), 0);
}

#[tokio::test]
async fn test_preload_applies_tags() {
    let cache = cache();
    let options = ResolveOptions::new().tag("warm");

    cache.preload_with("k", || async { Ok::<_, io::Error>(1) }, Priority::High, options);
    wait_until(|| cache.contains("k")).await;

    assert_eq!(cache.invalidate_by_tags(["warm"]), 1);
}

/// Verifies invalidating a key drops its queued preload.
///
/// # Test Steps
/// 1. Queue a low-priority preload for `k`
/// 2. Invalidate `k` before the delay elapses
/// 3. Verify the queue is empty and the producer never ran
#[tokio::test]
async fn test_invalidate_drops_queued_preload() {
    init_tracing();
    let cache = cache();
    let calls = CallCounter::new();

    assert!(cache.preload("k", calls.returning(1), Priority::Low).is_scheduled());
    assert!(!cache.invalidate("k"));
    assert_eq!(cache.queued_preloads(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.count(), 0);
    assert!(!cache.contains("k"));
}

#[tokio::test]
async fn test_tag_invalidation_drops_queued_preload() {
    let clock = MockClock::new();
    let config = CacheConfig::builder().preload_delays(fast_delays()).build();
    let cache: AdaptiveCache<u32> = AdaptiveCache::with_clock(config, clock.clone());
    let seeded = ResolveOptions::new().ttl(Duration::from_secs(1)).tag("g");
    cache.resolve("k", || async { Ok::<_, io::Error>(1) }, seeded).await.unwrap();
    clock.advance(Duration::from_secs(2));

    let calls = CallCounter::new();
    assert!(cache.preload("k", calls.returning(2), Priority::Low).is_scheduled());
    assert_eq!(cache.invalidate_by_tags(["g"]), 1);
    assert_eq!(cache.queued_preloads(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.count(), 0);
    assert!(cache.is_empty());
}

/// Verifies shutdown cancels queued preloads and rejects new ones.
#[tokio::test]
async fn test_shutdown_cancels_queued_preloads() {
    let cache = cache();
    let calls = CallCounter::new();

    cache.preload("k", calls.returning(1), Priority::Low);
    tokio::time::timeout(Duration::from_secs(1), cache.shutdown()).await.unwrap().unwrap();

    assert_eq!(cache.queued_preloads(), 0);
    assert_eq!(calls.count(), 0);
    assert_eq!(cache.preload("other", calls.returning(2), Priority::High), PreloadOutcome::Rejected);
}
