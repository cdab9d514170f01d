//! Shared helpers for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("adaptive_cache=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Producer future that waits on a gate.
pub type GatedFuture<V> = Pin<Box<dyn Future<Output = Result<V, io::Error>> + Send>>;

/// Counts producer invocations.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Producer returning `value` immediately.
    pub fn returning<V>(&self, value: V) -> impl FnOnce() -> std::future::Ready<Result<V, io::Error>> + Send + 'static
    where
        V: Send + 'static,
    {
        let calls = Arc::clone(&self.0);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    /// Producer failing with `message`.
    pub fn failing<V>(&self, message: &'static str) -> impl FnOnce() -> std::future::Ready<Result<V, io::Error>> + Send + 'static
    where
        V: Send + 'static,
    {
        let calls = Arc::clone(&self.0);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(io::Error::other(message)))
        }
    }

    /// Producer that returns `value` only once `gate` is notified.
    pub fn gated<V>(
        &self,
        gate: &Arc<Notify>,
        value: V,
    ) -> impl FnOnce() -> GatedFuture<V> + Send + 'static
    where
        V: Send + 'static,
    {
        let calls = Arc::clone(&self.0);
        let gate = Arc::clone(gate);
        move || -> GatedFuture<V> {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                gate.notified().await;
                Ok(value)
            })
        }
    }
}

/// Poll `condition` every few milliseconds until it holds or two seconds pass.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 2s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
