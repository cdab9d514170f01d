//! Per-key registry of running fetches and refreshes
//!
//! At most one record exists per key. [`InFlightRegistry::try_begin`] is the
//! check-and-register step; it is only ever called while the coordinator
//! holds its state lock, so "two callers both see no record" cannot happen.
//!
//! Each record owns a child [`CancellationToken`] of the registry root, so an
//! invalidation can stop one refresh and shutdown can stop all of them, and a
//! `watch` channel that flips to `true` when the record ends. Callers that
//! found a fetch already running wait on that channel instead of starting a
//! duplicate.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Proof of a successful [`InFlightRegistry::try_begin`]
///
/// Not `Clone`: exactly one holder may end the record.
#[derive(Debug)]
pub struct InFlightToken {
    key: String,
    id: u64,
    cancel: CancellationToken,
}

impl InFlightToken {
    /// Key the token was issued for
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancellation signal for the operation this token covers
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the operation was cancelled by invalidation or shutdown
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handle for waiting on somebody else's in-flight operation
#[derive(Debug, Clone)]
pub struct InFlightWait {
    settled: watch::Receiver<bool>,
}

impl InFlightWait {
    /// Resolve once the operation has ended, on any exit path
    pub async fn settled(mut self) {
        // A dropped sender also means the record is gone.
        let _ = self.settled.wait_for(|done| *done).await;
    }
}

/// Result of [`InFlightRegistry::try_begin`]
#[derive(Debug)]
pub enum TryBegin {
    /// No operation was running; the caller now owns the record
    Started(InFlightToken),
    /// An operation is already running for the key
    AlreadyRunning(InFlightWait),
}

#[derive(Debug)]
struct InFlightRecord {
    id: u64,
    started_at: Instant,
    cancel: CancellationToken,
    settled: watch::Sender<bool>,
}

/// Registry of in-flight operations keyed by cache key
#[derive(Debug)]
pub struct InFlightRegistry {
    records: HashMap<String, InFlightRecord>,
    next_id: u64,
    root: CancellationToken,
}

impl InFlightRegistry {
    /// Create a registry whose record tokens descend from `root`
    pub fn new(root: CancellationToken) -> Self {
        Self { records: HashMap::new(), next_id: 0, root }
    }

    /// Register an operation for `key` unless one is already running
    ///
    /// The first caller gets [`TryBegin::Started`] and must hand the token
    /// back through [`InFlightRegistry::end`]. Every later caller gets a
    /// [`TryBegin::AlreadyRunning`] handle that settles when the record ends
    /// or is cancelled.
    ///
    /// # Example
    /// ```
    /// use std::time::Instant;
    ///
    /// use adaptive_cache::{InFlightRegistry, TryBegin};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// let mut registry = InFlightRegistry::new(CancellationToken::new());
    /// let TryBegin::Started(token) = registry.try_begin("k", Instant::now()) else {
    ///     panic!("registry was empty");
    /// };
    /// assert!(matches!(registry.try_begin("k", Instant::now()), TryBegin::AlreadyRunning(_)));
    ///
    /// assert!(registry.end(token));
    /// assert!(registry.is_empty());
    /// ```
    pub fn try_begin(&mut self, key: &str, now: Instant) -> TryBegin {
        if let Some(record) = self.records.get(key) {
            return TryBegin::AlreadyRunning(InFlightWait { settled: record.settled.subscribe() });
        }

        self.next_id += 1;
        let id = self.next_id;
        let cancel = self.root.child_token();
        let (settled, _) = watch::channel(false);
        self.records.insert(
            key.to_string(),
            InFlightRecord { id, started_at: now, cancel: cancel.clone(), settled },
        );

        TryBegin::Started(InFlightToken { key: key.to_string(), id, cancel })
    }

    /// End the record `token` was issued for and wake its waiters
    ///
    /// Returns false when the record was already replaced or removed, which
    /// happens after `cancel` has detached it.
    pub fn end(&mut self, token: InFlightToken) -> bool {
        match self.records.get(&token.key) {
            Some(record) if record.id == token.id => {
                if let Some(record) = self.records.remove(&token.key) {
                    record.settled.send_replace(true);
                }
                true
            }
            _ => false,
        }
    }

    /// Cancel the operation running for `key`, if any
    ///
    /// The record is detached immediately so a new fetch may begin; the
    /// cancelled holder's later `end` is a no-op.
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.records.remove(key) {
            Some(record) => {
                record.cancel.cancel();
                record.settled.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Cancel every running operation
    pub fn cancel_all(&mut self) -> usize {
        let count = self.records.len();
        for (_, record) in self.records.drain() {
            record.cancel.cancel();
            record.settled.send_replace(true);
        }
        count
    }

    /// When the operation for `key` started
    pub fn started_at(&self, key: &str) -> Option<Instant> {
        self.records.get(key).map(|record| record.started_at)
    }

    /// Whether an operation is running for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Number of running operations
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is running
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
