// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Cluster-state store contract and the in-process implementation.
//!
//! Any linearizable, change-notifying store satisfies the contract:
//! reads return a versioned snapshot, updates are compare-and-swap on the
//! version, and subscribers observe `(previous, current)` pairs in commit
//! order. Listeners may re-observe an unchanged state and must be
//! idempotent to that.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::BenchmarkMetaData;

/// Cluster-state store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The version moved between read and write; retry the update
    #[error("stale cluster state: expected version {expected}, found {found}")]
    Stale {
        /// Version the update was based on
        expected: u64,
        /// Version found at commit time
        found: u64,
    },

    /// The mutator refused to apply (state no longer admits the change)
    #[error("update rejected: {0}")]
    Rejected(String),

    /// The store is shut down
    #[error("cluster-state store closed")]
    Closed,
}

/// A versioned snapshot of the benchmark document
#[derive(Debug, Clone)]
pub struct MetaSnapshot {
    /// Commit version of the snapshot
    pub version: u64,
    /// The document at that version
    pub metadata: BenchmarkMetaData,
}

/// A committed change, delivered to subscribers in commit order
#[derive(Debug, Clone)]
pub struct StateEvent {
    /// Document before the commit
    pub previous: BenchmarkMetaData,
    /// Document after the commit
    pub current: BenchmarkMetaData,
}

/// Fallible mutation applied atomically under the store's CAS
pub type Mutator = Box<dyn FnOnce(&mut BenchmarkMetaData) -> Result<(), StoreError> + Send>;

/// The replicated store holding [`BenchmarkMetaData`]
#[async_trait]
pub trait ClusterStateStore: Send + Sync {
    /// Read the current snapshot
    async fn read(&self) -> MetaSnapshot;

    /// Apply `mutate` atomically. Fails with [`StoreError::Stale`] when the
    /// version moved underneath the update.
    async fn update(&self, mutate: Mutator) -> Result<MetaSnapshot, StoreError>;

    /// Subscribe to committed changes. Each subscriber sees its own events
    /// in commit order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent>;
}

/// Maximum CAS attempts before an update is given up
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 8;

/// Apply `mutate` through [`ClusterStateStore::update`], retrying stale
/// conflicts with bounded exponential backoff. [`StoreError::Stale`] never
/// escapes this helper unless every attempt was stale.
pub async fn update_with_retry<F>(
    store: &dyn ClusterStateStore,
    attempts: u32,
    mutate: F,
) -> Result<MetaSnapshot, StoreError>
where
    F: Fn(&mut BenchmarkMetaData) -> Result<(), StoreError> + Clone + Send + 'static,
{
    let mut backoff = Duration::from_millis(5);
    let mut last = StoreError::Closed;
    for attempt in 0..attempts.max(1) {
        let apply = mutate.clone();
        match store.update(Box::new(move |meta| apply(meta))).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err @ StoreError::Stale { .. }) => {
                debug!(attempt, %err, "stale cluster-state update, retrying");
                last = err;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(250));
            }
            Err(err) => return Err(err),
        }
    }
    Err(last)
}

/// In-process [`ClusterStateStore`] used by the local cluster and tests.
///
/// Commits are serialized under one lock, so the CAS can only be observed
/// failing through the stale-injection hook.
pub struct InMemoryStateStore {
    inner: Mutex<StoreInner>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StateEvent>>>,
    injected_stale: AtomicUsize,
}

struct StoreInner {
    version: u64,
    metadata: BenchmarkMetaData,
}

impl InMemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                version: 0,
                metadata: BenchmarkMetaData::default(),
            }),
            subscribers: Mutex::new(Vec::new()),
            injected_stale: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` updates fail with [`StoreError::Stale`]
    pub fn inject_stale(&self, count: usize) {
        self.injected_stale.store(count, Ordering::SeqCst);
    }

    fn take_injected_stale(&self) -> bool {
        self.injected_stale
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn fanout(&self, event: StateEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStateStore for InMemoryStateStore {
    async fn read(&self) -> MetaSnapshot {
        let inner = self.inner.lock();
        MetaSnapshot {
            version: inner.version,
            metadata: inner.metadata.clone(),
        }
    }

    async fn update(&self, mutate: Mutator) -> Result<MetaSnapshot, StoreError> {
        if self.take_injected_stale() {
            let version = self.inner.lock().version;
            return Err(StoreError::Stale {
                expected: version,
                found: version + 1,
            });
        }

        let event;
        let snapshot;
        {
            let mut inner = self.inner.lock();
            let previous = inner.metadata.clone();
            let mut next = inner.metadata.clone();
            mutate(&mut next)?;
            inner.version += 1;
            inner.metadata = next.clone();
            snapshot = MetaSnapshot {
                version: inner.version,
                metadata: next.clone(),
            };
            event = StateEvent {
                previous,
                current: next,
            };
        }
        self.fanout(event);
        Ok(snapshot)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, NodeState};
    use std::sync::Arc;

    fn insert_entry(id: &str) -> impl Fn(&mut BenchmarkMetaData) -> Result<(), StoreError> + Clone {
        let id = id.to_string();
        move |meta: &mut BenchmarkMetaData| {
            meta.entries
                .insert(id.clone(), Entry::new(id.clone(), vec!["n1".to_string()]));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_update_and_read() {
        let store = InMemoryStateStore::new();
        let snapshot = store.update(Box::new(insert_entry("b1"))).await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.metadata.entry("b1").is_some());

        let read = store.read().await;
        assert_eq!(read.version, 1);
        assert_eq!(read.metadata, snapshot.metadata);
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_state_untouched() {
        let store = InMemoryStateStore::new();
        store.update(Box::new(insert_entry("b1"))).await.unwrap();

        let result = store
            .update(Box::new(|meta: &mut BenchmarkMetaData| {
                meta.entries.clear();
                Err(StoreError::Rejected("nope".to_string()))
            }))
            .await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));

        let read = store.read().await;
        assert_eq!(read.version, 1);
        assert!(read.metadata.entry("b1").is_some());
    }

    #[tokio::test]
    async fn test_subscribers_see_commit_order() {
        let store = InMemoryStateStore::new();
        let mut events = store.subscribe();

        store.update(Box::new(insert_entry("b1"))).await.unwrap();
        store
            .update(Box::new(|meta: &mut BenchmarkMetaData| {
                if let Some(entry) = meta.entry_mut("b1") {
                    entry.set_node_state(&"n1".to_string(), NodeState::Ready);
                }
                Ok(())
            }))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert!(first.previous.entries.is_empty());
        assert!(first.current.entry("b1").is_some());

        let second = events.recv().await.unwrap();
        assert_eq!(
            second.previous.entry("b1").unwrap().node_state(&"n1".to_string()),
            Some(NodeState::Initializing)
        );
        assert_eq!(
            second.current.entry("b1").unwrap().node_state(&"n1".to_string()),
            Some(NodeState::Ready)
        );
    }

    #[tokio::test]
    async fn test_update_with_retry_recovers_from_stale() {
        let store = Arc::new(InMemoryStateStore::new());
        store.inject_stale(2);

        let snapshot = update_with_retry(store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, insert_entry("b1"))
            .await
            .unwrap();
        assert!(snapshot.metadata.entry("b1").is_some());
    }

    #[tokio::test]
    async fn test_update_with_retry_gives_up() {
        let store = Arc::new(InMemoryStateStore::new());
        store.inject_stale(100);

        let result = update_with_retry(store.as_ref(), 3, insert_entry("b1")).await;
        assert!(matches!(result, Err(StoreError::Stale { .. })));
        assert!(store.read().await.metadata.entries.is_empty());
    }
}
