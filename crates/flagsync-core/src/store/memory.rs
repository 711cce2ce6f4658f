// # Memory Key-Value Store
//
// In-memory implementation of KvStore.
//
// ## Purpose
//
// Provides a single-process stand-in for the distributed store with the same
// observable semantics the synchronizer depends on:
// - a global change index bumped by every mutation
// - recursive reads with implied directory nodes
// - watches that replay history after an index, then follow live changes
// - conditional set/delete on `prev_index`
// - bounded history: a watcher whose cursor fell out of it gets
//   `StoreError::Compacted`
//
// ## When to Use
//
// - Embedding the synchronizer without a cluster
// - Testing environments

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::normalize_prefix;
use crate::error::StoreError;
use crate::traits::kv_store::{
    Action, ChangeEvent, DeleteOptions, GetOptions, KvStore, Node, SetOptions, Snapshot,
    WatchOptions, WatchStream,
};

/// Default number of mutations kept for watchers to replay
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// In-memory key-value store implementation
///
/// Cloning yields another handle to the same store.
///
/// # Example
///
/// ```rust,no_run
/// use flagsync_core::store::MemoryKvStore;
/// use flagsync_core::traits::{GetOptions, KvStore, SetOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryKvStore::new();
///     store.set("/config/workers", "4", SetOptions::default()).await?;
///
///     let snapshot = store.get("/config/", GetOptions::recursive()).await?;
///     assert_eq!(snapshot.nodes.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ChangeEvent>,
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<ChangeEvent>,
    history_limit: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    modified_index: u64,
}

impl Inner {
    /// Index of the oldest mutation a watcher can still replay
    fn oldest_retained(&self) -> u64 {
        self.history
            .front()
            .map(|event| event.modified_index)
            .unwrap_or(self.index + 1)
    }

    fn check_condition(&self, key: &str, prev_index: Option<u64>) -> Result<(), StoreError> {
        let Some(expected) = prev_index else {
            return Ok(());
        };
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        if entry.modified_index != expected {
            return Err(StoreError::ConditionFailed {
                key: key.to_string(),
                expected,
                actual: entry.modified_index,
            });
        }
        Ok(())
    }

    fn record(&mut self, event: ChangeEvent, events: &broadcast::Sender<ChangeEvent>) {
        self.history.push_back(event.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        // No subscribers is fine
        let _ = events.send(event);
    }
}

impl MemoryKvStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a new empty store that keeps `limit` mutations of history
    pub fn with_history_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        let (events, _) = broadcast::channel(limit);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                index: 0,
                history: VecDeque::new(),
                history_limit: limit,
            })),
            events,
        }
    }

    /// Index of the latest mutation
    pub fn current_index(&self) -> u64 {
        self.inner.lock().index
    }

    /// Current value of `key`
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Modified index of `key`
    pub fn modified_index(&self, key: &str) -> Option<u64> {
        self.inner.lock().entries.get(key).map(|e| e.modified_index)
    }

    /// Drop all retained history
    ///
    /// Watchers resuming from any index older than the current one will be
    /// told their cursor was compacted away.
    pub fn compact(&self) {
        self.inner.lock().history.clear();
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key_matches(path: &str, recursive: bool, key: &str) -> bool {
    if key == path {
        return true;
    }
    recursive && key.starts_with(&normalize_prefix(path))
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.ends_with('/') {
        return Err(StoreError::other(format!("invalid key: {:?}", key)));
    }
    Ok(())
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, path: &str, options: GetOptions) -> Result<Snapshot, StoreError> {
        let inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(path) {
            return Ok(Snapshot {
                index: inner.index,
                nodes: vec![Node::leaf(path, entry.value.clone(), entry.modified_index)],
            });
        }

        let dir = normalize_prefix(path);
        let mut nodes = Vec::new();
        let mut dirs = BTreeSet::new();

        for (key, entry) in inner.entries.range(dir.clone()..) {
            let Some(rest) = key.strip_prefix(&dir) else {
                break;
            };
            let segments: Vec<&str> = rest.split('/').collect();
            if segments.len() == 1 {
                nodes.push(Node::leaf(key.clone(), entry.value.clone(), entry.modified_index));
                continue;
            }

            dirs.insert(format!("{}{}", dir, segments[0]));
            if options.recursive {
                for depth in 2..segments.len() {
                    dirs.insert(format!("{}{}", dir, segments[..depth].join("/")));
                }
                nodes.push(Node::leaf(key.clone(), entry.value.clone(), entry.modified_index));
            }
        }

        nodes.extend(dirs.into_iter().map(|key| Node::directory(key, inner.index)));
        if options.sorted {
            nodes.sort_by(|a, b| a.key.cmp(&b.key));
        }

        Ok(Snapshot {
            index: inner.index,
            nodes,
        })
    }

    fn watch(&self, path: &str, options: WatchOptions) -> WatchStream {
        let path = path.to_string();
        let after = options.after_index;
        let recursive = options.recursive;

        // Subscribe and collect the backlog under the lock that writers hold
        // while recording, so nothing falls between the two.
        let inner = self.inner.lock();
        let receiver = self.events.subscribe();

        let oldest = inner.oldest_retained();
        if after < inner.index && after + 1 < oldest {
            return Box::pin(tokio_stream::once(Err(StoreError::Compacted {
                requested: after,
                oldest,
            })));
        }

        let backlog: Vec<Result<ChangeEvent, StoreError>> = inner
            .history
            .iter()
            .filter(|event| event.modified_index > after)
            .filter(|event| key_matches(&path, recursive, &event.key))
            .cloned()
            .map(Ok)
            .collect();
        drop(inner);

        let mut cursor = after;
        let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(event) => {
                cursor = event.modified_index;
                (event.modified_index > after && key_matches(&path, recursive, &event.key))
                    .then_some(Ok(event))
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(StoreError::Compacted {
                requested: cursor,
                oldest: cursor + missed + 1,
            })),
        });

        Box::pin(tokio_stream::iter(backlog).chain(live))
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<u64, StoreError> {
        validate_key(key)?;
        let mut inner = self.inner.lock();
        inner.check_condition(key, options.prev_index)?;

        inner.index += 1;
        let index = inner.index;
        let previous = inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                modified_index: index,
            },
        );

        let action = if options.prev_index.is_some() {
            Action::CompareAndSwap
        } else {
            Action::Set
        };
        let event = ChangeEvent {
            action,
            key: key.to_string(),
            value: Some(value.to_string()),
            dir: false,
            modified_index: index,
            previous_value: previous.map(|entry| entry.value),
        };
        inner.record(event, &self.events);

        Ok(index)
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<u64, StoreError> {
        validate_key(key)?;
        let mut inner = self.inner.lock();
        inner.check_condition(key, options.prev_index)?;

        let previous = inner
            .entries
            .remove(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        inner.index += 1;
        let index = inner.index;

        let action = if options.prev_index.is_some() {
            Action::CompareAndDelete
        } else {
            Action::Delete
        };
        let event = ChangeEvent {
            action,
            key: key.to_string(),
            value: None,
            dir: false,
            modified_index: index,
            previous_value: Some(previous.value),
        };
        inner.record(event, &self.events);

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(stream: &mut WatchStream) -> Result<ChangeEvent, StoreError> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("watch yields in time")
            .expect("stream open")
    }

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryKvStore::new();

        let first = store.set("/config/a", "1", SetOptions::default()).await.unwrap();
        let second = store.set("/config/b", "2", SetOptions::default()).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(store.value("/config/a"), Some("1".to_string()));

        store.delete("/config/a", DeleteOptions::default()).await.unwrap();
        assert_eq!(store.value("/config/a"), None);
        assert_eq!(store.current_index(), 3);
    }

    #[tokio::test]
    async fn recursive_get_reports_directories() {
        let store = MemoryKvStore::new();
        store.set("/config/a", "1", SetOptions::default()).await.unwrap();
        store.set("/config/sub/x", "2", SetOptions::default()).await.unwrap();
        store.set("/other/y", "3", SetOptions::default()).await.unwrap();

        let snapshot = store.get("/config", GetOptions::recursive()).await.unwrap();
        let keys: Vec<(&str, bool)> = snapshot
            .nodes
            .iter()
            .map(|node| (node.key.as_str(), node.dir))
            .collect();
        assert_eq!(
            keys,
            vec![("/config/a", false), ("/config/sub", true), ("/config/sub/x", false)]
        );
        assert_eq!(snapshot.index, 3);

        let shallow = store.get("/config/", GetOptions::default()).await.unwrap();
        assert_eq!(shallow.nodes.len(), 2);
    }

    #[tokio::test]
    async fn conditional_writes_check_modified_index() {
        let store = MemoryKvStore::new();
        let index = store.set("/config/a", "1", SetOptions::default()).await.unwrap();

        let err = store
            .set("/config/a", "2", SetOptions { prev_index: Some(index + 5) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        store
            .set("/config/a", "2", SetOptions { prev_index: Some(index) })
            .await
            .unwrap();
        assert_eq!(store.value("/config/a"), Some("2".to_string()));

        let err = store
            .delete("/config/a", DeleteOptions { prev_index: Some(index) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        let err = store
            .delete("/config/missing", DeleteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn watch_replays_history_then_follows_live_changes() {
        let store = MemoryKvStore::new();
        store.set("/config/a", "1", SetOptions::default()).await.unwrap();
        store.set("/config/a", "2", SetOptions::default()).await.unwrap();

        let mut stream = store.watch("/config/", WatchOptions::after(1));
        let replayed = next_event(&mut stream).await.unwrap();
        assert_eq!(replayed.modified_index, 2);
        assert_eq!(replayed.previous_value.as_deref(), Some("1"));

        store.set("/elsewhere/x", "0", SetOptions::default()).await.unwrap();
        store.delete("/config/a", DeleteOptions::default()).await.unwrap();

        let live = next_event(&mut stream).await.unwrap();
        assert_eq!(live.action, Action::Delete);
        assert_eq!(live.value, None);
        assert_eq!(live.modified_index, 4);
    }

    #[tokio::test]
    async fn watch_behind_compacted_history_fails() {
        let store = MemoryKvStore::with_history_limit(2);
        for i in 0..5 {
            store
                .set("/config/a", &i.to_string(), SetOptions::default())
                .await
                .unwrap();
        }

        let mut stream = store.watch("/config/", WatchOptions::after(1));
        let err = next_event(&mut stream).await.unwrap_err();
        assert_eq!(err, StoreError::Compacted { requested: 1, oldest: 4 });

        store.compact();
        let mut stream = store.watch("/config/", WatchOptions::after(4));
        assert!(matches!(
            next_event(&mut stream).await,
            Err(StoreError::Compacted { .. })
        ));

        // Fully caught-up watchers are unaffected
        let mut stream = store.watch("/config/", WatchOptions::after(5));
        store.set("/config/a", "x", SetOptions::default()).await.unwrap();
        assert_eq!(next_event(&mut stream).await.unwrap().modified_index, 6);
    }

    #[tokio::test]
    async fn lagging_live_watcher_is_told_it_was_compacted() {
        let store = MemoryKvStore::with_history_limit(1);
        let mut stream = store.watch("/config/", WatchOptions::after(0));

        // Two writes before the watcher reads anything; only one fits
        store.set("/config/a", "1", SetOptions::default()).await.unwrap();
        store.set("/config/a", "2", SetOptions::default()).await.unwrap();

        let err = next_event(&mut stream).await.unwrap_err();
        assert_eq!(err, StoreError::Compacted { requested: 0, oldest: 2 });

        // The newest change is still delivered afterwards
        let event = next_event(&mut stream).await.unwrap();
        assert_eq!(event.modified_index, 2);
        assert_eq!(event.value.as_deref(), Some("2"));
    }
}
