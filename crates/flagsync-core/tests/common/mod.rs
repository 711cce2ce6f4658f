//! Test doubles and common utilities for synchronizer contract tests
//!
//! This module provides minimal test doubles that let tests script exactly
//! what the store returns and observe exactly what the synchronizer writes.

#![allow(dead_code)]

use flagsync_core::error::StoreError;
use flagsync_core::traits::{
    ChangeEvent, DeleteOptions, GetOptions, KvStore, Node, SetOptions, Snapshot, WatchOptions,
    WatchStream,
};
use flagsync_core::{FlagSet, SyncConfig, Synchronizer, WatchConfig};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PREFIX: &str = "/config/";

/// A write the synchronizer issued against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Set {
        key: String,
        value: String,
        prev_index: Option<u64>,
    },
    Delete {
        key: String,
        prev_index: Option<u64>,
    },
}

type WatchItem = Result<ChangeEvent, StoreError>;

/// A KvStore whose reads are canned and whose watch items are pushed by the test
pub struct ScriptedStore {
    /// Snapshot returned by get()
    snapshot: Mutex<Snapshot>,
    /// Error returned by get() instead of the snapshot
    get_error: Mutex<Option<StoreError>>,
    /// Call counter for get()
    get_call_count: AtomicUsize,
    /// `after_index` of every watch() call
    watch_calls: Mutex<Vec<u64>>,
    /// Sender feeding the most recently opened watch stream
    watch_tx: Mutex<Option<mpsc::UnboundedSender<WatchItem>>>,
    /// Every set()/delete() received
    writes: Mutex<Vec<Write>>,
    /// Error returned by set()/delete()
    write_error: Mutex<Option<StoreError>>,
}

impl ScriptedStore {
    /// Create a store serving `entries` (key suffixes under PREFIX) at `index`
    pub fn new(index: u64, entries: &[(&str, &str)]) -> Arc<Self> {
        let nodes = entries
            .iter()
            .map(|(name, value)| Node::leaf(format!("{}{}", PREFIX, name), *value, index))
            .collect();

        Arc::new(Self {
            snapshot: Mutex::new(Snapshot { index, nodes }),
            get_error: Mutex::new(None),
            get_call_count: AtomicUsize::new(0),
            watch_calls: Mutex::new(Vec::new()),
            watch_tx: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            write_error: Mutex::new(None),
        })
    }

    /// Replace the snapshot served by subsequent get() calls
    pub fn set_snapshot(&self, index: u64, entries: &[(&str, &str)]) {
        let nodes = entries
            .iter()
            .map(|(name, value)| Node::leaf(format!("{}{}", PREFIX, name), *value, index))
            .collect();
        *self.snapshot.lock().unwrap() = Snapshot { index, nodes };
    }

    /// Make get() fail (or succeed again with `None`)
    pub fn fail_get_with(&self, error: Option<StoreError>) {
        *self.get_error.lock().unwrap() = error;
    }

    /// Make set()/delete() fail with `error`
    pub fn fail_writes_with(&self, error: StoreError) {
        *self.write_error.lock().unwrap() = Some(error);
    }

    /// Deliver an item on the most recently opened watch stream
    pub fn push(&self, item: WatchItem) {
        let tx = self.watch_tx.lock().unwrap();
        tx.as_ref()
            .expect("a watch is open")
            .send(item)
            .expect("watch stream alive");
    }

    /// Deliver a change to `name` under PREFIX
    pub fn push_change(&self, name: &str, value: &str, index: u64, previous: Option<&str>) {
        self.push(Ok(ChangeEvent::set(
            format!("{}{}", PREFIX, name),
            value,
            index,
            previous.map(str::to_string),
        )));
    }

    /// Close the most recently opened watch stream
    pub fn close_watch(&self) {
        self.watch_tx.lock().unwrap().take();
    }

    pub fn get_call_count(&self) -> usize {
        self.get_call_count.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> Vec<u64> {
        self.watch_calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl KvStore for ScriptedStore {
    async fn get(&self, _path: &str, _options: GetOptions) -> Result<Snapshot, StoreError> {
        self.get_call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.get_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn watch(&self, _path: &str, options: WatchOptions) -> WatchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        // Sender first: tests push as soon as they observe the call
        *self.watch_tx.lock().unwrap() = Some(tx);
        self.watch_calls.lock().unwrap().push(options.after_index);
        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<u64, StoreError> {
        self.writes.lock().unwrap().push(Write::Set {
            key: key.to_string(),
            value: value.to_string(),
            prev_index: options.prev_index,
        });
        match self.write_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(0),
        }
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<u64, StoreError> {
        self.writes.lock().unwrap().push(Write::Delete {
            key: key.to_string(),
            prev_index: options.prev_index,
        });
        match self.write_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(0),
        }
    }
}

/// Watch timing short enough for tests
pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        recovery_delay_ms: 10,
        cluster_retry_delay_ms: 10,
        backoff_base_ms: 20,
        backoff_jitter_ms: 5,
    }
}

/// Helper to create a synchronizer over PREFIX with fast timing
pub fn synchronizer(flags: &Arc<FlagSet>, store: Arc<dyn KvStore>) -> Synchronizer {
    let config = SyncConfig::new(PREFIX).with_watch(fast_watch_config());
    Synchronizer::new(flags.clone(), store, config).expect("synchronizer construction succeeds")
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Give the watch loop time to process what was pushed
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
