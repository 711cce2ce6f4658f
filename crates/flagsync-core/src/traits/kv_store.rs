// # Key-Value Store Trait
//
// Defines the interface to the distributed, hierarchical key-value store that
// holds the authoritative flag values.
//
// ## Store Model
//
// - Keys are `/`-separated paths; directories are implied by deeper keys
// - Every mutation is assigned a global, monotonically increasing change index
// - Writes and deletes may be conditioned on the index of the current value
//
// ## Implementations
//
// - In-memory: `MemoryKvStore` (embedding and tests)
// - Network clients live outside this crate and adapt their native errors
//   onto [`StoreError`]
//
// ## Usage
//
// ```rust,ignore
// use flagsync_core::traits::{KvStore, GetOptions, WatchOptions};
// use tokio_stream::StreamExt;
//
// let snapshot = store.get("/config/", GetOptions::recursive()).await?;
//
// let mut stream = store.watch("/config/", WatchOptions::after(snapshot.index));
// while let Some(item) = stream.next().await {
//     println!("change: {:?}", item);
// }
// ```

use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::StoreError;

/// One node returned by a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Absolute key
    pub key: String,
    /// Stored value (empty for directories)
    pub value: String,
    /// Whether this node is a directory
    pub dir: bool,
    /// Index of the mutation that last touched this node
    pub modified_index: u64,
}

impl Node {
    /// Create a leaf node
    pub fn leaf(key: impl Into<String>, value: impl Into<String>, modified_index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            dir: false,
            modified_index,
        }
    }

    /// Create a directory node
    pub fn directory(key: impl Into<String>, modified_index: u64) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            dir: true,
            modified_index,
        }
    }
}

/// Result of a (recursive) read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Store index at the time of the read; watching after it misses nothing
    pub index: u64,
    /// Nodes below the requested path
    pub nodes: Vec<Node>,
}

/// Kind of mutation reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Set => "set",
            Action::Create => "create",
            Action::Update => "update",
            Action::CompareAndSwap => "compareAndSwap",
            Action::Delete => "delete",
            Action::CompareAndDelete => "compareAndDelete",
            Action::Expire => "expire",
        };
        f.write_str(name)
    }
}

/// One mutation observed while watching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What happened
    pub action: Action,
    /// Absolute key that changed
    pub key: String,
    /// New value (`None` for deletions and expirations)
    pub value: Option<String>,
    /// Whether the key is a directory
    pub dir: bool,
    /// Index assigned to this mutation
    pub modified_index: u64,
    /// Value held before this mutation, if the key existed
    pub previous_value: Option<String>,
}

impl ChangeEvent {
    /// Create a value-carrying event
    ///
    /// This constructor is public for use in:
    /// - `KvStore` implementations
    /// - Contract tests within flagsync-core
    pub fn set(
        key: impl Into<String>,
        value: impl Into<String>,
        modified_index: u64,
        previous_value: Option<String>,
    ) -> Self {
        Self {
            action: Action::Set,
            key: key.into(),
            value: Some(value.into()),
            dir: false,
            modified_index,
            previous_value,
        }
    }

    /// Create a deletion event
    pub fn delete(key: impl Into<String>, modified_index: u64, previous_value: Option<String>) -> Self {
        Self {
            action: Action::Delete,
            key: key.into(),
            value: None,
            dir: false,
            modified_index,
            previous_value,
        }
    }
}

/// Options for [`KvStore::get`]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Include nodes deeper than one level below the path
    pub recursive: bool,
    /// Return nodes ordered by key
    pub sorted: bool,
}

impl GetOptions {
    /// Recursive, sorted read (what a bulk load needs)
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            sorted: true,
        }
    }
}

/// Options for [`KvStore::watch`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Only report mutations with an index strictly greater than this
    pub after_index: u64,
    /// Report mutations anywhere below the path
    pub recursive: bool,
}

impl WatchOptions {
    /// Recursive watch resuming after `index`
    pub fn after(index: u64) -> Self {
        Self {
            after_index: index,
            recursive: true,
        }
    }
}

/// Options for [`KvStore::set`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Only write if the key's current modified index equals this
    pub prev_index: Option<u64>,
}

/// Options for [`KvStore::delete`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Only delete if the key's current modified index equals this
    pub prev_index: Option<u64>,
}

/// Stream of watch results
///
/// Errors are items, not terminators: a stream may yield an error and keep
/// going. A stream that ends is treated by consumers as a dropped watch.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, StoreError>> + Send + 'static>>;

/// Trait for key-value store clients
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Error Mapping
///
/// The watch loop picks its recovery strategy from the error variant:
///
/// - [`StoreError::Compacted`]: history no longer reaches the cursor; the
///   caller re-reads everything
/// - [`StoreError::ClusterUnavailable`]: short fixed retry
/// - [`StoreError::Timeout`]: immediate retry
/// - [`StoreError::Cancelled`]: the caller stops
/// - anything else: jittered backoff
///
/// Conditional writes must report a mismatch as [`StoreError::ConditionFailed`],
/// which callers treat as "someone else already changed it".
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the nodes below `path`
    ///
    /// # Returns
    ///
    /// - `Ok(Snapshot)`: the nodes and the index the read was served at
    /// - `Err(StoreError)`: the read failed
    async fn get(&self, path: &str, options: GetOptions) -> Result<Snapshot, StoreError>;

    /// Watch for mutations below `path`
    ///
    /// # Behavior
    ///
    /// - Yields every mutation with index > `options.after_index`, in order
    /// - Yields [`StoreError::Compacted`] when that history is gone
    /// - Must be cancellation-safe (dropping the stream cleans up resources)
    fn watch(&self, path: &str, options: WatchOptions) -> WatchStream;

    /// Write `value` at `key`
    ///
    /// # Returns
    ///
    /// - `Ok(u64)`: the index assigned to the write
    /// - `Err(StoreError::ConditionFailed)`: `prev_index` did not match
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<u64, StoreError>;

    /// Delete `key`
    ///
    /// # Returns
    ///
    /// - `Ok(u64)`: the index assigned to the deletion
    /// - `Err(StoreError::ConditionFailed)`: `prev_index` did not match
    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<u64, StoreError>;
}
