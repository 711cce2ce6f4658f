//! Flag synchronization engine
//!
//! The Synchronizer is responsible for:
//! - Reading every flag under the prefix once at start-up
//! - Watching the prefix for changes and applying them to dynamic flags
//! - Rolling back changes this process refused to apply
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   KvStore   │─── Snapshot / ChangeEvent ───┐
//! └─────────────┘                              │
//!        ▲                                     ▼
//!        │                            ┌──────────────┐
//!        │ rollback (prev_index)      │ Synchronizer │
//!        │                            │  WatchLoop   │
//!        │                            └──────────────┘
//!        │                                     │
//!        └─────────────────────────────────────┤ set(&str)
//!                                              ▼
//!                                     ┌──────────────┐
//!                                     │ FlagRegistry │
//!                                     └──────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! 1. Create with [`Synchronizer::new()`]
//! 2. Load everything with [`Synchronizer::initialize()`]
//! 3. Spawn the watch loop with [`Synchronizer::start()`]
//! 4. Request cancellation with [`Synchronizer::stop()`]
//!
//! Lifecycle methods take `&mut self`, so callers serialize them. The only
//! state shared with the running loop is the resume cursor.

mod watch;

pub use watch::{RollbackOutcome, WatchState};

use crate::config::{SyncConfig, WatchConfig};
use crate::error::{Error, Result};
use crate::traits::{FlagRegistry, GetOptions, KvStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use watch::WatchLoop;

/// Keeps a flag registry synchronized with one store prefix
///
/// # Example
///
/// ```rust,ignore
/// let mut sync = Synchronizer::new(flags, store, SyncConfig::new("/config/myapp"))?;
/// sync.initialize().await?;
/// sync.start()?;
/// // ...
/// sync.stop()?;
/// sync.wait_stopped().await?;
/// ```
pub struct Synchronizer {
    applier: Arc<FlagApplier>,

    /// Backoff and recovery timing for the watch loop
    watch_config: WatchConfig,

    /// Set once `initialize()` has read a snapshot
    initialized: bool,

    /// Resume cursor, advanced by the watch loop
    cursor: Arc<AtomicU64>,

    /// Cancellation for the active loop (`None` when not watching)
    cancel: Option<CancellationToken>,

    /// Most recently spawned loop task
    task: Option<JoinHandle<()>>,
}

impl Synchronizer {
    /// Create a new synchronizer
    ///
    /// # Parameters
    ///
    /// - `registry`: Flags to write into
    /// - `store`: Store holding the authoritative values
    /// - `config`: Prefix and watch settings
    pub fn new(
        registry: Arc<dyn FlagRegistry>,
        store: Arc<dyn KvStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let applier = FlagApplier {
            registry,
            store,
            prefix: config.normalized_prefix(),
        };

        Ok(Self {
            applier: Arc::new(applier),
            watch_config: config.watch,
            initialized: false,
            cursor: Arc::new(AtomicU64::new(0)),
            cancel: None,
            task: None,
        })
    }

    /// Read every flag under the prefix and apply it
    ///
    /// Every entry is attempted. Failures are collected and returned together
    /// as [`Error::InitialLoad`]; the flags that did apply stay applied and
    /// the synchronizer counts as initialized.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: every entry applied (or was skipped as empty)
    /// - `Err(Error::InitialLoad)`: some entries failed
    /// - `Err(Error::AlreadyInitialized)`: called twice
    /// - `Err(Error::Store)`: the snapshot read failed; may be retried
    pub async fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::AlreadyInitialized);
        }

        let report = self.applier.load(false).await?;
        self.initialized = true;
        self.cursor.store(report.index, Ordering::SeqCst);

        info!(
            "flagsync: initialized {} flag(s) from {} at index={}",
            report.applied, self.applier.prefix, report.index
        );

        if report.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::InitialLoad {
                failures: report.failures,
            })
        }
    }

    /// Spawn the watch loop
    ///
    /// Returns immediately. If a previous loop was stopped, the new one waits
    /// for it to exit and resumes from its cursor.
    pub fn start(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if self.is_watching() {
            return Err(Error::AlreadyWatching);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Other("flagsync: start() requires a tokio runtime".to_string()))?;

        let cancel = CancellationToken::new();
        let watch_loop = WatchLoop::new(
            Arc::clone(&self.applier),
            self.watch_config.clone(),
            Arc::clone(&self.cursor),
            cancel.clone(),
        );
        let previous = self.task.take();

        let task = runtime.spawn(async move {
            if let Some(previous) = previous {
                // One loop at a time
                let _ = previous.await;
            }
            watch_loop.run().await;
        });

        self.cancel = Some(cancel);
        self.task = Some(task);
        Ok(())
    }

    /// Ask the watch loop to exit
    ///
    /// Does not wait for the exit; see [`Synchronizer::wait_stopped()`].
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_watching() {
            // The loop may have ended on its own; drop the stale token
            self.cancel = None;
            return Err(Error::NotWatching);
        }
        let cancel = self.cancel.take().ok_or(Error::NotWatching)?;
        info!("flagsync: stopping");
        cancel.cancel();
        Ok(())
    }

    /// Wait until the most recent loop task has exited
    ///
    /// Only returns after `stop()` (or after the store cancelled the watch).
    pub async fn wait_stopped(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Other(format!("flagsync: watch loop failed: {}", e)))?;
        }
        Ok(())
    }

    /// Whether a watch loop is running and has not been asked to stop
    pub fn is_watching(&self) -> bool {
        self.cancel.is_some() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Whether `initialize()` has completed its snapshot read
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Index the next watch resumes after
    pub fn last_index(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Normalized prefix being synchronized
    pub fn prefix(&self) -> &str {
        &self.applier.prefix
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!("flagsync: synchronizer dropped while watching, cancelling");
            cancel.cancel();
        }
    }
}

/// Outcome of one bulk load
#[derive(Debug)]
pub(crate) struct LoadReport {
    /// Snapshot index
    pub index: u64,
    /// Flags set
    pub applied: usize,
    /// Entries that failed
    pub failures: Vec<Error>,
}

/// Per-entry logic shared by the initial load, recovery and the watch loop
pub(crate) struct FlagApplier {
    pub registry: Arc<dyn FlagRegistry>,
    pub store: Arc<dyn KvStore>,
    /// Always ends with `/`
    pub prefix: String,
}

impl FlagApplier {
    /// Map a store key to the flag it represents
    ///
    /// Only direct, non-directory children of the prefix are flags.
    pub fn flag_name(&self, key: &str, dir: bool) -> Result<String> {
        if dir {
            return Err(Error::invalid_key(key, "is a directory entry"));
        }
        let name = key.strip_prefix(&self.prefix).ok_or_else(|| {
            Error::invalid_key(key, format!("doesn't start with prefix '{}'", self.prefix))
        })?;
        if name.is_empty() {
            return Err(Error::invalid_key(key, "has no flag name"));
        }
        if name.contains('/') {
            return Err(Error::invalid_key(
                key,
                format!("isn't a direct leaf of prefix '{}'", self.prefix),
            ));
        }
        Ok(name.to_string())
    }

    /// Apply `value` to the named flag
    ///
    /// # Returns
    ///
    /// - `Err(Error::NoValuePresent)`: nothing to apply
    /// - `Err(Error::FlagLookupFailed)`: no such flag
    /// - `Err(Error::FlagNotDynamic)`: `only_dynamic` and the flag is start-up only
    /// - `Err(Error::FlagRejected)`: the flag's parser or validator refused it
    pub fn set_flag(&self, name: &str, value: Option<&str>, only_dynamic: bool) -> Result<()> {
        let value = match value {
            Some(value) if !value.is_empty() => value,
            _ => return Err(Error::NoValuePresent(name.to_string())),
        };
        let flag = self
            .registry
            .lookup(name)
            .ok_or_else(|| Error::FlagLookupFailed(name.to_string()))?;
        if only_dynamic && !flag.is_dynamic() {
            return Err(Error::FlagNotDynamic(name.to_string()));
        }
        flag.set(value).map_err(|e| Error::rejected(name, e))
    }

    /// Read the whole prefix and apply every entry
    ///
    /// With `only_dynamic`, start-up only flags are left alone.
    pub async fn load(&self, only_dynamic: bool) -> Result<LoadReport> {
        let snapshot = self.store.get(&self.prefix, GetOptions::recursive()).await?;

        let mut report = LoadReport {
            index: snapshot.index,
            applied: 0,
            failures: Vec::new(),
        };

        for node in &snapshot.nodes {
            let name = match self.flag_name(&node.key, node.dir) {
                Ok(name) => name,
                Err(e) => {
                    info!("flagsync: ignoring: {}", e);
                    continue;
                }
            };

            match self.set_flag(&name, Some(&node.value), only_dynamic) {
                Ok(()) => {
                    debug!("flagsync: set flag={} from index={}", name, node.modified_index);
                    report.applied += 1;
                }
                Err(Error::NoValuePresent(_)) => {}
                Err(Error::FlagNotDynamic(_)) if only_dynamic => {}
                Err(e) => {
                    warn!("flagsync: {}", e);
                    report.failures.push(e);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FlagSet;
    use crate::store::MemoryKvStore;
    use crate::traits::SetOptions;

    fn applier(prefix: &str) -> FlagApplier {
        FlagApplier {
            registry: Arc::new(FlagSet::new()),
            store: Arc::new(MemoryKvStore::new()),
            prefix: crate::config::normalize_prefix(prefix),
        }
    }

    #[test]
    fn flag_names_are_direct_leaves() {
        let applier = applier("/config");

        assert_eq!(applier.flag_name("/config/a", false).unwrap(), "a");
        assert!(applier.flag_name("/config/sub", true).is_err());
        assert!(applier.flag_name("/config/sub/a", false).is_err());
        assert!(applier.flag_name("/other/a", false).is_err());
        assert!(applier.flag_name("/config/", false).is_err());
    }

    #[tokio::test]
    async fn dynamic_only_load_leaves_static_flags_alone() {
        let flags = Arc::new(FlagSet::new());
        let workers = flags.scalar("workers", 1u32, "").unwrap();
        let level = flags.scalar("level", "info".to_string(), "").unwrap();
        flags.mark_dynamic("level").unwrap();

        let store = Arc::new(MemoryKvStore::new());
        store.set("/config/workers", "8", SetOptions::default()).await.unwrap();
        store.set("/config/level", "debug", SetOptions::default()).await.unwrap();

        let applier = FlagApplier {
            registry: flags,
            store: store.clone(),
            prefix: "/config/".to_string(),
        };

        let report = applier.load(true).await.unwrap();
        assert_eq!(report.index, 2);
        assert_eq!(report.applied, 1);
        assert!(report.failures.is_empty());
        assert_eq!(workers.get(), 1);
        assert_eq!(level.get(), "debug");
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_rejected() {
        let mut sync = Synchronizer::new(
            Arc::new(FlagSet::new()),
            Arc::new(MemoryKvStore::new()),
            SyncConfig::new("/config"),
        )
        .unwrap();

        assert!(matches!(sync.start(), Err(Error::NotInitialized)));
        assert!(matches!(sync.stop(), Err(Error::NotWatching)));

        sync.initialize().await.unwrap();
        assert!(matches!(sync.initialize().await, Err(Error::AlreadyInitialized)));

        sync.start().unwrap();
        assert!(sync.is_watching());
        assert!(matches!(sync.start(), Err(Error::AlreadyWatching)));

        sync.stop().unwrap();
        assert!(matches!(sync.stop(), Err(Error::NotWatching)));
        sync.wait_stopped().await.unwrap();
        assert!(!sync.is_watching());
    }
}
