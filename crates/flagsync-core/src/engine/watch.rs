//! Watch loop
//!
//! A long-running task that waits for the next change after its cursor,
//! applies it to dynamic flags, and recovers from store failures by class:
//!
//! | Outcome                         | State            | Action                                  |
//! |---------------------------------|------------------|-----------------------------------------|
//! | change event                    | `Watching`       | apply, roll back on rejection           |
//! | `StoreError::Compacted`         | `Recovering`     | pause, re-read dynamic flags, reopen    |
//! | `StoreError::ClusterUnavailable`| `BackoffCluster` | short pause, wait again                 |
//! | `StoreError::Timeout`           | `Watching`       | wait again                              |
//! | `StoreError::Cancelled` / stop  | `Stopped`        | exit                                    |
//! | anything else, stream ended     | `BackoffGeneric` | base + jitter pause, reopen from cursor |

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::FlagApplier;
use crate::config::WatchConfig;
use crate::error::{Error, StoreError};
use crate::traits::{ChangeEvent, DeleteOptions, KvStore, SetOptions, WatchOptions, WatchStream};

/// States of the watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Waiting for the next change
    Watching,
    /// Cursor was compacted away; re-reading everything
    Recovering,
    /// No cluster member answered; short fixed pause
    BackoffCluster,
    /// Unclassified failure; jittered pause
    BackoffGeneric,
    /// Loop exits
    Stopped,
}

impl WatchState {
    /// State a failed wait moves the loop into
    pub fn after_error(err: &StoreError) -> Self {
        match err {
            StoreError::Compacted { .. } => WatchState::Recovering,
            StoreError::ClusterUnavailable(_) => WatchState::BackoffCluster,
            StoreError::Timeout => WatchState::Watching,
            StoreError::Cancelled => WatchState::Stopped,
            _ => WatchState::BackoffGeneric,
        }
    }
}

/// What a rollback achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The previous value was written back
    Restored,
    /// The newly created key was deleted
    Deleted,
    /// The key changed again before we got to it; nothing to do
    Conflict,
    /// The store refused for another reason; the bad value is still there
    Failed(StoreError),
}

/// Undo a change this process refused to apply
///
/// Conditioned on the change's own index, so a correction made by someone
/// else in the meantime is never overwritten.
pub(crate) async fn rollback(store: &dyn KvStore, event: &ChangeEvent) -> RollbackOutcome {
    let prev_index = Some(event.modified_index);

    let result = match &event.previous_value {
        Some(previous) => store
            .set(&event.key, previous, SetOptions { prev_index })
            .await
            .map(|_| RollbackOutcome::Restored),
        None => store
            .delete(&event.key, DeleteOptions { prev_index })
            .await
            .map(|_| RollbackOutcome::Deleted),
    };

    match result {
        Ok(outcome) => outcome,
        Err(StoreError::ConditionFailed { .. }) => RollbackOutcome::Conflict,
        Err(e) => RollbackOutcome::Failed(e),
    }
}

/// The loop itself; consumed by [`WatchLoop::run`]
pub(crate) struct WatchLoop {
    applier: Arc<FlagApplier>,
    config: WatchConfig,
    cursor: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl WatchLoop {
    pub fn new(
        applier: Arc<FlagApplier>,
        config: WatchConfig,
        cursor: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            applier,
            config,
            cursor,
            cancel,
        }
    }

    fn index(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    fn open(&self) -> WatchStream {
        self.applier
            .store
            .watch(&self.applier.prefix, WatchOptions::after(self.index()))
    }

    /// Run until cancelled
    pub async fn run(self) {
        info!("flagsync: watcher started at index={}", self.index());
        let mut stream = self.open();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };

            let state = match next {
                Some(Ok(event)) => {
                    self.handle_event(event).await;
                    WatchState::Watching
                }
                Some(Err(err)) => {
                    self.log_store_error(&err);
                    WatchState::after_error(&err)
                }
                None => {
                    warn!(
                        "flagsync: watch stream closed at index={}, reopening after backoff",
                        self.index()
                    );
                    WatchState::BackoffGeneric
                }
            };

            match state {
                WatchState::Watching => {}
                WatchState::Recovering => {
                    if !self.pause(self.config.recovery_delay()).await {
                        break;
                    }
                    self.recover().await;
                    stream = self.open();
                }
                WatchState::BackoffCluster => {
                    if !self.pause(self.config.cluster_retry_delay()).await {
                        break;
                    }
                }
                WatchState::BackoffGeneric => {
                    if !self.pause(self.generic_backoff()).await {
                        break;
                    }
                    stream = self.open();
                }
                WatchState::Stopped => break,
            }
        }

        info!("flagsync: watcher exited at index={}", self.index());
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let index = event.modified_index;
        self.cursor.fetch_max(index, Ordering::SeqCst);

        let name = match self.applier.flag_name(&event.key, event.dir) {
            Ok(name) => name,
            Err(e) => {
                debug!("flagsync: ignoring {} at index={}", e, index);
                return;
            }
        };

        match self.applier.set_flag(&name, event.value.as_deref(), true) {
            Ok(()) => {
                info!(
                    "flagsync: updated flag={} to value={:?} at index={}",
                    name,
                    event.value.as_deref().unwrap_or_default(),
                    index
                );
            }
            Err(Error::NoValuePresent(_)) => {
                debug!(
                    "flagsync: ignoring action={} on flag={} at index={}",
                    event.action, name, index
                );
            }
            Err(Error::FlagLookupFailed(_)) => {
                debug!("flagsync: ignoring unknown flag={} at index={}", name, index);
            }
            Err(e @ Error::FlagNotDynamic(_)) => {
                info!("flagsync: ignoring update at index={}, because of: {}", index, e);
            }
            Err(e) => {
                warn!(
                    "flagsync: failed updating flag={} at index={}, because of: {}",
                    name, index, e
                );
                self.rollback(&name, &event).await;
            }
        }
    }

    async fn rollback(&self, name: &str, event: &ChangeEvent) {
        match rollback(self.applier.store.as_ref(), event).await {
            RollbackOutcome::Restored => {
                info!("flagsync: rolled back flag={} to its previous value", name)
            }
            RollbackOutcome::Deleted => {
                info!("flagsync: rolled back flag={} by deleting it", name)
            }
            RollbackOutcome::Conflict => {
                info!("flagsync: rolled back flag={} was changed by someone else", name)
            }
            RollbackOutcome::Failed(e) => {
                warn!("flagsync: rolling back flag={} failed, left unresolved: {}", name, e)
            }
        }
    }

    async fn recover(&self) {
        match self.applier.load(true).await {
            Ok(report) => {
                self.cursor.store(report.index, Ordering::SeqCst);
                info!(
                    "flagsync: re-read {} dynamic flag(s), resuming at index={}",
                    report.applied, report.index
                );
            }
            Err(e) => {
                warn!(
                    "flagsync: re-reading flags failed, resuming at index={}: {}",
                    self.index(),
                    e
                );
            }
        }
    }

    fn log_store_error(&self, err: &StoreError) {
        let index = self.index();
        match err {
            StoreError::Compacted { .. } => {
                info!("flagsync: re-reading everything at index={}: {}", index, err)
            }
            StoreError::ClusterUnavailable(_) => {
                warn!("flagsync: cluster error at index={}, will retry: {}", index, err)
            }
            StoreError::Timeout => {
                debug!("flagsync: deadline exceeded while watching, continuing")
            }
            StoreError::Cancelled => info!("flagsync: watch cancelled by store"),
            _ => warn!(
                "flagsync: store error at index={}, restarting watch after backoff: {}",
                index, err
            ),
        }
    }

    fn generic_backoff(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.config.backoff_jitter_ms);
        self.config.backoff_base() + Duration::from_millis(jitter)
    }

    /// Sleep unless cancelled first; `false` means stop
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[test]
    fn errors_map_to_states() {
        let compacted = StoreError::Compacted {
            requested: 1,
            oldest: 10,
        };
        assert_eq!(WatchState::after_error(&compacted), WatchState::Recovering);
        assert_eq!(
            WatchState::after_error(&StoreError::cluster("no leader")),
            WatchState::BackoffCluster
        );
        assert_eq!(WatchState::after_error(&StoreError::Timeout), WatchState::Watching);
        assert_eq!(WatchState::after_error(&StoreError::Cancelled), WatchState::Stopped);
        assert_eq!(
            WatchState::after_error(&StoreError::other("boom")),
            WatchState::BackoffGeneric
        );
    }

    #[tokio::test]
    async fn rollback_restores_previous_value() {
        let store = MemoryKvStore::new();
        store.set("/config/a", "5", SetOptions::default()).await.unwrap();
        let index = store.set("/config/a", "bogus", SetOptions::default()).await.unwrap();

        let event = ChangeEvent::set("/config/a", "bogus", index, Some("5".to_string()));
        assert_eq!(rollback(&store, &event).await, RollbackOutcome::Restored);
        assert_eq!(store.value("/config/a"), Some("5".to_string()));
    }

    #[tokio::test]
    async fn rollback_deletes_new_key() {
        let store = MemoryKvStore::new();
        let index = store.set("/config/a", "bogus", SetOptions::default()).await.unwrap();

        let event = ChangeEvent::set("/config/a", "bogus", index, None);
        assert_eq!(rollback(&store, &event).await, RollbackOutcome::Deleted);
        assert_eq!(store.value("/config/a"), None);
    }

    #[tokio::test]
    async fn rollback_after_concurrent_fix_is_a_conflict() {
        let store = MemoryKvStore::new();
        store.set("/config/a", "5", SetOptions::default()).await.unwrap();
        let index = store.set("/config/a", "bogus", SetOptions::default()).await.unwrap();
        store.set("/config/a", "6", SetOptions::default()).await.unwrap();

        let event = ChangeEvent::set("/config/a", "bogus", index, Some("5".to_string()));
        assert_eq!(rollback(&store, &event).await, RollbackOutcome::Conflict);
        assert_eq!(store.value("/config/a"), Some("6".to_string()));
    }

    #[tokio::test]
    async fn rollback_of_vanished_key_fails() {
        let store = MemoryKvStore::new();
        let event = ChangeEvent::set("/config/a", "bogus", 3, None);
        assert!(matches!(
            rollback(&store, &event).await,
            RollbackOutcome::Failed(StoreError::KeyNotFound(_))
        ));
    }
}
