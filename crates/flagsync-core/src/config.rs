//! Configuration types for the flagsync system
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Store directory whose direct leaves are flags (e.g., "/config/myapp")
    pub prefix: String,

    /// Optional watch loop settings
    #[serde(default)]
    pub watch: WatchConfig,
}

impl SyncConfig {
    /// Create a new configuration with default watch settings
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            watch: WatchConfig::default(),
        }
    }

    /// Replace the watch settings
    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.prefix.trim().is_empty() {
            return Err(crate::Error::config("Store prefix cannot be empty"));
        }

        self.watch.validate()?;

        Ok(())
    }

    /// The prefix with exactly one trailing separator
    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }
}

/// Append the key separator unless the prefix already ends with one
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// Watch loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Pause before re-reading everything after the store compacted our cursor away
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,

    /// Pause before retrying when no cluster member answered
    #[serde(default = "default_cluster_retry_delay_ms")]
    pub cluster_retry_delay_ms: u64,

    /// Base pause for unclassified store errors
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the random jitter added to `backoff_base_ms`
    ///
    /// Spreads out watchers that all lost the store at the same moment.
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

impl WatchConfig {
    /// Validate the watch settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.backoff_base_ms == 0 && self.backoff_jitter_ms == 0 {
            return Err(crate::Error::config(
                "Watch backoff must be > 0 (base or jitter)",
            ));
        }
        Ok(())
    }

    /// Pause before re-reading after the cursor was compacted
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    /// Pause after the cluster was unreachable
    pub fn cluster_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cluster_retry_delay_ms)
    }

    /// Fixed part of the generic backoff
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            recovery_delay_ms: default_recovery_delay_ms(),
            cluster_retry_delay_ms: default_cluster_retry_delay_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

fn default_recovery_delay_ms() -> u64 {
    200
}

fn default_cluster_retry_delay_ms() -> u64 {
    100
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_jitter_ms() -> u64 {
    500
}
