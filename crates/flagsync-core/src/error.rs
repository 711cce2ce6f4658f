//! Error types for the flag synchronization system
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for flagsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the flagsync system
#[derive(Error, Debug)]
pub enum Error {
    /// `initialize()` was called a second time
    #[error("flagsync: already initialized")]
    AlreadyInitialized,

    /// `start()` was called before `initialize()`
    #[error("flagsync: not initialized")]
    NotInitialized,

    /// `start()` was called while a watch loop is active
    #[error("flagsync: already watching")]
    AlreadyWatching,

    /// `stop()` was called without an active watch loop
    #[error("flagsync: not watching")]
    NotWatching,

    /// No flag with this name is registered
    #[error("flag={0} was not found")]
    FlagLookupFailed(String),

    /// The flag exists but may only be set at start-up
    #[error("flag={0} is not dynamic")]
    FlagNotDynamic(String),

    /// The store entry carried no value
    #[error("no value for flag={0}")]
    NoValuePresent(String),

    /// A store key that does not map to a flag
    #[error("key '{key}' {reason}")]
    InvalidKey {
        /// The offending key
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// Input could not be parsed into the flag's type
    #[error("parse error: {0}")]
    Parse(String),

    /// Parsed value was rejected by a validator
    #[error("validation error: {0}")]
    Validation(String),

    /// A flag failed to apply a new value
    #[error("flag={flag} rejected value: {source}")]
    FlagRejected {
        /// Flag name
        flag: String,
        /// Underlying parse or validation failure
        #[source]
        source: Box<Error>,
    },

    /// Aggregate of every per-entry failure during a bulk load
    #[error("flagsync: encountered {} errors while applying flags from store:\n  {}", .failures.len(), join_failures(.failures))]
    InitialLoad {
        /// Per-entry failures, in store order
        failures: Vec<Error>,
    },

    /// Key-value store errors
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Flag registration errors
    #[error("flag={0} is already registered")]
    DuplicateFlag(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

fn join_failures(failures: &[Error]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  ")
}

impl Error {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a value rejection with the flag it happened on
    pub fn rejected(flag: impl Into<String>, source: Error) -> Self {
        Self::FlagRejected {
            flag: flag.into(),
            source: Box::new(source),
        }
    }

    /// True for parse and validation failures, the errors that warrant a rollback
    pub fn is_rejection(&self) -> bool {
        match self {
            Error::Parse(_) | Error::Validation(_) => true,
            Error::FlagRejected { source, .. } => source.is_rejection(),
            _ => false,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Errors raised by a [`KvStore`](crate::traits::KvStore)
///
/// The watch loop classifies these to pick a recovery strategy, so
/// implementations must map their native failures onto the matching variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested history has been compacted past the watch cursor
    #[error("event index {requested} cleared, oldest retained is {oldest}")]
    Compacted {
        /// Index the watcher asked to resume after
        requested: u64,
        /// Oldest index still held in the store's history
        oldest: u64,
    },

    /// No cluster member could serve the request
    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),

    /// The request deadline passed
    #[error("deadline exceeded")]
    Timeout,

    /// The request was cancelled
    #[error("request cancelled")]
    Cancelled,

    /// A `prev_index` condition did not match
    #[error("compare failed on '{key}': expected index {expected}, found {actual}")]
    ConditionFailed {
        /// Key the condition was checked against
        key: String,
        /// Index the caller expected
        expected: u64,
        /// Index the store holds
        actual: u64,
    },

    /// The key does not exist
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Anything the store cannot classify further
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Create a generic store error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a cluster-unavailable error
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::ClusterUnavailable(msg.into())
    }
}
