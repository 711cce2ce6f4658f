// # flagsync-core
//
// Core library keeping a process's runtime flags synchronized with a
// distributed key-value store.
//
// ## Architecture Overview
//
// This library provides the core functionality for dynamic configuration:
// - **KvStore**: Trait for reading, watching and conditionally writing the store
// - **FlagRegistry**: Trait for looking up flags and applying string values
// - **Synchronizer**: Initial load, watch loop and rollback of rejected values
// - **DynamicValue**: Lock-free holder for one structured, runtime-mutable value
// - **FlagSet**: In-process flag registry
// - **MemoryKvStore**: In-memory store for embedding and tests
//
// ## Design Principles
//
// 1. **Self-Healing**: Store failures are classified and retried, never fatal
// 2. **Never Torn**: Values are published by whole-object atomic swap
// 3. **No Poisoned Store**: Values this process rejects are rolled back
// 4. **Per-Key Independence**: Each key is synchronized on its own
// 5. **Library-First**: All core functionality can be used as a library

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod store;
pub mod traits;
pub mod value;

// Re-export core types for convenience
pub use config::{SyncConfig, WatchConfig};
pub use engine::{RollbackOutcome, Synchronizer, WatchState};
pub use error::{Error, Result, StoreError};
pub use registry::FlagSet;
pub use store::MemoryKvStore;
pub use traits::{Flag, FlagRegistry, FlagValue, KvStore};
pub use value::{DynamicValue, ScalarValue, StructuredValue};
