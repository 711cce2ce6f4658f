//! Core traits for the flagsync system
//!
//! This module defines the abstract interfaces the synchronizer works against.
//!
//! - [`KvStore`]: Read, watch and conditionally write the distributed store
//! - [`FlagRegistry`]: Look up flags and apply string values to them

pub mod flag_registry;
pub mod kv_store;

pub use flag_registry::{Flag, FlagRegistry, FlagValue};
pub use kv_store::{
    Action, ChangeEvent, DeleteOptions, GetOptions, KvStore, Node, SetOptions, Snapshot,
    WatchOptions, WatchStream,
};
