// # Key-Value Store Implementations
//
// This module provides implementations of the KvStore trait that live
// entirely inside this crate. Network clients are provided by other crates.

pub mod memory;

pub use memory::MemoryKvStore;
