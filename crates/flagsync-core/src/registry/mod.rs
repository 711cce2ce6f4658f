//! In-process flag registry
//!
//! `FlagSet` maps flag names to registered [`Flag`]s and implements
//! [`FlagRegistry`] so a [`Synchronizer`](crate::Synchronizer) can write into it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flagsync_core::registry::FlagSet;
//! use flagsync_core::value::DynamicValue;
//!
//! let flags = FlagSet::new();
//!
//! // Start-up only: applied by the initial load, ignored by the watcher
//! let port = flags.scalar("port", 8080u16, "listen port")?;
//!
//! // Changeable at runtime
//! let limits = flags.dynamic("limits", DynamicValue::new(Limits::default()), "rate limits")?;
//! ```

use crate::error::{Error, Result};
use crate::traits::{Flag, FlagRegistry, FlagValue};
use crate::value::{DynamicValue, ScalarValue, StructuredValue};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

/// Registry of named flags
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// lookups and exclusive registration.
#[derive(Default)]
pub struct FlagSet {
    flags: RwLock<BTreeMap<String, Arc<Flag>>>,
}

impl FlagSet {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flag backed by an arbitrary value
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<Flag>)`: the registered (non-dynamic) flag
    /// - `Err(Error::DuplicateFlag)`: the name is taken
    pub fn register(
        &self,
        name: impl Into<String>,
        usage: impl Into<String>,
        value: Arc<dyn FlagValue>,
    ) -> Result<Arc<Flag>> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(Error::config(format!("invalid flag name: {:?}", name)));
        }

        let mut flags = self.flags.write();
        if flags.contains_key(&name) {
            return Err(Error::DuplicateFlag(name));
        }

        let flag = Arc::new(Flag::new(name.clone(), usage, value));
        flags.insert(name, Arc::clone(&flag));
        Ok(flag)
    }

    /// Register a start-up only scalar flag
    pub fn scalar<T>(
        &self,
        name: impl Into<String>,
        default: T,
        usage: impl Into<String>,
    ) -> Result<Arc<ScalarValue<T>>>
    where
        T: FromStr + Display + Clone + Send + Sync + 'static,
        T::Err: Display,
    {
        let value = Arc::new(ScalarValue::new(default));
        self.register(name, usage, value.clone())?;
        Ok(value)
    }

    /// Register a structured value and mark it dynamic
    pub fn dynamic<T: StructuredValue>(
        &self,
        name: impl Into<String>,
        value: DynamicValue<T>,
        usage: impl Into<String>,
    ) -> Result<Arc<DynamicValue<T>>> {
        let value = Arc::new(value);
        let flag = self.register(name, usage, value.clone())?;
        flag.set_dynamic(true);
        Ok(value)
    }

    /// Mark an already registered flag as dynamic
    pub fn mark_dynamic(&self, name: &str) -> Result<()> {
        let flag = self
            .lookup(name)
            .ok_or_else(|| Error::FlagLookupFailed(name.to_string()))?;
        flag.set_dynamic(true);
        Ok(())
    }

    /// List all registered flag names, sorted
    pub fn names(&self) -> Vec<String> {
        self.flags.read().keys().cloned().collect()
    }

    /// Check if a flag is registered
    pub fn contains(&self, name: &str) -> bool {
        self.flags.read().contains_key(name)
    }
}

impl FlagRegistry for FlagSet {
    fn lookup(&self, name: &str) -> Option<Arc<Flag>> {
        self.flags.read().get(name).cloned()
    }
}
