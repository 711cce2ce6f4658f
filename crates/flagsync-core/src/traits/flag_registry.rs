// # Flag Registry Trait
//
// Defines the boundary between the synchronizer and whatever holds the
// process's flags.
//
// The synchronizer only ever needs three things from a flag:
// - find it by name
// - hand it a new value as a string
// - ask whether it may change after start-up
//
// ## Implementations
//
// - `FlagSet` (this crate): a minimal in-process registry
// - CLI/flag-parsing libraries can implement `FlagRegistry` directly

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A value a flag can hold
///
/// Implementations parse the string form in `set` and must be safe to call
/// from any task.
pub trait FlagValue: Send + Sync {
    /// Parse `input` and make it the current value
    ///
    /// # Returns
    ///
    /// - `Ok(())`: value applied
    /// - `Err(Error::Parse)` or `Err(Error::Validation)`: value rejected,
    ///   the previous value is still in place
    fn set(&self, input: &str) -> Result<(), crate::Error>;

    /// Canonical string form of the current value
    fn current(&self) -> String;

    /// Short name of the value's type (e.g., "i64", "dyn_proto_json")
    fn type_name(&self) -> &'static str;
}

/// A named, registered flag
pub struct Flag {
    name: String,
    usage: String,
    value: Arc<dyn FlagValue>,
    dynamic: AtomicBool,
}

impl Flag {
    /// Create a new, non-dynamic flag
    pub fn new(name: impl Into<String>, usage: impl Into<String>, value: Arc<dyn FlagValue>) -> Self {
        Self {
            name: name.into(),
            usage: usage.into(),
            value,
            dynamic: AtomicBool::new(false),
        }
    }

    /// Registered name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Help text given at registration
    pub fn usage(&self) -> &str {
        &self.usage
    }

    /// Set the flag from its string form
    pub fn set(&self, input: &str) -> Result<(), crate::Error> {
        self.value.set(input)
    }

    /// Current value as a string
    pub fn value_string(&self) -> String {
        self.value.current()
    }

    /// Short name of the value's type
    pub fn type_name(&self) -> &'static str {
        self.value.type_name()
    }

    /// Whether the flag may be changed after start-up
    pub fn is_dynamic(&self) -> bool {
        self.dynamic.load(Ordering::Acquire)
    }

    /// Mark (or unmark) the flag as safe to change at runtime
    pub fn set_dynamic(&self, dynamic: bool) {
        self.dynamic.store(dynamic, Ordering::Release);
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flag")
            .field("name", &self.name)
            .field("type", &self.type_name())
            .field("value", &self.value_string())
            .field("dynamic", &self.is_dynamic())
            .finish()
    }
}

/// Trait for flag registries the synchronizer writes into
///
/// # Thread Safety
///
/// `lookup` is called from the watch loop task concurrently with the rest of
/// the process.
pub trait FlagRegistry: Send + Sync {
    /// Find a flag by name
    ///
    /// # Returns
    ///
    /// - `Some(Arc<Flag>)`: the registered flag
    /// - `None`: no such flag
    fn lookup(&self, name: &str) -> Option<Arc<Flag>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;

    #[test]
    fn dynamic_marker_is_settable() {
        let flag = Flag::new("port", "listen port", Arc::new(ScalarValue::new(8080u16)));
        assert!(!flag.is_dynamic());

        flag.set_dynamic(true);
        assert!(flag.is_dynamic());

        flag.set("9090").unwrap();
        assert_eq!(flag.value_string(), "9090");
    }
}
