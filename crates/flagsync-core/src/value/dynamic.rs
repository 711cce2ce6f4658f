// # Dynamic Structured Value
//
// A flag value holding one structured (protobuf-shaped) document that can be
// replaced at runtime while other tasks read it.
//
// ## Publication
//
// Every `set` builds a brand-new instance and publishes it with a single
// `ArcSwap` store. Published instances are never mutated, so a reader holding
// an `Arc<T>` always sees one complete value.
//
// ## Wire Forms
//
// - JSON object text: input that, once trimmed, starts with `{` and ends with `}`
// - Protobuf binary: anything else
//
// Display output is always JSON.

use arc_swap::ArcSwap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::traits::FlagValue;

/// Marker emitted when the current value cannot be rendered
pub const DISPLAY_ERROR_MARKER: &str = "ERR";

/// Capabilities a type needs to live inside a [`DynamicValue`]
///
/// Implemented for every prost message that is also serde (de)serializable.
pub trait StructuredValue: Send + Sync + Sized + 'static {
    /// Parse the JSON object form
    fn from_text(input: &str) -> Result<Self>;

    /// Parse the protobuf binary form
    fn from_binary(input: &[u8]) -> Result<Self>;

    /// Compact JSON
    fn to_text(&self) -> Result<String>;

    /// Indented JSON
    fn to_text_pretty(&self) -> Result<String>;
}

impl<T> StructuredValue for T
where
    T: prost::Message + Default + Serialize + DeserializeOwned + 'static,
{
    fn from_text(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| Error::parse(format!("invalid JSON: {}", e)))
    }

    fn from_binary(input: &[u8]) -> Result<Self> {
        T::decode(input).map_err(|e| Error::parse(format!("invalid protobuf: {}", e)))
    }

    fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn to_text_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

type Validator<T> = Box<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;
type Notifier<T> = Arc<dyn Fn(Arc<T>, Arc<T>) + Send + Sync>;

/// Concurrency-safe holder for one runtime-mutable structured value
///
/// # Example
///
/// ```rust,ignore
/// let limits = DynamicValue::new(Limits::default())
///     .with_validator(|l: &Limits| {
///         anyhow::ensure!(l.rate > 0, "rate must be positive");
///         Ok(())
///     })
///     .with_notifier(|old, new| info!("limits changed: {:?} -> {:?}", old, new));
///
/// limits.set(r#"{"rate": 10}"#)?;
/// assert_eq!(limits.get().rate, 10);
/// ```
pub struct DynamicValue<T> {
    stored: ArcSwap<T>,
    validator: Option<Validator<T>>,
    notifier: Option<Notifier<T>>,
}

impl<T: StructuredValue> DynamicValue<T> {
    /// Create a value holding `initial`
    pub fn new(initial: T) -> Self {
        Self {
            stored: ArcSwap::from_pointee(initial),
            validator: None,
            notifier: None,
        }
    }

    /// Reject candidate values before they are published
    ///
    /// Validators run on the caller of `set`. Hooks are installed while the
    /// value is still exclusively owned, so they cannot change under an
    /// in-flight `set`.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Observe every successful `set` as `(previous, new)`
    ///
    /// Each notification runs on its own task; a slow or panicking notifier
    /// never blocks or fails `set`.
    pub fn with_notifier<F>(mut self, notifier: F) -> Self
    where
        F: Fn(Arc<T>, Arc<T>) + Send + Sync + 'static,
    {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Current value
    pub fn get(&self) -> Arc<T> {
        self.stored.load_full()
    }

    /// Parse `input`, validate it and publish it
    ///
    /// A `&str` can only carry protobuf encodings that happen to be valid
    /// UTF-8; use [`DynamicValue::set_bytes`] for arbitrary binary input.
    /// All-or-nothing: on any error the stored value is untouched.
    pub fn set(&self, input: &str) -> Result<()> {
        self.set_bytes(input.as_bytes())
    }

    /// Parse raw `input` (JSON object text or protobuf binary), validate it
    /// and publish it
    pub fn set_bytes(&self, input: &[u8]) -> Result<()> {
        let candidate = parse_input::<T>(input)?;

        if let Some(validator) = &self.validator {
            validator(&candidate).map_err(|e| Error::validation(e.to_string()))?;
        }

        let fresh = Arc::new(candidate);
        let previous = self.stored.swap(Arc::clone(&fresh));
        self.notify(previous, fresh);
        Ok(())
    }

    /// Indented JSON of the current value, or [`DISPLAY_ERROR_MARKER`]
    pub fn pretty_string(&self) -> String {
        self.get()
            .to_text_pretty()
            .unwrap_or_else(|_| DISPLAY_ERROR_MARKER.to_string())
    }

    fn notify(&self, previous: Arc<T>, fresh: Arc<T>) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result =
                        tokio::task::spawn_blocking(move || notifier(previous, fresh)).await;
                    if let Err(e) = result {
                        warn!("flagsync: value change notifier failed: {}", e);
                    }
                });
            }
            Err(_) => {
                // Outside a runtime (plain threads, start-up code)
                std::thread::spawn(move || {
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| notifier(previous, fresh)));
                    if result.is_err() {
                        warn!("flagsync: value change notifier panicked");
                    }
                });
            }
        }
    }
}

fn parse_input<T: StructuredValue>(input: &[u8]) -> Result<T> {
    let trimmed = input.trim_ascii();
    if trimmed.starts_with(b"{") && trimmed.ends_with(b"}") {
        let text = std::str::from_utf8(input)
            .map_err(|e| Error::parse(format!("invalid JSON: {}", e)))?;
        T::from_text(text)
    } else {
        T::from_binary(input)
    }
}

impl<T: StructuredValue> fmt::Display for DynamicValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get().to_text() {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str(DISPLAY_ERROR_MARKER),
        }
    }
}

impl<T: StructuredValue> fmt::Debug for DynamicValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicValue")
            .field("value", &self.to_string())
            .field("validator", &self.validator.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl<T: StructuredValue> FlagValue for DynamicValue<T> {
    fn set(&self, input: &str) -> Result<()> {
        DynamicValue::set(self, input)
    }

    fn current(&self) -> String {
        self.to_string()
    }

    fn type_name(&self) -> &'static str {
        "dyn_proto_json"
    }
}
