// # Scalar Value
//
// Flag value for plain types with a `FromStr`/`Display` string form
// (integers, booleans, durations in ms, strings).

use parking_lot::RwLock;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::traits::FlagValue;

/// A flag value parsed with `FromStr`
#[derive(Debug, Default)]
pub struct ScalarValue<T> {
    inner: RwLock<T>,
}

impl<T> ScalarValue<T>
where
    T: FromStr + Display + Clone + Send + Sync + 'static,
    T::Err: Display,
{
    /// Create a value holding `initial`
    pub fn new(initial: T) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.inner.read().clone()
    }
}

impl<T> FlagValue for ScalarValue<T>
where
    T: FromStr + Display + Clone + Send + Sync + 'static,
    T::Err: Display,
{
    fn set(&self, input: &str) -> Result<()> {
        let parsed = input
            .trim()
            .parse::<T>()
            .map_err(|e| Error::parse(format!("{:?}: {}", input, e)))?;
        *self.inner.write() = parsed;
        Ok(())
    }

    fn current(&self) -> String {
        self.inner.read().to_string()
    }

    fn type_name(&self) -> &'static str {
        // "i64", "bool", "alloc::string::String" -> "String"
        let full = std::any::type_name::<T>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let value = ScalarValue::new(5i64);
        value.set(" 42 ").unwrap();
        assert_eq!(value.get(), 42);
        assert_eq!(value.current(), "42");
        assert_eq!(value.type_name(), "i64");
    }

    #[test]
    fn rejects_unparseable_input() {
        let value = ScalarValue::new(true);
        let err = value.set("bogus").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert!(value.get());
    }
}
