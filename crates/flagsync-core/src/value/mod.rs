// # Flag Value Implementations
//
// This module provides implementations of the FlagValue trait for
// different kinds of values.

pub mod dynamic;
pub mod scalar;

pub use dynamic::{DISPLAY_ERROR_MARKER, DynamicValue, StructuredValue};
pub use scalar::ScalarValue;
