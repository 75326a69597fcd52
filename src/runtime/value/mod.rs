//! Core value types for the embedded runtime
//!
//! This module provides the values scripts operate on and the keys
//! tables are indexed by.

pub mod runtime_value;
pub use runtime_value::*;
