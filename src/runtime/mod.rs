//! Embedded runtime
//!
//! A compact stack-based interpreter core: values, a shared collected heap,
//! execution contexts with a stack API, a base library and the worker pool
//! that runs spawned contexts.

pub mod baselib;
pub mod context;
pub mod error;
pub mod gc;
pub mod scheduler;
pub mod table;
pub mod value;

pub use context::{
    upvalue_index, Context, Host, NativeFn, Runtime, RuntimeConfig, GLOBALS_INDEX, MULTRET,
    REGISTRY_INDEX,
};
pub use error::{ScriptError, ScriptResult};
pub use gc::{GcConfig, GcState, GcStats};
pub use value::{Key, ObjRef, Value, ValueType};

#[cfg(test)]
mod tests;
