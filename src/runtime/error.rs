//! Script error channel
//!
//! Native functions raise errors by returning `Err(ScriptError)`; the engine
//! unwinds the callee's stack frame and hands the error to the caller, which
//! either propagates it with `?` or catches it (see `pcall`).

use thiserror::Error;

use super::value::Value;

/// Errors raised inside the embedded runtime.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    /// Error raised by script code with an arbitrary value
    #[error("{0}")]
    Runtime(Value),

    /// Attempt to call something that is not a function
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),

    /// Attempt to index something that is not a table
    #[error("attempt to index a {0} value")]
    NotIndexable(&'static str),

    /// Argument validation failure in a native function
    #[error("bad argument #{position} to '{function}' ({message})")]
    BadArgument {
        position: usize,
        function: String,
        message: String,
    },

    /// `nil` or NaN used as a table key
    #[error("table index is {0}")]
    InvalidKey(&'static str),

    /// Call depth limit reached
    #[error("stack overflow")]
    StackOverflow,

    /// A heap reference outlived the object it pointed to
    #[error("reference to a collected object")]
    StaleReference,

    /// Values moved between contexts of different runtimes
    #[error("cannot move values between different runtimes")]
    RuntimeMismatch,
}

/// Result alias for engine operations.
pub type ScriptResult<T> = Result<T, ScriptError>;

impl ScriptError {
    /// Raise a plain message.
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime(Value::from(message.into()))
    }

    /// Argument error for native function `function`.
    pub fn bad_argument(
        position: usize,
        function: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ScriptError::BadArgument {
            position,
            function: function.into(),
            message: message.into(),
        }
    }

    /// The value a protected call reports for this error.
    pub fn into_value(self) -> Value {
        match self {
            ScriptError::Runtime(value) => value,
            other => Value::from(other.to_string()),
        }
    }
}
