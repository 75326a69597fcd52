//! Runtime value type system for the embedded engine
//!
//! `Value` is the unified representation of everything a script can hold.
//! Scalars and strings are stored inline; tables, functions and threads live
//! in the collected heap and are referred to through [`ObjRef`], a relocatable
//! index that is checked against a generation counter on every access.
//! No host pointer is ever stored in a `Value`.

use std::fmt;
use std::sync::Arc;

/// Generation-checked reference to a heap object.
///
/// The heap may reuse a slot after its object is collected; the generation
/// changes when that happens, so a stale `ObjRef` can be detected instead of
/// silently aliasing a newer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjRef {
    /// Slot index inside the heap.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at allocation time.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "0x{:06x}:{}", self.index, self.generation)
    }
}

/// Value type enumeration for type queries
///
/// `None` is reported for stack positions that hold no value at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    None,
    Nil,
    Bool,
    Number,
    String,
    Table,
    Function,
    Thread,
}

impl ValueType {
    /// Script-facing type name.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::None => "no value",
            ValueType::Nil => "nil",
            ValueType::Bool => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Table => "table",
            ValueType::Function => "function",
            ValueType::Thread => "thread",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime value
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absence of a value
    #[default]
    Nil,

    /// Boolean
    Bool(bool),

    /// Integer number
    Integer(i64),

    /// Floating point number
    Number(f64),

    /// Immutable shared string
    String(Arc<str>),

    /// Table in the collected heap
    Table(ObjRef),

    /// Closure in the collected heap
    Function(ObjRef),

    /// Execution context (thread) in the collected heap
    Thread(ObjRef),
}

impl Value {
    /// Build a string value.
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    /// Get the type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Bool(_) => ValueType::Bool,
            Value::Integer(_) | Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Table(_) => ValueType::Table,
            Value::Function(_) => ValueType::Function,
            Value::Thread(_) => ValueType::Thread,
        }
    }

    /// Script-facing type name.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Only `nil` and `false` are falsy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Convert to an integer if the value is an integer, an integral float,
    /// or a string holding one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) => float_to_integer(*n),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(float_to_integer))
            }
            _ => None,
        }
    }

    /// Convert to a float if the value is numeric or a numeric string.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Borrow the string contents.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Heap reference held by this value, if any.
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Table(r) | Value::Function(r) | Value::Thread(r) => Some(*r),
            _ => None,
        }
    }

    /// Raw equality: no metamethods, numbers compare by value,
    /// heap objects by identity.
    pub fn raw_equals(
        &self,
        other: &Value,
    ) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                (*a as f64) == *b && float_to_integer(*b) == Some(*a)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.raw_equals(other)
    }
}

impl fmt::Display for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => f.write_str(s),
            Value::Table(r) => write!(f, "table: {}", r),
            Value::Function(r) => write!(f, "function: {}", r),
            Value::Thread(r) => write!(f, "thread: {}", r),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

/// Table key.
///
/// Floats with an exact integer value are normalised to `Integer` so that
/// `t[1]` and `t[1.0]` address the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Bool(bool),
    Integer(i64),
    Float(u64),
    String(Arc<str>),
    Table(ObjRef),
    Function(ObjRef),
    Thread(ObjRef),
}

impl Key {
    /// Build a key from a value. `nil` and NaN cannot be keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Nil => None,
            Value::Bool(b) => Some(Key::Bool(*b)),
            Value::Integer(i) => Some(Key::Integer(*i)),
            Value::Number(n) if n.is_nan() => None,
            Value::Number(n) => Some(match float_to_integer(*n) {
                Some(i) => Key::Integer(i),
                None => Key::Float(n.to_bits()),
            }),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Table(r) => Some(Key::Table(*r)),
            Value::Function(r) => Some(Key::Function(*r)),
            Value::Thread(r) => Some(Key::Thread(*r)),
        }
    }

    /// Convert back into a value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Bool(b) => Value::Bool(*b),
            Key::Integer(i) => Value::Integer(*i),
            Key::Float(bits) => Value::Number(f64::from_bits(*bits)),
            Key::String(s) => Value::String(s.clone()),
            Key::Table(r) => Value::Table(*r),
            Key::Function(r) => Value::Function(*r),
            Key::Thread(r) => Value::Thread(*r),
        }
    }

    /// Heap reference held by this key, if any.
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Key::Table(r) | Key::Function(r) | Key::Thread(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(Arc::from(s))
    }
}

fn float_to_integer(n: f64) -> Option<i64> {
    if n.is_finite() && n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}
