//! Hash tables stored in the collected heap

use std::collections::HashMap;

use super::value::{Key, ObjRef, Value};

/// Script table
#[derive(Debug, Default)]
pub struct Table {
    entries: HashMap<Key, Value>,
    metatable: Option<ObjRef>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw lookup; missing keys read as `nil`.
    pub fn get(
        &self,
        key: &Key,
    ) -> Value {
        self.entries.get(key).cloned().unwrap_or(Value::Nil)
    }

    /// Raw lookup by string key.
    pub fn get_str(
        &self,
        key: &str,
    ) -> Value {
        self.get(&Key::from(key))
    }

    /// Raw store; assigning `nil` removes the entry.
    pub fn set(
        &mut self,
        key: Key,
        value: Value,
    ) {
        if value.is_nil() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// Number of non-nil entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn metatable(&self) -> Option<ObjRef> {
        self.metatable
    }

    #[inline]
    pub fn set_metatable(
        &mut self,
        metatable: Option<ObjRef>,
    ) {
        self.metatable = metatable;
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }
}
