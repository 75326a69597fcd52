//! Handle registry: maps integer handles to host-owned values.
//!
//! Handles are monotonically increasing `u64` values starting from 1 and are
//! never reused, even after removal. Handle 0 is never issued.
//!
//! All operations run under one internal lock, so concurrent callers observe
//! a single linear history. Values are cloned out of the table before the lock
//! is released; callers never run code while holding it.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;

use parking_lot::Mutex;
use thiserror::Error;

use crate::runtime::Value;

/// Opaque registry handle; the only host reference that enters script space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Script representation: a plain integer.
    #[inline]
    pub fn to_value(self) -> Value {
        Value::Integer(self.0.get() as i64)
    }

    /// Parse a handle back out of a script value.
    pub fn from_value(value: &Value) -> Option<Handle> {
        match value {
            Value::Integer(raw) if *raw > 0 => NonZeroU64::new(*raw as u64).map(Handle),
            _ => None,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<NonZeroU64> for Handle {
    fn from(raw: NonZeroU64) -> Self {
        Handle(raw)
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    #[error("handle counter overflow")]
    Exhausted,
}

struct Inner<T> {
    next_handle: u64,
    table: HashMap<Handle, T>,
}

/// Thread-safe handle table.
pub struct HandleRegistry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandleRegistry<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("HandleRegistry")
            .field("next_handle", &inner.next_handle)
            .field("live", &inner.table.len())
            .finish()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_handle: 1,
                table: HashMap::new(),
            }),
        }
    }

    /// Store `value` under a fresh handle.
    pub fn add(
        &self,
        value: T,
    ) -> Result<Handle, RegistryError> {
        let mut inner = self.inner.lock();
        let raw = NonZeroU64::new(inner.next_handle).ok_or(RegistryError::Exhausted)?;
        inner.next_handle = inner
            .next_handle
            .checked_add(1)
            .ok_or(RegistryError::Exhausted)?;
        let handle = Handle(raw);
        inner.table.insert(handle, value);
        Ok(handle)
    }

    /// Remove a handle and return the value it held.
    pub fn remove(
        &self,
        handle: Handle,
    ) -> Result<T, RegistryError> {
        self.inner
            .lock()
            .table
            .remove(&handle)
            .ok_or(RegistryError::InvalidHandle(handle.get()))
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(
        &self,
        handle: Handle,
    ) -> bool {
        self.inner.lock().table.contains_key(&handle)
    }
}

impl<T: Clone> HandleRegistry<T> {
    /// Clone the value stored under `handle`; the handle stays valid.
    pub fn get(
        &self,
        handle: Handle,
    ) -> Result<T, RegistryError> {
        self.inner
            .lock()
            .table
            .get(&handle)
            .cloned()
            .ok_or(RegistryError::InvalidHandle(handle.get()))
    }

    /// Look up a raw integer, as read back from script space.
    pub fn get_raw(
        &self,
        raw: u64,
    ) -> Result<T, RegistryError> {
        let handle = NonZeroU64::new(raw)
            .map(Handle)
            .ok_or(RegistryError::InvalidHandle(raw))?;
        self.get(handle)
    }
}
