//! Execution contexts and the stack API
//!
//! A [`Runtime`] owns one shared heap. Every [`Context`] is a view onto one
//! thread object in that heap: it has a private value stack but sees the same
//! globals, registry and tables as every other context of the runtime.
//!
//! Indices follow the usual stack-API conventions: `1..=top` address the
//! current frame from the bottom, `-1` is the top, and the pseudo-indices
//! [`REGISTRY_INDEX`], [`GLOBALS_INDEX`] and [`upvalue_index`] address the
//! registry table, the globals table and the running closure's upvalues.
//!
//! The engine lock is taken for each primitive operation and is never held
//! while a native function runs, so a native function may block its worker
//! without stalling other contexts.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{ScriptError, ScriptResult};
use super::gc::{Closure, Collection, Frame, GcConfig, GcState, GcStats, Heap, Object, ThreadState};
use super::table::Table;
use super::value::{Key, ObjRef, Value, ValueType};

/// Native function callable from scripts.
///
/// Arguments are at indices `1..=ctx.top()`. The function pushes its results
/// and returns how many there are, or returns `Err` to raise an error.
pub type NativeFn = fn(&Context) -> ScriptResult<usize>;

/// Accept every result a call produces.
pub const MULTRET: i32 = -1;

/// Pseudo-index of the registry table.
pub const REGISTRY_INDEX: i32 = -1_000_000;

/// Pseudo-index of the globals table.
pub const GLOBALS_INDEX: i32 = -1_000_001;

/// Pseudo-index of upvalue `n` (1-based) of the running closure.
#[inline]
pub const fn upvalue_index(n: i32) -> i32 {
    GLOBALS_INDEX - n
}

pub(crate) const LOADED_TABLE: &str = "_LOADED";
pub(crate) const PRELOAD_TABLE: &str = "_PRELOAD";

const MAX_META_CHAIN: usize = 100;

/// Engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of values on one context's stack
    pub max_stack_size: usize,
    /// Maximum nesting of calls on one context
    pub max_call_depth: usize,
    /// Collector settings
    pub gc: GcConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_stack_size: 1_000_000,
            max_call_depth: 200,
            gc: GcConfig::default(),
        }
    }
}

/// Hooks the embedding host receives from the collector.
///
/// Hooks run on whichever worker triggered the collection, after the engine
/// lock has been released.
pub trait Host: Send + Sync + 'static {
    /// A thread object was freed.
    fn thread_collected(
        &self,
        _thread: ObjRef,
    ) {
    }

    /// A closure created with [`Context::push_host_closure`] was freed.
    fn host_closure_collected(
        &self,
        _upvalues: &[Value],
    ) {
    }
}

struct Shared {
    heap: Mutex<Heap>,
    config: RuntimeConfig,
    host: OnceCell<Weak<dyn Host>>,
    host_any: OnceCell<Weak<dyn Any + Send + Sync>>,
}

/// One instance of the embedded interpreter.
pub struct Runtime {
    main: Context,
}

impl Runtime {
    /// Create a runtime and its main context.
    pub fn new(config: RuntimeConfig) -> Self {
        let heap = Heap::new(config.gc.clone());
        let main_thread = heap.main_thread();
        let shared = Arc::new(Shared {
            heap: Mutex::new(heap),
            config,
            host: OnceCell::new(),
            host_any: OnceCell::new(),
        });
        let main = Context {
            shared,
            thread: main_thread,
        };
        main.init_registry();
        Self { main }
    }

    /// The main context.
    #[inline]
    pub fn main(&self) -> &Context {
        &self.main
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.main.shared.config
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Runtime").field("main", &self.main).finish()
    }
}

/// Handle to one execution context of a runtime.
///
/// Cloning is cheap; clones address the same stack. A context must not be
/// used after its thread object has been collected: reads return nothing,
/// fallible operations return [`ScriptError::StaleReference`] and stack
/// mutations panic.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
    thread: ObjRef,
}

impl fmt::Debug for Context {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Context({})", self.thread)
    }
}

impl Context {
    fn init_registry(&self) {
        let mut heap = self.heap();
        let loaded = heap.alloc(Object::Table(Table::new()));
        let preload = heap.alloc(Object::Table(Table::new()));
        let (registry, globals) = (heap.registry(), heap.globals());
        if let Ok(table) = heap.table_mut(registry) {
            table.set(Key::from(LOADED_TABLE), Value::Table(loaded));
            table.set(Key::from(PRELOAD_TABLE), Value::Table(preload));
        }
        if let Ok(table) = heap.table_mut(globals) {
            table.set(Key::from("_G"), Value::Table(globals));
        }
    }

    #[inline]
    fn heap(&self) -> MutexGuard<'_, Heap> {
        self.shared.heap.lock()
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Heap reference of this context's thread object.
    #[inline]
    pub fn thread_ref(&self) -> ObjRef {
        self.thread
    }

    /// The main context of the runtime this context belongs to.
    pub fn main(&self) -> Context {
        let main_thread = self.heap().main_thread();
        Context {
            shared: self.shared.clone(),
            thread: main_thread,
        }
    }

    pub fn is_main(&self) -> bool {
        self.heap().main_thread() == self.thread
    }

    /// Check whether both contexts share one runtime.
    #[inline]
    pub fn same_runtime(
        &self,
        other: &Context,
    ) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Check whether the thread object still exists.
    pub fn is_alive(&self) -> bool {
        self.heap().is_live(self.thread)
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------
    // Host attachment
    // ------------------------------------------------------------------

    /// Attach the embedding host. Only the first attachment takes effect.
    ///
    /// The runtime keeps a weak reference; the host must be owned elsewhere.
    pub fn set_host<H: Host>(
        &self,
        host: &Arc<H>,
    ) -> bool {
        let as_host: Arc<dyn Host> = host.clone();
        let as_any: Arc<dyn Any + Send + Sync> = host.clone();
        let attached = self.shared.host.set(Arc::downgrade(&as_host)).is_ok();
        if attached {
            let _ = self.shared.host_any.set(Arc::downgrade(&as_any));
        }
        attached
    }

    /// The attached host, if it is of type `H` and still alive.
    pub fn host<H: Host>(&self) -> Option<Arc<H>> {
        self.shared
            .host_any
            .get()
            .and_then(Weak::upgrade)
            .and_then(|host| host.downcast::<H>().ok())
    }

    // ------------------------------------------------------------------
    // Basic stack manipulation
    // ------------------------------------------------------------------

    /// Number of values in the current frame.
    pub fn top(&self) -> usize {
        let heap = self.heap();
        heap.thread(self.thread)
            .map(|state| state.stack.len() - state.base())
            .unwrap_or(0)
    }

    /// Set the frame height. Non-negative values are absolute; negative
    /// values are relative to the top. Growing fills with `nil`.
    pub fn set_top(
        &self,
        idx: i32,
    ) {
        let mut heap = self.heap();
        let state = thread_mut(&mut heap, self.thread);
        let base = state.base();
        let len = state.stack.len();
        let new_len = if idx >= 0 {
            base + idx as usize
        } else {
            (len as i64 + idx as i64 + 1).max(base as i64) as usize
        };
        state.stack.resize(new_len, Value::Nil);
    }

    /// Pop `n` values; never pops below the current frame.
    pub fn pop(
        &self,
        n: usize,
    ) {
        let mut heap = self.heap();
        let state = thread_mut(&mut heap, self.thread);
        let keep = state.stack.len().saturating_sub(n).max(state.base());
        state.stack.truncate(keep);
    }

    /// Convert a relative index into an absolute one.
    pub fn abs_index(
        &self,
        idx: i32,
    ) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.top() as i32 + idx + 1
        }
    }

    /// Check that the stack can grow by `extra` values.
    pub fn check_stack(
        &self,
        extra: usize,
    ) -> bool {
        let heap = self.heap();
        heap.thread(self.thread)
            .map(|state| state.stack.len() + extra <= self.shared.config.max_stack_size)
            .unwrap_or(false)
    }

    /// Push a value.
    pub fn push(
        &self,
        value: impl Into<Value>,
    ) {
        let value = value.into();
        let mut heap = self.heap();
        thread_mut(&mut heap, self.thread).stack.push(value);
    }

    pub fn push_nil(&self) {
        self.push(Value::Nil);
    }

    pub fn push_bool(
        &self,
        b: bool,
    ) {
        self.push(Value::Bool(b));
    }

    pub fn push_integer(
        &self,
        i: i64,
    ) {
        self.push(Value::Integer(i));
    }

    pub fn push_number(
        &self,
        n: f64,
    ) {
        self.push(Value::Number(n));
    }

    pub fn push_string(
        &self,
        s: &str,
    ) {
        self.push(Value::from(s));
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(
        &self,
        idx: i32,
    ) {
        let mut heap = self.heap();
        let value = read(&heap, self.thread, idx).unwrap_or_default();
        thread_mut(&mut heap, self.thread).stack.push(value);
    }

    /// Move the top value into position `idx`, shifting values up.
    pub fn insert(
        &self,
        idx: i32,
    ) {
        let mut heap = self.heap();
        let state = thread_mut(&mut heap, self.thread);
        let pos = position_or_panic(state, idx);
        if let Some(value) = state.stack.pop() {
            state.stack.insert(pos, value);
        }
    }

    /// Remove the value at `idx`, shifting values down.
    pub fn remove(
        &self,
        idx: i32,
    ) {
        let mut heap = self.heap();
        let state = thread_mut(&mut heap, self.thread);
        let pos = position_or_panic(state, idx);
        state.stack.remove(pos);
    }

    /// Pop the top value into position `idx`.
    pub fn replace(
        &self,
        idx: i32,
    ) {
        let mut heap = self.heap();
        let state = thread_mut(&mut heap, self.thread);
        let pos = position_or_panic(state, idx);
        if let Some(value) = state.stack.pop() {
            if pos < state.stack.len() {
                state.stack[pos] = value;
            }
        }
    }

    // ------------------------------------------------------------------
    // Reading values
    // ------------------------------------------------------------------

    /// Type of the value at `idx`, `ValueType::None` for an empty slot.
    pub fn type_of(
        &self,
        idx: i32,
    ) -> ValueType {
        read(&self.heap(), self.thread, idx)
            .map(|value| value.value_type())
            .unwrap_or(ValueType::None)
    }

    /// Value at `idx`; `nil` for an empty slot.
    pub fn to_value(
        &self,
        idx: i32,
    ) -> Value {
        read(&self.heap(), self.thread, idx).unwrap_or_default()
    }

    #[inline]
    pub fn is_nil(
        &self,
        idx: i32,
    ) -> bool {
        self.type_of(idx) == ValueType::Nil
    }

    #[inline]
    pub fn is_none_or_nil(
        &self,
        idx: i32,
    ) -> bool {
        matches!(self.type_of(idx), ValueType::None | ValueType::Nil)
    }

    #[inline]
    pub fn is_function(
        &self,
        idx: i32,
    ) -> bool {
        self.type_of(idx) == ValueType::Function
    }

    #[inline]
    pub fn is_table(
        &self,
        idx: i32,
    ) -> bool {
        self.type_of(idx) == ValueType::Table
    }

    #[inline]
    pub fn is_string(
        &self,
        idx: i32,
    ) -> bool {
        self.type_of(idx) == ValueType::String
    }

    #[inline]
    pub fn is_number(
        &self,
        idx: i32,
    ) -> bool {
        self.type_of(idx) == ValueType::Number
    }

    pub fn to_boolean(
        &self,
        idx: i32,
    ) -> bool {
        self.to_value(idx).is_truthy()
    }

    pub fn to_integer(
        &self,
        idx: i32,
    ) -> Option<i64> {
        self.to_value(idx).as_integer()
    }

    pub fn to_number(
        &self,
        idx: i32,
    ) -> Option<f64> {
        self.to_value(idx).as_number()
    }

    /// String contents; numbers are converted.
    pub fn to_str(
        &self,
        idx: i32,
    ) -> Option<String> {
        match self.to_value(idx) {
            Value::String(s) => Some(s.to_string()),
            number @ (Value::Integer(_) | Value::Number(_)) => Some(number.to_string()),
            _ => None,
        }
    }

    /// String form of the value at `idx`, honouring `__tostring`.
    pub fn to_display_string(
        &self,
        idx: i32,
    ) -> ScriptResult<String> {
        {
            let mut heap = self.heap();
            let value = read(&heap, self.thread, idx).unwrap_or_default();
            let handler = metafield(&heap, &value, "__tostring")?;
            if !matches!(handler, Value::Function(_)) {
                return Ok(value.to_string());
            }
            let stack = &mut thread_mut(&mut heap, self.thread).stack;
            stack.push(handler);
            stack.push(value);
        }
        self.call(1, 1)?;
        let result = self.to_value(-1);
        self.pop(1);
        match result {
            Value::String(s) => Ok(s.to_string()),
            _ => Err(ScriptError::runtime("'__tostring' must return a string")),
        }
    }

    // ------------------------------------------------------------------
    // Tables and metatables
    // ------------------------------------------------------------------

    /// Push a new empty table.
    pub fn new_table(&self) {
        let mut heap = self.heap();
        let table = heap.alloc(Object::Table(Table::new()));
        thread_mut(&mut heap, self.thread).stack.push(Value::Table(table));
    }

    /// Push `t[key]` for the table at `idx`, honouring `__index`.
    pub fn get_field(
        &self,
        idx: i32,
        key: &str,
    ) -> ScriptResult<()> {
        let target = self.to_value(idx);
        self.push_index(target, Key::from(key))
    }

    /// Do `t[key] = v` for the table at `idx` and the value on top,
    /// honouring `__newindex`. Pops the value.
    pub fn set_field(
        &self,
        idx: i32,
        key: &str,
    ) -> ScriptResult<()> {
        let target = self.to_value(idx);
        let value = self.to_value(-1);
        // The value stays on the stack until the store is done so that it
        // remains reachable for the collector.
        let result = self.new_index(target, Key::from(key), value);
        self.pop(1);
        result
    }

    /// Push `t[key]` without metamethods.
    pub fn raw_get_field(
        &self,
        idx: i32,
        key: &str,
    ) -> ScriptResult<()> {
        let mut heap = self.heap();
        let target = read(&heap, self.thread, idx).unwrap_or_default();
        let Value::Table(table) = target else {
            return Err(ScriptError::NotIndexable(target.type_name()));
        };
        let value = heap.table(table)?.get_str(key);
        thread_mut(&mut heap, self.thread).stack.push(value);
        Ok(())
    }

    /// `t[key] = v` without metamethods. Pops the value.
    pub fn raw_set_field(
        &self,
        idx: i32,
        key: &str,
    ) -> ScriptResult<()> {
        let mut heap = self.heap();
        let target = read(&heap, self.thread, idx).unwrap_or_default();
        let value = read(&heap, self.thread, -1).unwrap_or_default();
        let Value::Table(table) = target else {
            return Err(ScriptError::NotIndexable(target.type_name()));
        };
        heap.table_mut(table)?.set(Key::from(key), value);
        thread_mut(&mut heap, self.thread).stack.pop();
        Ok(())
    }

    /// Push the global `name`.
    pub fn get_global(
        &self,
        name: &str,
    ) -> ScriptResult<()> {
        self.get_field(GLOBALS_INDEX, name)
    }

    /// Pop the top value into the global `name`.
    pub fn set_global(
        &self,
        name: &str,
    ) -> ScriptResult<()> {
        self.set_field(GLOBALS_INDEX, name)
    }

    /// Pop a table (or `nil`) and make it the metatable of the table at `idx`.
    pub fn set_metatable(
        &self,
        idx: i32,
    ) -> ScriptResult<()> {
        let mut heap = self.heap();
        let target = read(&heap, self.thread, idx).unwrap_or_default();
        let metatable = match read(&heap, self.thread, -1).unwrap_or_default() {
            Value::Table(mt) => Some(mt),
            Value::Nil => None,
            other => {
                return Err(ScriptError::runtime(format!(
                    "metatable must be a table or nil, got {}",
                    other.type_name()
                )))
            }
        };
        let Value::Table(table) = target else {
            return Err(ScriptError::runtime(format!(
                "cannot set the metatable of a {} value",
                target.type_name()
            )));
        };
        heap.table_mut(table)?.set_metatable(metatable);
        thread_mut(&mut heap, self.thread).stack.pop();
        Ok(())
    }

    /// Push the metatable of the value at `idx`; returns `false` and pushes
    /// nothing when there is none.
    pub fn get_metatable(
        &self,
        idx: i32,
    ) -> bool {
        let mut heap = self.heap();
        let Some(Value::Table(table)) = read(&heap, self.thread, idx) else {
            return false;
        };
        let Some(metatable) = heap.table(table).ok().and_then(Table::metatable) else {
            return false;
        };
        thread_mut(&mut heap, self.thread).stack.push(Value::Table(metatable));
        true
    }

    /// Push `target[key]`. Whatever is read from the heap is pushed under
    /// the same lock, and a function handler's result is left where the call
    /// put it, so the value is never held outside a stack.
    fn push_index(
        &self,
        target: Value,
        key: Key,
    ) -> ScriptResult<()> {
        let mut current = target;
        for _ in 0..MAX_META_CHAIN {
            let mut heap = self.heap();
            let Value::Table(table) = &current else {
                return Err(ScriptError::NotIndexable(current.type_name()));
            };
            let (raw, metatable) = {
                let t = heap.table(*table)?;
                (t.get(&key), t.metatable())
            };
            let handler = match (raw.is_nil(), metatable) {
                (true, Some(metatable)) => heap.table(metatable)?.get_str("__index"),
                _ => Value::Nil,
            };

            match handler {
                Value::Nil => {
                    thread_mut(&mut heap, self.thread).stack.push(raw);
                    return Ok(());
                }
                Value::Function(_) => {
                    let stack = &mut thread_mut(&mut heap, self.thread).stack;
                    stack.push(handler);
                    stack.push(current);
                    stack.push(key.to_value());
                    drop(heap);
                    return self.call(2, 1);
                }
                next => current = next,
            }
        }
        Err(ScriptError::runtime("'__index' chain too long; possible loop"))
    }

    fn new_index(
        &self,
        target: Value,
        key: Key,
        value: Value,
    ) -> ScriptResult<()> {
        let mut current = target;
        for _ in 0..MAX_META_CHAIN {
            let mut heap = self.heap();
            let Value::Table(table) = &current else {
                return Err(ScriptError::NotIndexable(current.type_name()));
            };
            let table = *table;
            let (existing, metatable) = {
                let t = heap.table(table)?;
                (t.get(&key), t.metatable())
            };
            let handler = match (existing.is_nil(), metatable) {
                (true, Some(metatable)) => heap.table(metatable)?.get_str("__newindex"),
                _ => Value::Nil,
            };

            match handler {
                Value::Nil => {
                    heap.table_mut(table)?.set(key, value);
                    return Ok(());
                }
                Value::Function(_) => {
                    let stack = &mut thread_mut(&mut heap, self.thread).stack;
                    stack.push(handler);
                    stack.push(current);
                    stack.push(key.to_value());
                    stack.push(value);
                    drop(heap);
                    return self.call(3, 0);
                }
                next => current = next,
            }
        }
        Err(ScriptError::runtime("'__newindex' chain too long; possible loop"))
    }

    // ------------------------------------------------------------------
    // Functions and calls
    // ------------------------------------------------------------------

    /// Pop `n` values and push a closure capturing them as upvalues.
    pub fn push_closure(
        &self,
        func: NativeFn,
        n: usize,
    ) {
        self.push_closure_inner(func, n, false);
    }

    /// Push a function without upvalues.
    pub fn push_function(
        &self,
        func: NativeFn,
    ) {
        self.push_closure_inner(func, 0, false);
    }

    /// Like [`Context::push_closure`], and report the upvalues to
    /// [`Host::host_closure_collected`] once the closure is freed.
    pub fn push_host_closure(
        &self,
        func: NativeFn,
        n: usize,
    ) {
        self.push_closure_inner(func, n, true);
    }

    fn push_closure_inner(
        &self,
        func: NativeFn,
        n: usize,
        host_owned: bool,
    ) {
        let mut heap = self.heap();
        let upvalues = {
            let state = thread_mut(&mut heap, self.thread);
            let available = state.stack.len() - state.base();
            assert!(
                n <= available,
                "closure needs {} upvalues but the frame holds {} values",
                n,
                available
            );
            let at = state.stack.len() - n;
            state.stack.split_off(at)
        };
        let closure = heap.alloc(Object::Closure(Closure {
            func,
            upvalues,
            host_owned,
        }));
        thread_mut(&mut heap, self.thread)
            .stack
            .push(Value::Function(closure));
    }

    /// Call the function below the top `nargs` values.
    ///
    /// On success the function and arguments are replaced by the results,
    /// adjusted to `nresults` unless it is [`MULTRET`]. On error the stack is
    /// unwound to where the function was and the error is returned.
    pub fn call(
        &self,
        nargs: usize,
        nresults: i32,
    ) -> ScriptResult<()> {
        self.collect_if_due();
        let (func, func_pos) = self.enter(nargs)?;
        let outcome = func(self);
        self.leave(func_pos, nresults, outcome)
    }

    fn enter(
        &self,
        nargs: usize,
    ) -> ScriptResult<(NativeFn, usize)> {
        let max_depth = self.shared.config.max_call_depth;
        let mut heap = self.heap();
        let (callee, func_pos) = {
            let state = heap.thread_mut(self.thread)?;
            let available = state.stack.len() - state.base();
            if available < nargs + 1 {
                return Err(ScriptError::runtime(format!(
                    "call expects a function and {} arguments on the stack",
                    nargs
                )));
            }
            let func_pos = state.stack.len() - nargs - 1;
            if state.frames.len() >= max_depth {
                state.stack.truncate(func_pos);
                return Err(ScriptError::StackOverflow);
            }
            (state.stack[func_pos].clone(), func_pos)
        };

        let Value::Function(callee_ref) = &callee else {
            heap.thread_mut(self.thread)?.stack.truncate(func_pos);
            return Err(ScriptError::NotCallable(callee.type_name()));
        };
        let callee_ref = *callee_ref;
        let func = heap.closure(callee_ref)?.func;
        heap.thread_mut(self.thread)?.frames.push(Frame {
            base: func_pos + 1,
            func: callee_ref,
        });
        Ok((func, func_pos))
    }

    fn leave(
        &self,
        func_pos: usize,
        nresults: i32,
        outcome: ScriptResult<usize>,
    ) -> ScriptResult<()> {
        let mut heap = self.heap();
        let state = heap.thread_mut(self.thread)?;
        state.frames.pop();
        match outcome {
            Ok(returned) => {
                let available = state.stack.len().saturating_sub(func_pos + 1);
                let count = returned.min(available);
                let results = state.stack.split_off(state.stack.len() - count);
                state.stack.truncate(func_pos);
                state.stack.extend(results);
                if nresults >= 0 {
                    state.stack.resize(func_pos + nresults as usize, Value::Nil);
                }
                Ok(())
            }
            Err(err) => {
                state.stack.truncate(func_pos);
                Err(err)
            }
        }
    }

    /// Pop the top value and turn it into an error to be returned from a
    /// native function.
    ///
    /// The value stays reachable from this context until
    /// [`Context::push_error`] takes it or another error replaces it.
    pub fn error(&self) -> ScriptError {
        let mut heap = self.heap();
        let state = thread_mut(&mut heap, self.thread);
        let value = if state.stack.len() > state.base() {
            state.stack.pop().unwrap_or_default()
        } else {
            Value::Nil
        };
        state.error = value.clone();
        ScriptError::Runtime(value)
    }

    /// Push the value a protected call reports for `err` and release the
    /// pending error value.
    pub fn push_error(
        &self,
        err: ScriptError,
    ) {
        let mut heap = self.heap();
        let state = thread_mut(&mut heap, self.thread);
        state.stack.push(err.into_value());
        state.error = Value::Nil;
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Push a new thread value and return its context. The new context
    /// shares globals with this one but has an empty stack of its own.
    pub fn new_thread(&self) -> Context {
        let mut heap = self.heap();
        let thread = heap.alloc(Object::Thread(ThreadState::default()));
        thread_mut(&mut heap, self.thread)
            .stack
            .push(Value::Thread(thread));
        Context {
            shared: self.shared.clone(),
            thread,
        }
    }

    /// Pop `n` values from this context and push them onto `to`.
    pub fn xmove(
        &self,
        to: &Context,
        n: usize,
    ) -> ScriptResult<()> {
        if !self.same_runtime(to) {
            return Err(ScriptError::RuntimeMismatch);
        }
        if n == 0 || self.thread == to.thread {
            return Ok(());
        }

        let mut heap = self.heap();
        heap.thread(to.thread)?;
        let values = {
            let from = heap.thread_mut(self.thread)?;
            let available = from.stack.len() - from.base();
            if available < n {
                return Err(ScriptError::runtime(format!(
                    "cannot move {} values, the frame holds {}",
                    n, available
                )));
            }
            let at = from.stack.len() - n;
            from.stack.split_off(at)
        };
        heap.thread_mut(to.thread)?.stack.extend(values);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    /// Pop a loader function and register it for `require(name)`.
    pub fn preload(
        &self,
        name: &str,
    ) -> ScriptResult<()> {
        let mut heap = self.heap();
        let loader = read(&heap, self.thread, -1).unwrap_or_default();
        if !matches!(loader, Value::Function(_)) {
            return Err(ScriptError::runtime(format!(
                "loader for module '{}' must be a function, got {}",
                name,
                loader.type_name()
            )));
        }
        let preload = registry_table(&heap, PRELOAD_TABLE)?;
        heap.table_mut(preload)?.set(Key::from(name), loader);
        thread_mut(&mut heap, self.thread).stack.pop();
        Ok(())
    }

    /// Push module `name`, running its loader on first use.
    pub fn require(
        &self,
        name: &str,
    ) -> ScriptResult<()> {
        {
            let mut heap = self.heap();
            let loaded = registry_table(&heap, LOADED_TABLE)?;
            let cached = heap.table(loaded)?.get_str(name);
            if !cached.is_nil() {
                thread_mut(&mut heap, self.thread).stack.push(cached);
                return Ok(());
            }
            let preload = registry_table(&heap, PRELOAD_TABLE)?;
            let loader = heap.table(preload)?.get_str(name);
            if loader.is_nil() {
                return Err(ScriptError::runtime(format!("module '{}' not found", name)));
            }
            let state = thread_mut(&mut heap, self.thread);
            state.stack.push(loader);
            state.stack.push(Value::from(name));
        }

        self.call(1, 1)?;
        if self.is_nil(-1) {
            self.pop(1);
            self.push_bool(true);
        }

        let mut heap = self.heap();
        let module = read(&heap, self.thread, -1).unwrap_or_default();
        let loaded = registry_table(&heap, LOADED_TABLE)?;
        heap.table_mut(loaded)?.set(Key::from(name), module);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Run a full collection cycle, then the finalizers it queued.
    pub fn collect_garbage(&self) -> GcStats {
        let collection = self.heap().collect(&[self.thread]);
        self.finish_collection(collection);
        self.heap().stats()
    }

    /// Collector statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.heap().stats()
    }

    /// Current collector phase.
    pub fn gc_state(&self) -> GcState {
        self.heap().state()
    }

    /// Number of heap objects currently allocated.
    pub fn live_objects(&self) -> usize {
        self.heap().live_objects()
    }

    fn collect_if_due(&self) {
        let collection = {
            let mut heap = self.heap();
            if !heap.should_collect() {
                return;
            }
            heap.collect(&[self.thread])
        };
        self.finish_collection(collection);
    }

    fn finish_collection(
        &self,
        collection: Collection,
    ) {
        if let Some(host) = self.shared.host.get().and_then(Weak::upgrade) {
            for thread in &collection.threads {
                host.thread_collected(*thread);
            }
            for upvalues in &collection.host_closures {
                host.host_closure_collected(upvalues);
            }
        }

        if collection.finalizers.is_empty() {
            return;
        }

        self.heap().set_state(GcState::Finalizing);
        for (object, handler) in collection.finalizers {
            self.push(handler);
            self.push(Value::Table(object));
            if let Err(err) = self.call(1, 0) {
                warn!(object = %object, error = %err, "finalizer failed");
            }
            self.heap().finalizer_done(object);
        }
        self.heap().set_state(GcState::Idle);
    }
}

fn thread_mut(
    heap: &mut Heap,
    thread: ObjRef,
) -> &mut ThreadState {
    match heap.thread_mut(thread) {
        Ok(state) => state,
        Err(_) => panic!("context {} used after its thread was collected", thread),
    }
}

fn position(
    state: &ThreadState,
    idx: i32,
) -> Option<usize> {
    let base = state.base();
    let len = state.stack.len();
    if idx > 0 {
        let pos = base + idx as usize - 1;
        (pos < len).then_some(pos)
    } else if idx < 0 && idx > REGISTRY_INDEX {
        let offset = idx.unsigned_abs() as usize;
        (offset <= len - base).then(|| len - offset)
    } else {
        None
    }
}

fn position_or_panic(
    state: &ThreadState,
    idx: i32,
) -> usize {
    match position(state, idx) {
        Some(pos) => pos,
        None => panic!("invalid stack index {}", idx),
    }
}

fn read(
    heap: &Heap,
    thread: ObjRef,
    idx: i32,
) -> Option<Value> {
    match idx {
        REGISTRY_INDEX => Some(Value::Table(heap.registry())),
        GLOBALS_INDEX => Some(Value::Table(heap.globals())),
        i if i < GLOBALS_INDEX => {
            let n = (GLOBALS_INDEX - i) as usize;
            let frame = heap.thread(thread).ok()?.frames.last().copied()?;
            heap.closure(frame.func).ok()?.upvalues.get(n - 1).cloned()
        }
        _ => {
            let state = heap.thread(thread).ok()?;
            position(state, idx).map(|pos| state.stack[pos].clone())
        }
    }
}

fn metafield(
    heap: &Heap,
    value: &Value,
    event: &str,
) -> ScriptResult<Value> {
    let Value::Table(table) = value else {
        return Ok(Value::Nil);
    };
    match heap.table(*table)?.metatable() {
        Some(metatable) => Ok(heap.table(metatable)?.get_str(event)),
        None => Ok(Value::Nil),
    }
}

fn registry_table(
    heap: &Heap,
    name: &str,
) -> ScriptResult<ObjRef> {
    match heap.table(heap.registry())?.get_str(name) {
        Value::Table(table) => Ok(table),
        _ => Err(ScriptError::runtime(format!("registry table '{}' is missing", name))),
    }
}
