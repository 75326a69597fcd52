//! Garbage collector
//!
//! All contexts of one runtime share a single heap of tables, closures and
//! thread stacks. Collection is a stop-the-world mark and sweep performed
//! while the engine lock is held. Objects are addressed by generation-checked
//! slot indices, so freeing a slot can never leave a dangling pointer behind,
//! only a stale [`ObjRef`] that fails to resolve.
//!
//! Tables whose metatable carries a `__gc` function are resurrected for one
//! cycle and returned to the caller, which runs the finalizer with the lock
//! released. They stay rooted until [`Heap::finalizer_done`] is called.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::NativeFn;
use super::error::{ScriptError, ScriptResult};
use super::table::Table;
use super::value::{ObjRef, Value};

#[cfg(test)]
mod tests;

/// GC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run automatic cycles at call safe points
    pub enabled: bool,
    /// Allocations between automatic cycles
    pub collection_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_threshold: 4096,
        }
    }
}

/// GC state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Idle,
    Marking,
    Sweeping,
    Finalizing,
}

/// Collector statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Completed cycles
    pub cycles: u64,
    /// Objects alive after the last cycle
    pub live_objects: usize,
    /// Objects freed over the heap's lifetime
    pub collected: u64,
    /// Finalizers run over the heap's lifetime
    pub finalized: u64,
    /// Duration of the last cycle
    pub last_pause: Duration,
    /// Accumulated cycle duration
    pub total_pause: Duration,
}

/// Native closure: a function pointer plus the runtime values it captured.
pub(crate) struct Closure {
    pub(crate) func: NativeFn,
    pub(crate) upvalues: Vec<Value>,
    /// Report collection of this closure to the host
    pub(crate) host_owned: bool,
}

/// Active call on a thread's stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    /// Stack position of the first argument
    pub(crate) base: usize,
    pub(crate) func: ObjRef,
}

/// Private stack of one execution context.
#[derive(Default)]
pub(crate) struct ThreadState {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    /// Value of the error currently unwinding this thread
    pub(crate) error: Value,
}

impl ThreadState {
    /// Stack position index 1 refers to.
    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.base)
    }
}

pub(crate) enum Object {
    Table(Table),
    Closure(Closure),
    Thread(ThreadState),
}

struct Slot {
    generation: u32,
    marked: bool,
    finalized: bool,
    object: Option<Object>,
}

/// Work left over after a cycle, to be done without the engine lock.
#[derive(Default)]
pub(crate) struct Collection {
    /// Resurrected objects and their `__gc` handlers
    pub(crate) finalizers: Vec<(ObjRef, Value)>,
    /// Threads that were freed
    pub(crate) threads: Vec<ObjRef>,
    /// Upvalues of freed host-owned closures
    pub(crate) host_closures: Vec<Vec<Value>>,
}

/// The collected heap
pub(crate) struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    registry: ObjRef,
    globals: ObjRef,
    main_thread: ObjRef,
    pending_finalizers: Vec<ObjRef>,
    allocations: usize,
    config: GcConfig,
    state: GcState,
    stats: GcStats,
}

impl Heap {
    /// Create a heap holding the registry, the globals table and the main thread.
    pub(crate) fn new(config: GcConfig) -> Self {
        let placeholder = ObjRef {
            index: 0,
            generation: 0,
        };
        let mut heap = Self {
            slots: Vec::new(),
            free: Vec::new(),
            registry: placeholder,
            globals: placeholder,
            main_thread: placeholder,
            pending_finalizers: Vec::new(),
            allocations: 0,
            config,
            state: GcState::Idle,
            stats: GcStats::default(),
        };
        heap.registry = heap.alloc(Object::Table(Table::new()));
        heap.globals = heap.alloc(Object::Table(Table::new()));
        heap.main_thread = heap.alloc(Object::Thread(ThreadState::default()));
        heap
    }

    pub(crate) fn alloc(
        &mut self,
        object: Object,
    ) -> ObjRef {
        self.allocations += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.marked = false;
            slot.finalized = false;
            ObjRef {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("heap slot space exhausted");
            self.slots.push(Slot {
                generation: 0,
                marked: false,
                finalized: false,
                object: Some(object),
            });
            ObjRef {
                index,
                generation: 0,
            }
        }
    }

    pub(crate) fn object(
        &self,
        r: ObjRef,
    ) -> ScriptResult<&Object> {
        self.slots
            .get(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_ref())
            .ok_or(ScriptError::StaleReference)
    }

    pub(crate) fn object_mut(
        &mut self,
        r: ObjRef,
    ) -> ScriptResult<&mut Object> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.object.as_mut())
            .ok_or(ScriptError::StaleReference)
    }

    pub(crate) fn table(
        &self,
        r: ObjRef,
    ) -> ScriptResult<&Table> {
        match self.object(r)? {
            Object::Table(table) => Ok(table),
            _ => Err(ScriptError::StaleReference),
        }
    }

    pub(crate) fn table_mut(
        &mut self,
        r: ObjRef,
    ) -> ScriptResult<&mut Table> {
        match self.object_mut(r)? {
            Object::Table(table) => Ok(table),
            _ => Err(ScriptError::StaleReference),
        }
    }

    pub(crate) fn closure(
        &self,
        r: ObjRef,
    ) -> ScriptResult<&Closure> {
        match self.object(r)? {
            Object::Closure(closure) => Ok(closure),
            _ => Err(ScriptError::StaleReference),
        }
    }

    pub(crate) fn thread(
        &self,
        r: ObjRef,
    ) -> ScriptResult<&ThreadState> {
        match self.object(r)? {
            Object::Thread(thread) => Ok(thread),
            _ => Err(ScriptError::StaleReference),
        }
    }

    pub(crate) fn thread_mut(
        &mut self,
        r: ObjRef,
    ) -> ScriptResult<&mut ThreadState> {
        match self.object_mut(r)? {
            Object::Thread(thread) => Ok(thread),
            _ => Err(ScriptError::StaleReference),
        }
    }

    #[inline]
    pub(crate) fn is_live(
        &self,
        r: ObjRef,
    ) -> bool {
        self.object(r).is_ok()
    }

    #[inline]
    pub(crate) fn registry(&self) -> ObjRef {
        self.registry
    }

    #[inline]
    pub(crate) fn globals(&self) -> ObjRef {
        self.globals
    }

    #[inline]
    pub(crate) fn main_thread(&self) -> ObjRef {
        self.main_thread
    }

    #[inline]
    pub(crate) fn state(&self) -> GcState {
        self.state
    }

    #[inline]
    pub(crate) fn set_state(
        &mut self,
        state: GcState,
    ) {
        self.state = state;
    }

    #[inline]
    pub(crate) fn stats(&self) -> GcStats {
        self.stats
    }

    /// Number of objects currently allocated.
    #[inline]
    pub(crate) fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Check if an automatic cycle is due.
    pub(crate) fn should_collect(&self) -> bool {
        self.config.enabled
            && self.state == GcState::Idle
            && self.allocations >= self.config.collection_threshold
    }

    /// Run a full cycle. `extra_roots` survive regardless of reachability.
    pub(crate) fn collect(
        &mut self,
        extra_roots: &[ObjRef],
    ) -> Collection {
        let started = Instant::now();
        self.state = GcState::Marking;

        let mut gray = Vec::new();
        self.mark_roots(extra_roots, &mut gray);
        self.propagate(&mut gray);

        let mut collection = Collection::default();
        self.separate_finalizable(&mut collection, &mut gray);
        self.propagate(&mut gray);

        self.state = GcState::Sweeping;
        let freed = self.sweep(&mut collection);

        self.allocations = 0;
        self.state = GcState::Idle;

        let pause = started.elapsed();
        self.stats.cycles += 1;
        self.stats.collected += freed as u64;
        self.stats.live_objects = self.live_objects();
        self.stats.last_pause = pause;
        self.stats.total_pause += pause;

        debug!(
            freed,
            live = self.stats.live_objects,
            finalizers = collection.finalizers.len(),
            "gc cycle finished"
        );
        collection
    }

    /// Release the root held for a resurrected object.
    pub(crate) fn finalizer_done(
        &mut self,
        r: ObjRef,
    ) {
        self.pending_finalizers.retain(|pending| *pending != r);
        self.stats.finalized += 1;
    }

    fn mark_roots(
        &mut self,
        extra_roots: &[ObjRef],
        gray: &mut Vec<ObjRef>,
    ) {
        let mut roots = vec![self.registry, self.globals, self.main_thread];
        roots.extend(self.pending_finalizers.iter().copied());
        roots.extend(extra_roots.iter().copied());

        // A thread with an active frame is running somewhere and must survive
        // even if script code dropped every reference to it.
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(Object::Thread(thread)) = &slot.object {
                if !thread.frames.is_empty() {
                    roots.push(ObjRef {
                        index: index as u32,
                        generation: slot.generation,
                    });
                }
            }
        }

        for root in roots {
            self.mark(root, gray);
        }
    }

    fn mark(
        &mut self,
        r: ObjRef,
        gray: &mut Vec<ObjRef>,
    ) {
        if let Some(slot) = self.slots.get_mut(r.index as usize) {
            if slot.generation == r.generation && slot.object.is_some() && !slot.marked {
                slot.marked = true;
                gray.push(r);
            }
        }
    }

    fn propagate(
        &mut self,
        gray: &mut Vec<ObjRef>,
    ) {
        let mut children = Vec::new();
        while let Some(r) = gray.pop() {
            if let Some(object) = self
                .slots
                .get(r.index as usize)
                .and_then(|slot| slot.object.as_ref())
            {
                match object {
                    Object::Table(table) => {
                        children.extend(table.metatable());
                        for (key, value) in table.iter() {
                            children.extend(key.as_object());
                            children.extend(value.as_object());
                        }
                    }
                    Object::Closure(closure) => {
                        children.extend(closure.upvalues.iter().filter_map(Value::as_object));
                    }
                    Object::Thread(thread) => {
                        children.extend(thread.stack.iter().filter_map(Value::as_object));
                        children.extend(thread.frames.iter().map(|frame| frame.func));
                        children.extend(thread.error.as_object());
                    }
                }
            }
            for child in children.drain(..) {
                self.mark(child, gray);
            }
        }
    }

    fn separate_finalizable(
        &mut self,
        collection: &mut Collection,
        gray: &mut Vec<ObjRef>,
    ) {
        let mut found = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.marked || slot.finalized {
                continue;
            }
            let Some(Object::Table(table)) = &slot.object else {
                continue;
            };
            let Some(metatable) = table.metatable() else {
                continue;
            };
            if let Ok(meta) = self.table(metatable) {
                let handler = meta.get_str("__gc");
                if matches!(handler, Value::Function(_)) {
                    let r = ObjRef {
                        index: index as u32,
                        generation: slot.generation,
                    };
                    found.push((r, handler));
                }
            }
        }

        for (r, handler) in found {
            self.slots[r.index as usize].finalized = true;
            self.mark(r, gray);
            if let Some(handler_ref) = handler.as_object() {
                self.mark(handler_ref, gray);
            }
            self.pending_finalizers.push(r);
            collection.finalizers.push((r, handler));
        }
    }

    fn sweep(
        &mut self,
        collection: &mut Collection,
    ) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
                continue;
            }

            let r = ObjRef {
                index: index as u32,
                generation: slot.generation,
            };
            match slot.object.take() {
                Some(Object::Thread(_)) => collection.threads.push(r),
                Some(Object::Closure(closure)) if closure.host_owned => {
                    collection.host_closures.push(closure.upvalues)
                }
                _ => {}
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.finalized = false;
            self.free.push(index as u32);
            freed += 1;
        }
        freed
    }
}
