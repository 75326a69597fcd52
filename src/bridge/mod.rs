//! Callback bridge
//!
//! Native functions in the embedded runtime are plain `fn` pointers and can
//! only capture runtime values. To expose a Rust closure, the bridge stores the
//! closure and the installing context in the [`HandleRegistry`] and pushes a
//! runtime closure whose two upvalues are the integer handles. When the
//! runtime calls it, the [`trampoline`] redeems both handles and dispatches.
//! No host pointer ever enters the runtime's value space.
//!
//! The bridge is also the runtime's [`Host`]: the collector reports freed
//! threads and freed bridge closures here, which is when the corresponding
//! registry entries are released.

pub mod registry;

pub use registry::{Handle, HandleRegistry, RegistryError};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::runtime::scheduler::{Scheduler, SchedulerConfig, SchedulerError, Task};
use crate::runtime::{upvalue_index, Context, Host, ObjRef, ScriptError, ScriptResult, Value};
use crate::std::mutex::ScriptMutex;
use crate::std::thread::ScriptThread;
use crate::std::wait_group::ScriptWaitGroup;


/// Host function reachable from scripts through the bridge.
///
/// Same calling convention as a native function: arguments at `1..=top`,
/// push results and return their count, or return `Err` to raise.
pub type HostFunction = Arc<dyn Fn(&Context) -> ScriptResult<usize> + Send + Sync>;

/// Values the registry can hold.
#[derive(Clone)]
pub enum HostValue {
    Context(Context),
    Function(HostFunction),
    Mutex(Arc<ScriptMutex>),
    WaitGroup(Arc<ScriptWaitGroup>),
    Thread(Arc<ScriptThread>),
}

impl HostValue {
    /// Kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Context(_) => "context",
            HostValue::Function(_) => "function",
            HostValue::Mutex(_) => "mutex",
            HostValue::WaitGroup(_) => "wait group",
            HostValue::Thread(_) => "thread",
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            HostValue::Context(ctx) => write!(f, "HostValue::Context({:?})", ctx),
            other => write!(f, "HostValue::{}", other.kind()),
        }
    }
}

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("bridge closure has no handle in upvalue {0}")]
    MissingHandle(i32),

    #[error("handle {handle} holds a {found}, expected a {expected}")]
    WrongKind {
        handle: Handle,
        expected: &'static str,
        found: &'static str,
    },

    #[error("callback was installed on a different runtime")]
    RuntimeMismatch,

    #[error("stack cannot grow by {0} values")]
    StackExhausted(usize),

    #[error("no bridge is attached to this runtime")]
    NotAttached,

    #[error("runtime is already attached to another bridge")]
    AlreadyAttached,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<BridgeError> for ScriptError {
    fn from(err: BridgeError) -> Self {
        ScriptError::runtime(err.to_string())
    }
}

struct ContextEntry {
    /// Live bridge closures installed through this context
    closures: usize,
    /// The thread object has been freed
    collected: bool,
}

#[derive(Default)]
struct ContextTable {
    by_thread: HashMap<ObjRef, Handle>,
    entries: HashMap<Handle, ContextEntry>,
}

/// Registry, global serialization lock and worker pool of one runtime.
pub struct Bridge {
    registry: HandleRegistry<HostValue>,
    global_lock: Mutex<()>,
    scheduler: Scheduler,
    contexts: Mutex<ContextTable>,
}

impl fmt::Debug for Bridge {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Bridge {
    /// Create a bridge and start its worker pool.
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>, BridgeError> {
        Ok(Arc::new(Self {
            registry: HandleRegistry::new(),
            global_lock: Mutex::new(()),
            scheduler: Scheduler::new(config)?,
            contexts: Mutex::new(ContextTable::default()),
        }))
    }

    /// Attach this bridge to `ctx`'s runtime as its host.
    pub fn attach(
        self: &Arc<Self>,
        ctx: &Context,
    ) -> Result<(), BridgeError> {
        if ctx.set_host(self) {
            debug!("bridge attached");
            return Ok(());
        }
        match ctx.host::<Bridge>() {
            Some(existing) if Arc::ptr_eq(&existing, self) => Ok(()),
            _ => Err(BridgeError::AlreadyAttached),
        }
    }

    /// The bridge attached to `ctx`'s runtime.
    pub fn of(ctx: &Context) -> Result<Arc<Bridge>, BridgeError> {
        ctx.host::<Bridge>().ok_or(BridgeError::NotAttached)
    }

    #[inline]
    pub fn registry(&self) -> &HandleRegistry<HostValue> {
        &self.registry
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run `f` under the global serialization lock.
    pub fn serialize<R>(
        &self,
        f: impl FnOnce() -> R,
    ) -> R {
        let _guard = self.global_lock.lock();
        f()
    }

    /// Register a primitive and return its handle.
    pub fn register(
        &self,
        value: HostValue,
    ) -> Result<Handle, BridgeError> {
        let kind = value.kind();
        let handle = self.registry.add(value)?;
        debug!(%handle, kind, "registered");
        Ok(handle)
    }

    /// Remove a registry entry and return what it held.
    pub fn release(
        &self,
        handle: Handle,
    ) -> Result<HostValue, BridgeError> {
        let value = self.registry.remove(handle)?;
        debug!(%handle, kind = value.kind(), "released");
        Ok(value)
    }

    /// Queue work on the worker pool.
    pub fn spawn<F>(
        &self,
        name: impl Into<String>,
        work: F,
    ) -> Result<Arc<Task>, BridgeError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Ok(self.scheduler.spawn(name, work)?)
    }

    /// Handle of `ctx`, registering it on first use.
    pub fn context_handle(
        &self,
        ctx: &Context,
    ) -> Result<Handle, BridgeError> {
        self.context_entry(ctx, false)
    }

    /// Number of contexts currently registered.
    pub fn registered_contexts(&self) -> usize {
        self.contexts.lock().entries.len()
    }

    fn context_entry(
        &self,
        ctx: &Context,
        retain: bool,
    ) -> Result<Handle, BridgeError> {
        let mut contexts = self.contexts.lock();
        let thread = ctx.thread_ref();
        if let Some(&handle) = contexts.by_thread.get(&thread) {
            if retain {
                if let Some(entry) = contexts.entries.get_mut(&handle) {
                    entry.closures += 1;
                }
            }
            return Ok(handle);
        }

        let handle = self.registry.add(HostValue::Context(ctx.clone()))?;
        contexts.by_thread.insert(thread, handle);
        contexts.entries.insert(
            handle,
            ContextEntry {
                closures: usize::from(retain),
                collected: false,
            },
        );
        debug!(%handle, %thread, "context registered");
        Ok(handle)
    }

    fn release_context(
        &self,
        handle: Handle,
    ) {
        let mut contexts = self.contexts.lock();
        let Some(entry) = contexts.entries.get_mut(&handle) else {
            return;
        };
        entry.closures = entry.closures.saturating_sub(1);
        if entry.closures == 0 && entry.collected {
            contexts.entries.remove(&handle);
            drop(contexts);
            self.drop_handle(handle);
        }
    }

    fn drop_handle(
        &self,
        handle: Handle,
    ) {
        match self.registry.remove(handle) {
            Ok(value) => debug!(%handle, kind = value.kind(), "handle released by collector"),
            Err(err) => warn!(%handle, error = %err, "collector released an unknown handle"),
        }
    }

    /// Push a script-callable closure that dispatches to `function`.
    ///
    /// A stack that cannot hold the three values the installation needs is
    /// unrecoverable and aborts the process.
    pub fn install(
        &self,
        ctx: &Context,
        function: HostFunction,
    ) -> Result<(), BridgeError> {
        if !ctx.check_stack(3) {
            fatal(&BridgeError::StackExhausted(3));
        }

        let context = self.context_entry(ctx, true)?;
        let function = match self.registry.add(HostValue::Function(function)) {
            Ok(handle) => handle,
            Err(err) => {
                self.release_context(context);
                return Err(err.into());
            }
        };

        ctx.push(context.to_value());
        ctx.push(function.to_value());
        ctx.push_host_closure(trampoline, 2);
        Ok(())
    }

    /// [`Bridge::install`] for a closure.
    pub fn install_fn<F>(
        &self,
        ctx: &Context,
        function: F,
    ) -> Result<(), BridgeError>
    where
        F: Fn(&Context) -> ScriptResult<usize> + Send + Sync + 'static,
    {
        self.install(ctx, Arc::new(function))
    }
}

impl Host for Bridge {
    fn thread_collected(
        &self,
        thread: ObjRef,
    ) {
        let mut contexts = self.contexts.lock();
        let Some(handle) = contexts.by_thread.remove(&thread) else {
            return;
        };
        let unused = match contexts.entries.get_mut(&handle) {
            Some(entry) => {
                entry.collected = true;
                entry.closures == 0
            }
            None => false,
        };
        if unused {
            contexts.entries.remove(&handle);
            drop(contexts);
            self.drop_handle(handle);
        }
    }

    fn host_closure_collected(
        &self,
        upvalues: &[Value],
    ) {
        if let Some(function) = upvalues.get(1).and_then(Handle::from_value) {
            self.drop_handle(function);
        }
        if let Some(context) = upvalues.first().and_then(Handle::from_value) {
            self.release_context(context);
        }
    }
}

/// Entry point of every bridge closure.
///
/// Arguments are on the caller's stack, so the function is dispatched to the
/// calling context; the installing context only has to belong to the same
/// runtime. A bridge that was dropped while scripts still run is reported as
/// a script error; every other resolution failure aborts.
fn trampoline(caller: &Context) -> ScriptResult<usize> {
    let function = match resolve_callback(caller) {
        Ok(function) => function,
        Err(err @ BridgeError::NotAttached) => return Err(err.into()),
        Err(err) => fatal(&err),
    };
    function(caller)
}

pub(crate) fn resolve_callback(caller: &Context) -> Result<HostFunction, BridgeError> {
    let bridge = Bridge::of(caller)?;
    let context = captured_handle(caller, 1)?;
    let function = captured_handle(caller, 2)?;

    match bridge.registry.get(context)? {
        HostValue::Context(installed) if installed.same_runtime(caller) => {}
        HostValue::Context(_) => return Err(BridgeError::RuntimeMismatch),
        other => {
            return Err(BridgeError::WrongKind {
                handle: context,
                expected: "context",
                found: other.kind(),
            })
        }
    }

    match bridge.registry.get(function)? {
        HostValue::Function(function) => Ok(function),
        other => Err(BridgeError::WrongKind {
            handle: function,
            expected: "function",
            found: other.kind(),
        }),
    }
}

fn captured_handle(
    caller: &Context,
    n: i32,
) -> Result<Handle, BridgeError> {
    Handle::from_value(&caller.to_value(upvalue_index(n))).ok_or(BridgeError::MissingHandle(n))
}

/// Log and abort: the bridge's bookkeeping can no longer be trusted.
pub(crate) fn fatal(err: &BridgeError) -> ! {
    error!(error = %err, "unrecoverable bridge failure");
    std::process::abort()
}
