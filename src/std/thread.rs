//! `leap.Thread(f)`
//!
//! A thread wrapper captures a function. `run()` creates a new context that
//! shares the runtime's globals, parks it in the global `threads` table under
//! a UUID so the collector keeps it alive, moves the function onto it and
//! hands it to the worker pool. `run()` returns without waiting; joining is
//! done with a wait group.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::concurrent::{finish_wrapper, method, ContractViolation};
use super::THREADS_GLOBAL;
use crate::bridge::{Bridge, HostValue};
use crate::runtime::{Context, ScriptError, ScriptResult};

/// Lifecycle of a thread wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Constructed,
    Running,
    Finished,
}

impl ThreadStatus {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Finished,
            _ => ThreadStatus::Constructed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThreadStatus::Constructed => "constructed",
            ThreadStatus::Running => "running",
            ThreadStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host side of a script thread.
#[derive(Debug, Default)]
pub struct ScriptThread {
    status: AtomicU8,
    id: Mutex<Option<String>>,
}

impl ScriptThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Identifier assigned by a successful `run()`.
    pub fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    fn start(&self) -> Result<(), ContractViolation> {
        self.status
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| ContractViolation::AlreadyStarted)
    }

    fn abort_start(&self) {
        self.status.store(0, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.status.store(2, Ordering::SeqCst);
    }
}

/// `leap.Thread(f)`: build a wrapper table capturing `f`.
pub(crate) fn construct(ctx: &Context) -> ScriptResult<usize> {
    if ctx.top() < 1 {
        return Err(ScriptError::runtime(
            "You must supply a function to leap.Thread() constructor",
        ));
    }
    if !ctx.is_function(1) {
        return Err(ScriptError::bad_argument(
            1,
            "Thread",
            format!("function expected, got {}", ctx.type_of(1).name()),
        ));
    }

    let bridge = Bridge::of(ctx)?;
    let thread = Arc::new(ScriptThread::new());
    let handle = bridge.serialize(|| bridge.register(HostValue::Thread(thread.clone())))?;

    ctx.new_table();
    ctx.push_value(1);
    ctx.raw_set_field(-2, "func")?;
    let t = thread.clone();
    method(ctx, &bridge, "run", move |ctx| run(ctx, &t))?;
    let t = thread.clone();
    method(ctx, &bridge, "status", move |ctx| {
        ctx.push_string(t.status().name());
        Ok(1)
    })?;
    let t = thread;
    method(ctx, &bridge, "id", move |ctx| {
        match t.id() {
            Some(id) => ctx.push_string(&id),
            None => ctx.push_nil(),
        }
        Ok(1)
    })?;
    finish_wrapper(ctx, &bridge, "Thread", handle)?;

    debug!(%handle, "thread created");
    Ok(1)
}

/// `thread:run()`
fn run(
    ctx: &Context,
    thread: &Arc<ScriptThread>,
) -> ScriptResult<usize> {
    if ctx.top() != 1 {
        return Err(ScriptError::runtime(
            "thread:run() takes no arguments besides the thread itself",
        ));
    }
    thread.start()?;
    spawn(ctx, thread).map_err(|err| {
        thread.abort_start();
        err
    })?;
    Ok(0)
}

fn spawn(
    ctx: &Context,
    thread: &Arc<ScriptThread>,
) -> ScriptResult<()> {
    let bridge = Bridge::of(ctx)?;
    let id = Uuid::new_v4().to_string();

    ctx.get_global(THREADS_GLOBAL)?;
    let child = ctx.new_thread();
    bridge.serialize(|| ctx.set_field(-2, &id))?;
    ctx.pop(1);

    ctx.raw_get_field(1, "func")?;
    ctx.xmove(&child, 1)?;

    // Bridge closures find the bridge through the runtime's weak host
    // reference, so the task owns a strong one until the function returns.
    let task_bridge = bridge.clone();
    let task_thread = thread.clone();
    let task_id = id.clone();
    let spawned = bridge.spawn(format!("thread-{}", id), move || {
        let outcome = execute(&child, &task_thread, &task_id);
        drop(task_bridge);
        outcome
    });

    if let Err(err) = spawned {
        ctx.get_global(THREADS_GLOBAL)?;
        ctx.push_nil();
        bridge.serialize(|| ctx.set_field(-2, &id))?;
        ctx.pop(1);
        return Err(err.into());
    }
    *thread.id.lock() = Some(id);
    Ok(())
}

/// Body of the worker task: call the function, then release the context.
fn execute(
    ctx: &Context,
    thread: &ScriptThread,
    id: &str,
) -> anyhow::Result<()> {
    debug!(thread = id, "thread started");
    let outcome = ctx.call(0, 0);
    thread.finish();

    // The entry is cleared from inside a call so that the context stays
    // rooted by its own frame until the store is done.
    ctx.push_function(clear_entry);
    ctx.push_string(id);
    ctx.call(1, 0)
        .with_context(|| format!("could not clear threads entry of {}", id))?;

    outcome.with_context(|| format!("thread {} raised an error", id))?;
    debug!(thread = id, "thread finished");
    Ok(())
}

/// `threads[id] = nil`
fn clear_entry(ctx: &Context) -> ScriptResult<usize> {
    let bridge = Bridge::of(ctx)?;
    let id = ctx
        .to_str(1)
        .ok_or_else(|| ScriptError::bad_argument(1, "clear_entry", "thread id expected"))?;
    ctx.get_global(THREADS_GLOBAL)?;
    ctx.push_nil();
    bridge.serialize(|| ctx.set_field(-2, &id))?;
    Ok(0)
}
