//! `leap.WaitGroup()`
//!
//! A counter guarded by a `parking_lot` mutex with a condition variable that
//! is signalled when the counter drops to zero. `add` and `done` run under the
//! bridge's global serialization lock; `wait` does not.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::concurrent::{finish_wrapper, method, ContractViolation};
use crate::bridge::{Bridge, HostValue};
use crate::runtime::{Context, ScriptResult};

/// Host side of a script wait group.
#[derive(Debug, Default)]
pub struct ScriptWaitGroup {
    count: Mutex<usize>,
    zero: Condvar,
}

impl ScriptWaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter.
    pub fn add(&self) {
        *self.count.lock() += 1;
    }

    /// Decrement the counter, waking waiters when it reaches zero.
    ///
    /// Decrementing a zero counter is rejected and leaves it at zero.
    pub fn done(&self) -> Result<(), ContractViolation> {
        let mut count = self.count.lock();
        if *count == 0 {
            return Err(ContractViolation::NegativeCounter);
        }
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
        Ok(())
    }

    /// Block until the counter is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}

/// `leap.WaitGroup()`: build a wrapper table around a new wait group.
pub(crate) fn construct(ctx: &Context) -> ScriptResult<usize> {
    let bridge = Bridge::of(ctx)?;
    let group = Arc::new(ScriptWaitGroup::new());
    let handle = bridge.serialize(|| bridge.register(HostValue::WaitGroup(group.clone())))?;

    ctx.new_table();
    let g = group.clone();
    method(ctx, &bridge, "add", move |ctx| {
        Bridge::of(ctx)?.serialize(|| g.add());
        Ok(0)
    })?;
    let g = group.clone();
    method(ctx, &bridge, "done", move |ctx| {
        Bridge::of(ctx)?.serialize(|| g.done())?;
        Ok(0)
    })?;
    let g = group.clone();
    method(ctx, &bridge, "wait", move |_| {
        g.wait();
        Ok(0)
    })?;
    let g = group;
    method(ctx, &bridge, "count", move |ctx| {
        ctx.push_integer(g.count() as i64);
        Ok(1)
    })?;
    finish_wrapper(ctx, &bridge, "WaitGroup", handle)?;

    debug!(%handle, "wait group created");
    Ok(1)
}
