//! `leap.Mutex()`
//!
//! A binary semaphore built on a one-slot crossbeam channel seeded with a
//! single ticket. `lock` takes the ticket, blocking the calling worker until
//! it is available; `unlock` puts it back. The lock is not reentrant and has
//! no owner: any context may unlock it.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tracing::debug;

use super::concurrent::{finish_wrapper, method, ContractViolation};
use crate::bridge::{Bridge, HostValue};
use crate::runtime::{Context, ScriptResult};

/// Host side of a script mutex.
#[derive(Debug)]
pub struct ScriptMutex {
    tickets: Sender<()>,
    slot: Receiver<()>,
}

impl Default for ScriptMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptMutex {
    pub fn new() -> Self {
        let (tickets, slot) = channel::bounded(1);
        // Fresh one-slot channel: the seed cannot fail.
        let _ = tickets.try_send(());
        Self { tickets, slot }
    }

    /// Block until the ticket is available and take it.
    pub fn lock(&self) {
        // Both channel ends live in `self`, so the channel never disconnects.
        let _ = self.slot.recv();
    }

    /// Take the ticket if it is available.
    pub fn try_lock(&self) -> bool {
        self.slot.try_recv().is_ok()
    }

    /// Return the ticket.
    pub fn unlock(&self) -> Result<(), ContractViolation> {
        match self.tickets.try_send(()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {
                Err(ContractViolation::UnlockOfUnlocked)
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.slot.is_empty()
    }
}

/// `leap.Mutex()`: build a wrapper table around a new mutex.
pub(crate) fn construct(ctx: &Context) -> ScriptResult<usize> {
    let bridge = Bridge::of(ctx)?;
    let mutex = Arc::new(ScriptMutex::new());
    let handle = bridge.serialize(|| bridge.register(HostValue::Mutex(mutex.clone())))?;

    ctx.new_table();
    let m = mutex.clone();
    method(ctx, &bridge, "lock", move |_| {
        m.lock();
        Ok(0)
    })?;
    let m = mutex.clone();
    method(ctx, &bridge, "unlock", move |_| {
        m.unlock()?;
        Ok(0)
    })?;
    let m = mutex.clone();
    method(ctx, &bridge, "try_lock", move |ctx| {
        ctx.push_bool(m.try_lock());
        Ok(1)
    })?;
    let m = mutex;
    method(ctx, &bridge, "is_locked", move |ctx| {
        ctx.push_bool(m.is_locked());
        Ok(1)
    })?;
    finish_wrapper(ctx, &bridge, "Mutex", handle)?;

    debug!(%handle, "mutex created");
    Ok(1)
}
