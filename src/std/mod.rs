//! Standard library
//!
//! The `leap` concurrency module: a mutex, a wait group and threads that run
//! script functions on the bridge's worker pool.

pub mod concurrent;
pub mod mutex;
pub mod thread;
pub mod wait_group;

use std::sync::Arc;

use tracing::info;

use crate::bridge::Bridge;
use crate::runtime::{baselib, Context, ScriptResult};

#[cfg(test)]
mod tests;

/// Name scripts `require` the module under.
pub const MODULE_NAME: &str = "leap";

/// Global table that keeps running thread contexts reachable.
pub const THREADS_GLOBAL: &str = "threads";

/// Prepare a runtime for scripts.
///
/// Attaches `bridge` as the runtime's host, installs the base functions,
/// registers the `leap` loader and then runs the boot step:
/// `leap = require('leap')` and `threads = {}`.
pub fn open_libs(
    ctx: &Context,
    bridge: &Arc<Bridge>,
) -> ScriptResult<()> {
    bridge.attach(ctx)?;
    baselib::open(ctx)?;
    concurrent::preload(ctx, bridge)?;

    ctx.require(MODULE_NAME)?;
    ctx.set_global(MODULE_NAME)?;
    ctx.new_table();
    ctx.set_global(THREADS_GLOBAL)?;

    info!(module = MODULE_NAME, "libraries opened");
    Ok(())
}
