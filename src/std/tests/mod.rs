//! `leap` module unit tests


use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::Bridge;
use crate::runtime::scheduler::SchedulerConfig;
use crate::runtime::{Context, Runtime, RuntimeConfig, ScriptResult};

use super::open_libs;

/// A runtime with the libraries opened on a small pool.
fn setup() -> (Runtime, Arc<Bridge>) {
    let runtime = Runtime::new(RuntimeConfig::default());
    let bridge = Bridge::new(SchedulerConfig {
        core_workers: 2,
        max_workers: 16,
        ..SchedulerConfig::default()
    })
    .unwrap();
    open_libs(runtime.main(), &bridge).unwrap();
    (runtime, bridge)
}

/// Push `leap.<name>`.
fn constructor(
    ctx: &Context,
    name: &str,
) -> ScriptResult<()> {
    ctx.get_global("leap")?;
    ctx.get_field(-1, name)?;
    ctx.remove(-2);
    Ok(())
}

/// Push a new `leap.<name>()` wrapper.
fn construct(
    ctx: &Context,
    name: &str,
) -> ScriptResult<()> {
    constructor(ctx, name)?;
    ctx.call(0, 1)
}

/// `obj:name()` for the wrapper at `obj`.
fn invoke(
    ctx: &Context,
    obj: i32,
    name: &str,
    nresults: i32,
) -> ScriptResult<()> {
    let obj = ctx.abs_index(obj);
    ctx.get_field(obj, name)?;
    ctx.push_value(obj);
    ctx.call(1, nresults)
}

/// Poll `cond` until it holds or `timeout` passes.
fn wait_until(
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
