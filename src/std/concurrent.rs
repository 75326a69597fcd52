//! `leap` module loader and the wrapper shape shared by its primitives
//!
//! Every primitive reaches scripts as a plain table whose methods are bridge
//! closures, with a metatable providing `__tostring`, `__gc` and an `__index`
//! that rejects unknown members. The host object itself is captured by the
//! method closures; its registry entry exists for lifecycle tracking and is
//! released by `__gc`.

use thiserror::Error;
use tracing::{info, warn};

use super::{mutex, thread, wait_group, MODULE_NAME};
use crate::bridge::{Bridge, Handle};
use crate::runtime::{upvalue_index, Context, ScriptError, ScriptResult};

/// Misuse of a primitive that is detected and raised as a script error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("unlock of unlocked mutex")]
    UnlockOfUnlocked,

    #[error("sync: negative WaitGroup counter")]
    NegativeCounter,

    #[error("thread already started")]
    AlreadyStarted,
}

impl From<ContractViolation> for ScriptError {
    fn from(violation: ContractViolation) -> Self {
        ScriptError::runtime(violation.to_string())
    }
}

/// Register the module loader so that `require('leap')` finds it.
pub(crate) fn preload(
    ctx: &Context,
    bridge: &Bridge,
) -> ScriptResult<()> {
    bridge.install_fn(ctx, load_module)?;
    ctx.preload(MODULE_NAME)
}

/// Build the module table.
///
/// Scripts get an empty proxy whose metatable serves the constructors from
/// a captured member table, so every assignment reaches `__newindex`.
fn load_module(ctx: &Context) -> ScriptResult<usize> {
    let bridge = Bridge::of(ctx)?;

    ctx.new_table();
    ctx.new_table();

    ctx.new_table();
    method(ctx, &bridge, "Mutex", mutex::construct)?;
    method(ctx, &bridge, "WaitGroup", wait_group::construct)?;
    method(ctx, &bridge, "Thread", thread::construct)?;
    ctx.push_closure(module_index, 1);
    ctx.raw_set_field(-2, "__index")?;

    method(ctx, &bridge, "__newindex", |_| {
        Err(ScriptError::runtime(format!(
            "Attempt to add/modify module keys on module '{}' is disallowed",
            MODULE_NAME
        )))
    })?;
    method(ctx, &bridge, "__tostring", |ctx| {
        ctx.push_string(&format!("module '{}'", MODULE_NAME));
        Ok(1)
    })?;
    ctx.set_metatable(-2)?;

    info!(module = MODULE_NAME, "module loaded");
    Ok(1)
}

/// `__index` of the module proxy; upvalue 1 is the member table.
fn module_index(ctx: &Context) -> ScriptResult<usize> {
    if let Some(key) = ctx.to_str(2) {
        ctx.raw_get_field(upvalue_index(1), &key)?;
        if !ctx.is_nil(-1) {
            return Ok(1);
        }
    }
    unknown_member(ctx, MODULE_NAME)
}

/// Install `function` as field `name` of the table on top of the stack.
pub(crate) fn method<F>(
    ctx: &Context,
    bridge: &Bridge,
    name: &str,
    function: F,
) -> ScriptResult<()>
where
    F: Fn(&Context) -> ScriptResult<usize> + Send + Sync + 'static,
{
    bridge.install_fn(ctx, function)?;
    ctx.raw_set_field(-2, name)
}

/// Give the wrapper table on top of the stack its metatable.
pub(crate) fn finish_wrapper(
    ctx: &Context,
    bridge: &Bridge,
    kind: &'static str,
    handle: Handle,
) -> ScriptResult<()> {
    let label = format!("{}({})", kind, handle);

    ctx.new_table();
    method(ctx, bridge, "__tostring", move |ctx| {
        ctx.push_string(&label);
        Ok(1)
    })?;
    method(ctx, bridge, "__gc", move |ctx| collect_wrapper(ctx, kind, handle))?;
    method(ctx, bridge, "__index", move |ctx| unknown_member(ctx, kind))?;
    ctx.set_metatable(-2)
}

/// `__gc` of a wrapper: drop the primitive's registry entry.
///
/// Closures that captured the primitive keep it alive; a held mutex ticket is
/// not given back.
fn collect_wrapper(
    ctx: &Context,
    kind: &'static str,
    handle: Handle,
) -> ScriptResult<usize> {
    let bridge = Bridge::of(ctx)?;
    match bridge.release(handle) {
        Ok(_) => info!(kind, %handle, "primitive collected"),
        Err(err) => warn!(kind, %handle, error = %err, "primitive was already released"),
    }
    Ok(0)
}

/// `__index` of a wrapper: every legal member is a raw field.
fn unknown_member(
    ctx: &Context,
    owner: &str,
) -> ScriptResult<usize> {
    let key = ctx
        .to_str(2)
        .unwrap_or_else(|| ctx.type_of(2).name().to_string());
    Err(ScriptError::runtime(format!(
        "{} has no member '{}'",
        owner, key
    )))
}
