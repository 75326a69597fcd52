//! Base library
//!
//! The handful of global functions scripts need to raise and catch errors,
//! inspect values and load modules.

use super::context::{Context, NativeFn, MULTRET};
use super::error::{ScriptError, ScriptResult};

/// Register the base functions as globals.
pub fn open(ctx: &Context) -> ScriptResult<()> {
    let functions: [(&str, NativeFn); 6] = [
        ("error", base_error),
        ("pcall", base_pcall),
        ("collectgarbage", base_collectgarbage),
        ("tostring", base_tostring),
        ("type", base_type),
        ("require", base_require),
    ];
    for (name, func) in functions {
        ctx.push_function(func);
        ctx.set_global(name)?;
    }
    Ok(())
}

/// `error(value)`: raise `value`.
fn base_error(ctx: &Context) -> ScriptResult<usize> {
    ctx.set_top(1);
    Err(ctx.error())
}

/// `pcall(f, ...)`: call `f` and report `true, results...` or `false, err`.
fn base_pcall(ctx: &Context) -> ScriptResult<usize> {
    if ctx.top() == 0 {
        return Err(ScriptError::bad_argument(1, "pcall", "value expected"));
    }
    match ctx.call(ctx.top() - 1, MULTRET) {
        Ok(()) => {
            ctx.push_bool(true);
            ctx.insert(1);
            Ok(ctx.top())
        }
        Err(err) => {
            ctx.push_bool(false);
            ctx.push_error(err);
            Ok(2)
        }
    }
}

/// `collectgarbage()`: run a full cycle and return the live object count.
fn base_collectgarbage(ctx: &Context) -> ScriptResult<usize> {
    let stats = ctx.collect_garbage();
    ctx.push_integer(stats.live_objects as i64);
    Ok(1)
}

fn base_tostring(ctx: &Context) -> ScriptResult<usize> {
    if ctx.top() == 0 {
        return Err(ScriptError::bad_argument(1, "tostring", "value expected"));
    }
    let s = ctx.to_display_string(1)?;
    ctx.push_string(&s);
    Ok(1)
}

fn base_type(ctx: &Context) -> ScriptResult<usize> {
    if ctx.top() == 0 {
        return Err(ScriptError::bad_argument(1, "type", "value expected"));
    }
    let name = ctx.type_of(1).name();
    ctx.push_string(name);
    Ok(1)
}

fn base_require(ctx: &Context) -> ScriptResult<usize> {
    let name = ctx
        .to_str(1)
        .ok_or_else(|| ScriptError::bad_argument(1, "require", "string expected"))?;
    ctx.require(&name)?;
    Ok(1)
}
