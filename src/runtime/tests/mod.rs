//! Runtime unit tests


use crate::runtime::{Context, Runtime, RuntimeConfig, ScriptResult};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

/// Returns its arguments unchanged.
fn identity(ctx: &Context) -> ScriptResult<usize> {
    Ok(ctx.top())
}

/// Sums its integer arguments.
fn sum(ctx: &Context) -> ScriptResult<usize> {
    let total: i64 = (1..=ctx.top() as i32)
        .filter_map(|i| ctx.to_integer(i))
        .sum();
    ctx.push_integer(total);
    Ok(1)
}
