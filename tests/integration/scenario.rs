//! Three threads joined with a wait group captured by closure

use leap::runtime::{upvalue_index, Context, ScriptResult, ValueType};

use crate::support::{construct, invoke, leap, spawn};

/// Upvalue 1: the wait group. Upvalue 2: the worker number.
fn worker(ctx: &Context) -> ScriptResult<usize> {
    let n = ctx.to_integer(upvalue_index(2)).unwrap_or_default();

    // Some work whose result the spawner can observe.
    let total: i64 = (1..=n * 100).sum();
    ctx.get_global("results")?;
    ctx.push_integer(total);
    ctx.set_field(-2, &format!("worker{}", n))?;
    ctx.pop(1);

    ctx.push_value(upvalue_index(1));
    invoke(ctx, -1, "done", 0)?;
    Ok(0)
}

#[test]
fn test_three_workers_join_on_wait_group() {
    let leap = leap();
    let ctx = leap.context();
    ctx.new_table();
    ctx.set_global("results").unwrap();

    construct(ctx, "WaitGroup").unwrap();
    let wg = ctx.top() as i32;
    for _ in 0..3 {
        invoke(ctx, wg, "add", 0).unwrap();
    }

    for n in 1..=3 {
        ctx.push_value(wg);
        ctx.push_integer(n);
        ctx.push_closure(worker, 2);
        spawn(ctx).unwrap();
        ctx.pop(1);
    }

    invoke(ctx, wg, "wait", 0).unwrap();

    ctx.get_global("results").unwrap();
    for n in 1..=3i64 {
        ctx.get_field(-1, &format!("worker{}", n)).unwrap();
        assert_eq!(ctx.type_of(-1), ValueType::Number, "worker{} left no result", n);
        assert_eq!(ctx.to_integer(-1), Some((1..=n * 100).sum::<i64>()));
        ctx.pop(1);
    }
}

#[test]
fn test_scenario_repeats_on_one_runtime() {
    let leap = leap();
    let ctx = leap.context();
    ctx.new_table();
    ctx.set_global("results").unwrap();

    for _ in 0..10 {
        construct(ctx, "WaitGroup").unwrap();
        for n in 1..=3 {
            invoke(ctx, -1, "add", 0).unwrap();
            ctx.push_value(-1);
            ctx.push_integer(n);
            ctx.push_closure(worker, 2);
            spawn(ctx).unwrap();
            ctx.pop(1);
        }
        invoke(ctx, -1, "wait", 0).unwrap();
        invoke(ctx, -1, "count", 1).unwrap();
        assert_eq!(ctx.to_integer(-1), Some(0));
        ctx.pop(2);
        ctx.collect_garbage();
    }
}
