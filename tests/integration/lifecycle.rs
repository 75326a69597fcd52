//! Host objects are released once scripts can no longer reach them

use leap::runtime::Context;

use crate::support::{construct, invoke, leap, spawn, wait_until, TIMEOUT};

#[test]
fn test_dropped_primitives_release_registry_entries() {
    let leap = leap();
    let ctx = leap.context();
    ctx.collect_garbage();
    let before = leap.bridge().registry().len();

    for name in ["Mutex", "WaitGroup"] {
        construct(ctx, name).unwrap();
        ctx.set_top(0);
    }
    assert!(leap.bridge().registry().len() > before);

    ctx.collect_garbage();
    ctx.collect_garbage();
    assert_eq!(leap.bridge().registry().len(), before);
}

#[test]
fn test_finished_thread_releases_its_context() {
    let leap = leap();
    let ctx = leap.context();
    ctx.collect_garbage();
    let before = leap.bridge().registry().len();
    assert_eq!(leap.bridge().registered_contexts(), 1);

    // The spawned function builds a primitive on its own context, which
    // registers that context with the bridge.
    leap.bridge()
        .install_fn(ctx, |ctx: &Context| {
            construct(ctx, "Mutex")?;
            invoke(ctx, -1, "lock", 0)?;
            Ok(0)
        })
        .unwrap();
    spawn(ctx).unwrap();

    let stats = leap.bridge().scheduler().stats();
    assert!(wait_until(TIMEOUT, || stats.tasks_done() == 1));
    assert_eq!(leap.bridge().registered_contexts(), 2);

    ctx.set_top(0);
    ctx.collect_garbage();
    ctx.collect_garbage();
    assert_eq!(leap.bridge().registered_contexts(), 1);
    assert_eq!(leap.bridge().registry().len(), before);
}

#[test]
fn test_threads_table_only_holds_running_threads() {
    let leap = leap();
    let ctx = leap.context();
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);

    leap.bridge()
        .install_fn(ctx, move |_: &Context| {
            let _ = release_rx.recv();
            Ok(0)
        })
        .unwrap();
    spawn(ctx).unwrap();
    invoke(ctx, -1, "id", 1).unwrap();
    let id = ctx.to_str(-1).unwrap();
    ctx.set_top(0);

    // Running: rooted by the threads table even though no wrapper is left.
    ctx.collect_garbage();
    ctx.get_global("threads").unwrap();
    ctx.get_field(-1, &id).unwrap();
    assert!(!ctx.is_nil(-1));
    ctx.set_top(0);

    release_tx.send(()).unwrap();
    assert!(wait_until(TIMEOUT, || {
        ctx.get_global("threads").unwrap();
        ctx.get_field(-1, &id).unwrap();
        let gone = ctx.is_nil(-1);
        ctx.set_top(0);
        gone
    }));
}

#[test]
fn test_running_thread_outlives_dropped_leap() {
    let leap = leap();
    let ctx = leap.context();
    let (resume_tx, resume_rx) = crossbeam::channel::bounded::<()>(0);
    let (done_tx, done_rx) = crossbeam::channel::unbounded();

    construct(ctx, "Mutex").unwrap();
    ctx.set_global("shared_mutex").unwrap();

    // Goes through the bridge twice after the embedder let go of it: the
    // installed function itself and `try_lock`.
    leap.bridge()
        .install_fn(ctx, move |ctx: &Context| {
            let _ = resume_rx.recv();
            ctx.get_global("shared_mutex")?;
            invoke(ctx, -1, "try_lock", 1)?;
            let _ = done_tx.send(ctx.to_boolean(-1));
            Ok(0)
        })
        .unwrap();
    spawn(ctx).unwrap();
    drop(leap);

    resume_tx.send(()).unwrap();
    assert_eq!(done_rx.recv_timeout(TIMEOUT), Ok(true));
}
