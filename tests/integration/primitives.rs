//! Mutex, wait group and thread behaviour as seen from script contexts

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use leap::runtime::{Context, ScriptError};

use crate::support::{construct, invoke, leap, spawn, wait_until, TIMEOUT};

#[test]
fn test_sequential_lock_unlock_never_blocks() {
    let leap = leap();
    let ctx = leap.context();
    construct(ctx, "Mutex").unwrap();

    for _ in 0..1000 {
        invoke(ctx, 1, "lock", 0).unwrap();
        invoke(ctx, 1, "unlock", 0).unwrap();
    }
    invoke(ctx, 1, "is_locked", 1).unwrap();
    assert!(!ctx.to_boolean(-1));
}

#[test]
fn test_script_threads_exclude_each_other() {
    let leap = leap();
    let ctx = leap.context();
    construct(ctx, "Mutex").unwrap();
    ctx.set_global("m").unwrap();
    construct(ctx, "WaitGroup").unwrap();
    ctx.set_global("wg").unwrap();

    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        ctx.get_global("wg").unwrap();
        invoke(ctx, -1, "add", 0).unwrap();
        ctx.pop(1);

        let (inside, overlaps, entries) = (inside.clone(), overlaps.clone(), entries.clone());
        leap.bridge()
            .install_fn(ctx, move |ctx: &Context| {
                ctx.get_global("m")?;
                for _ in 0..50 {
                    invoke(ctx, -1, "lock", 0)?;
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    entries.fetch_add(1, Ordering::SeqCst);
                    std::thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    invoke(ctx, -1, "unlock", 0)?;
                }
                ctx.get_global("wg")?;
                invoke(ctx, -1, "done", 0)?;
                Ok(0)
            })
            .unwrap();
        spawn(ctx).unwrap();
        ctx.pop(1);
    }

    ctx.get_global("wg").unwrap();
    invoke(ctx, -1, "wait", 0).unwrap();
    assert_eq!(entries.load(Ordering::SeqCst), 200);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wait_returns_after_matching_done_calls() {
    let leap = leap();
    let ctx = leap.context();
    construct(ctx, "WaitGroup").unwrap();
    ctx.set_global("wg").unwrap();

    for _ in 0..5 {
        ctx.get_global("wg").unwrap();
        invoke(ctx, -1, "add", 0).unwrap();
        ctx.pop(1);
    }

    for _ in 0..5 {
        leap.bridge()
            .install_fn(ctx, |ctx: &Context| {
                ctx.get_global("wg")?;
                invoke(ctx, -1, "done", 0)?;
                Ok(0)
            })
            .unwrap();
        spawn(ctx).unwrap();
        ctx.pop(1);
    }

    ctx.get_global("wg").unwrap();
    invoke(ctx, -1, "wait", 0).unwrap();
    invoke(ctx, -1, "count", 1).unwrap();
    assert_eq!(ctx.to_integer(-1), Some(0));
}

#[test]
fn test_wait_blocks_until_counter_reaches_zero() {
    let leap = leap();
    let ctx = leap.context();
    construct(ctx, "WaitGroup").unwrap();
    ctx.set_global("wg").unwrap();
    ctx.get_global("wg").unwrap();
    invoke(ctx, -1, "add", 0).unwrap();
    ctx.pop(1);

    let (waited_tx, waited_rx) = channel::bounded(1);

    // Waiter thread: blocks in wait() until the main context calls done().
    leap.bridge()
        .install_fn(ctx, move |ctx: &Context| {
            ctx.get_global("wg")?;
            invoke(ctx, -1, "wait", 0)?;
            let _ = waited_tx.send(());
            Ok(0)
        })
        .unwrap();
    spawn(ctx).unwrap();
    ctx.pop(1);

    assert!(waited_rx.recv_timeout(Duration::from_millis(100)).is_err());

    ctx.get_global("wg").unwrap();
    invoke(ctx, -1, "done", 0).unwrap();
    waited_rx.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn test_run_returns_while_function_blocks() {
    let leap = leap();
    let ctx = leap.context();

    let (started_tx, started_rx) = channel::bounded(1);
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let (finished_tx, finished_rx) = channel::bounded(1);
    leap.bridge()
        .install_fn(ctx, move |_: &Context| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            let _ = finished_tx.send(());
            Ok(0)
        })
        .unwrap();

    // run() returned: the function is still blocked.
    spawn(ctx).unwrap();
    started_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(finished_rx.try_recv().is_err());
    invoke(ctx, -1, "status", 1).unwrap();
    assert_eq!(ctx.to_str(-1).as_deref(), Some("running"));
    ctx.pop(1);

    release_tx.send(()).unwrap();
    finished_rx.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn test_function_runs_once_on_a_snapshot_of_globals() {
    let leap = leap();
    let ctx = leap.context();
    ctx.push_integer(1);
    ctx.set_global("first").unwrap();
    ctx.push_string("two");
    ctx.set_global("second").unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel::unbounded();
    let counter = runs.clone();
    leap.bridge()
        .install_fn(ctx, move |ctx: &Context| {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.get_global("first")?;
            ctx.get_global("second")?;
            let _ = tx.send((ctx.to_integer(-2), ctx.to_str(-1)));
            Ok(0)
        })
        .unwrap();
    spawn(ctx).unwrap();

    let (first, second) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first, Some(1));
    assert_eq!(second.as_deref(), Some("two"));

    let stats = leap.bridge().scheduler().stats();
    assert!(wait_until(TIMEOUT, || stats.tasks_done() == 1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_errors_in_threads_do_not_reach_the_spawner() {
    let leap = leap();
    let ctx = leap.context();
    leap.bridge()
        .install_fn(ctx, |_: &Context| Err(ScriptError::runtime("boom")))
        .unwrap();
    spawn(ctx).unwrap();

    let stats = leap.bridge().scheduler().stats();
    assert!(wait_until(TIMEOUT, || {
        stats.tasks_failed.load(Ordering::SeqCst) == 1
    }));
    invoke(ctx, -1, "status", 1).unwrap();
    assert_eq!(ctx.to_str(-1).as_deref(), Some("finished"));
}
