//! Batched mutation: collected invalidations, single rebuilds, deferred
//! notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use atomflow::{readable, state, Registry};

#[test]
fn test_batch_notifies_once_with_final_value() {
    let registry = Registry::new();
    let a = state(1);
    let b = state(2);
    let sum = {
        let a = a.as_atom().clone();
        let b = b.as_atom().clone();
        readable(move |ctx| Ok(ctx.get(&a)? + ctx.get(&b)?))
    };

    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let reader = registry.clone();
    let atom = sum.clone();
    let sink = log.clone();
    let _subscription = registry
        .subscribe(
            &sum,
            move || sink.lock().unwrap().push(reader.get(&atom).unwrap()),
            false,
        )
        .unwrap();

    registry.batch(|| {
        registry.set(&a, 10).unwrap();
        registry.set(&b, 20).unwrap();
    });

    assert_eq!(*log.lock().unwrap(), vec![30]);
}

#[test]
fn test_diamond_rebuilds_each_node_once() {
    let registry = Registry::new();
    let source = state(1);
    let evaluations = Arc::new(AtomicUsize::new(0));

    let left = source.as_atom().map(|n| n + 1);
    let right = source.as_atom().map(|n| n + 2);
    let join = {
        let left = left.clone();
        let right = right.clone();
        let counter = evaluations.clone();
        readable(move |ctx| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(ctx.get(&left)? + ctx.get(&right)?)
        })
    };

    let _subscription = registry.subscribe(&join, || (), true).unwrap();
    assert_eq!(evaluations.load(Ordering::Relaxed), 1);

    registry.batch(|| {
        registry.set(&source, 10).unwrap();
    });

    // Glitch-free: the join recomputed exactly once, after both arms.
    assert_eq!(evaluations.load(Ordering::Relaxed), 2);
    assert_eq!(registry.get(&join).unwrap(), 23);
}

#[test]
fn test_listener_fires_after_batch_body_returns() {
    let registry = Registry::new();
    let cell = state(0);
    let during_batch = Arc::new(AtomicUsize::new(usize::MAX));
    let notifications = Arc::new(AtomicUsize::new(0));

    let counter = notifications.clone();
    let _subscription = registry
        .subscribe(
            cell.as_atom(),
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            false,
        )
        .unwrap();

    let observed = during_batch.clone();
    let probe = notifications.clone();
    registry.batch(|| {
        registry.set(&cell, 1).unwrap();
        registry.set(&cell, 2).unwrap();
        observed.store(probe.load(Ordering::Relaxed), Ordering::Relaxed);
    });

    // Nothing fired inside the body; exactly one notification after.
    assert_eq!(during_batch.load(Ordering::Relaxed), 0);
    assert_eq!(notifications.load(Ordering::Relaxed), 1);
}

#[test]
fn test_nested_batches_commit_at_outermost() {
    let registry = Registry::new();
    let cell = state(0);
    let notifications = Arc::new(AtomicUsize::new(0));

    let counter = notifications.clone();
    let _subscription = registry
        .subscribe(
            cell.as_atom(),
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            false,
        )
        .unwrap();

    let probe = notifications.clone();
    registry.batch(|| {
        registry.batch(|| {
            registry.set(&cell, 1).unwrap();
        });
        // The inner batch did not commit.
        assert_eq!(probe.load(Ordering::Relaxed), 0);
        registry.set(&cell, 2).unwrap();
    });

    assert_eq!(notifications.load(Ordering::Relaxed), 1);
}

#[test]
fn test_batch_returns_body_output() {
    let registry = Registry::new();
    let cell = state(1);
    let doubled = registry.batch(|| {
        registry.set(&cell, 21).unwrap();
        registry.get(cell.as_atom()).map(|n| n * 2)
    });
    assert_eq!(doubled.unwrap(), 42);
}

#[test]
fn test_value_settled_inside_batch_is_visible_to_reads() {
    let registry = Registry::new();
    let a = state(1);
    let derived = a.as_atom().map(|n| n * 100);

    let _subscription = registry.subscribe(&derived, || (), true).unwrap();
    registry.batch(|| {
        registry.set(&a, 3).unwrap();
        // Reads inside the collect phase still see fresh values.
        assert_eq!(registry.get(&derived).unwrap(), 300);
    });
    assert_eq!(registry.get(&derived).unwrap(), 300);
}

#[test]
fn test_unchanged_result_notifies_nobody() {
    let registry = Registry::new();
    let a = state(2);
    // Collapses both inputs to the same output.
    let parity = a.as_atom().map(|n| n % 2);
    let notifications = Arc::new(AtomicUsize::new(0));

    let counter = notifications.clone();
    let _subscription = registry
        .subscribe(
            &parity,
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            false,
        )
        .unwrap();

    registry.batch(|| {
        registry.set(&a, 4).unwrap();
    });
    // 2 → 4 keeps parity 0: the derived value did not change.
    assert_eq!(notifications.load(Ordering::Relaxed), 0);
}
