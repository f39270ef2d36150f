//! Atoms wired to the registry's reactivity service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use atomflow::{readable, Key, Registry};

fn counting_atom(evaluations: &Arc<AtomicUsize>) -> atomflow::Atom<usize> {
    let counter = evaluations.clone();
    readable(move |_ctx| Ok(counter.fetch_add(1, Ordering::Relaxed)))
}

#[test]
fn test_with_reactivity_refreshes_on_matching_key() {
    let registry = Registry::new();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let users = counting_atom(&evaluations).with_reactivity(vec![Key::text("users")]);

    let _subscription = registry.subscribe(&users, || (), true).unwrap();
    assert_eq!(evaluations.load(Ordering::Relaxed), 1);

    registry
        .reactivity()
        .invalidate_unsafe(&[Key::text("users")]);
    assert_eq!(evaluations.load(Ordering::Relaxed), 2);

    // Unrelated keys leave the atom alone.
    registry
        .reactivity()
        .invalidate_unsafe(&[Key::text("posts")]);
    assert_eq!(evaluations.load(Ordering::Relaxed), 2);
}

#[test]
fn test_record_keys_match_exactly() {
    let registry = Registry::new();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let user = counting_atom(&evaluations).with_reactivity(Key::domain("users", [1]));

    let _subscription = registry.subscribe(&user, || (), true).unwrap();
    assert_eq!(evaluations.load(Ordering::Relaxed), 1);

    registry
        .reactivity()
        .invalidate_unsafe(&[Key::record("users", 1)]);
    assert_eq!(evaluations.load(Ordering::Relaxed), 2);

    registry
        .reactivity()
        .invalidate_unsafe(&[Key::record("users", 2)]);
    assert_eq!(evaluations.load(Ordering::Relaxed), 2);
}

#[test]
fn test_refresh_on_focus() {
    let registry = Registry::new();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let focused = counting_atom(&evaluations).refresh_on_focus();

    let _subscription = registry.subscribe(&focused, || (), true).unwrap();
    registry
        .reactivity()
        .invalidate_unsafe(&[Key::text("focus")]);
    assert_eq!(evaluations.load(Ordering::Relaxed), 2);
}

#[test]
fn test_handler_unregisters_with_node() {
    let registry = Registry::new();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let users = counting_atom(&evaluations).with_reactivity(vec![Key::text("users")]);

    let subscription = registry.subscribe(&users, || (), true).unwrap();
    subscription.unsubscribe();
    registry.run_until_idle();
    assert!(registry.get_nodes().is_empty());

    // The removed node's handler no longer fires.
    registry
        .reactivity()
        .invalidate_unsafe(&[Key::text("users")]);
    assert_eq!(evaluations.load(Ordering::Relaxed), 1);
}

#[test]
fn test_unobserved_reactive_atom_defers() {
    let registry = Registry::new();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let users = counting_atom(&evaluations).with_reactivity(vec![Key::text("users")]);

    assert_eq!(registry.get(&users).unwrap(), 0);
    // No listeners: the refresh invalidates but recomputation waits for a
    // reader.
    registry
        .reactivity()
        .invalidate_unsafe(&[Key::text("users")]);
    assert_eq!(evaluations.load(Ordering::Relaxed), 1);
    assert_eq!(registry.get(&users).unwrap(), 1);
}
