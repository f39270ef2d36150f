//! Idle-TTL eviction and cascading removal, driven on a manual clock.

use std::time::Duration;

use atomflow::{state, ManualClock, Registry, RegistryOptions};

fn ttl_registry(clock: &ManualClock) -> Registry {
    Registry::with_options(RegistryOptions {
        timeout_resolution: Some(Duration::from_millis(100)),
        default_idle_ttl: Some(Duration::from_millis(300)),
        clock: Some(clock.clock()),
        ..Default::default()
    })
}

#[test]
fn test_idle_node_survives_until_ttl_then_goes() {
    let clock = ManualClock::new();
    let registry = ttl_registry(&clock);
    let cell = state(1);

    let subscription = registry.subscribe(cell.as_atom(), || (), true).unwrap();
    subscription.unsubscribe();
    registry.run_until_idle();
    assert_eq!(registry.get_nodes().len(), 1);

    // Alive within the TTL window.
    clock.advance(250);
    registry.tick();
    assert_eq!(registry.get_nodes().len(), 1);

    // Gone once the window plus bucket resolution has elapsed.
    clock.advance(200);
    registry.tick();
    assert!(registry.get_nodes().is_empty());
}

#[test]
fn test_reacquisition_cancels_eviction() {
    let clock = ManualClock::new();
    let registry = ttl_registry(&clock);
    let cell = state(1);

    let subscription = registry.subscribe(cell.as_atom(), || (), true).unwrap();
    subscription.unsubscribe();
    registry.run_until_idle();

    clock.advance(250);
    registry.tick();
    // Reading the atom re-acquires the node and clears the pending TTL.
    assert_eq!(registry.get(cell.as_atom()).unwrap(), 1);

    clock.advance(1_000);
    registry.tick();
    assert_eq!(registry.get_nodes().len(), 1);
}

#[test]
fn test_per_atom_ttl_overrides_default() {
    let clock = ManualClock::new();
    let registry = ttl_registry(&clock);
    let quick = state(1).set_idle_ttl(Duration::from_millis(100));

    let subscription = registry.subscribe(quick.as_atom(), || (), true).unwrap();
    subscription.unsubscribe();
    registry.run_until_idle();

    clock.advance(150);
    registry.tick();
    assert!(registry.get_nodes().is_empty());
}

#[test]
fn test_no_ttl_means_removal_on_next_tick() {
    let registry = Registry::new();
    let cell = state(1);

    let subscription = registry.subscribe(cell.as_atom(), || (), true).unwrap();
    subscription.unsubscribe();
    registry.run_until_idle();
    assert!(registry.get_nodes().is_empty());
}

#[test]
fn test_removal_cascades_to_unobserved_parents() {
    let registry = Registry::new();
    let source = state(1);
    let derived = source.as_atom().map(|n| n + 1);

    let subscription = registry.subscribe(&derived, || (), true).unwrap();
    assert_eq!(registry.get_nodes().len(), 2);

    subscription.unsubscribe();
    registry.run_until_idle();
    // Both the derived node and its now-childless parent are gone.
    assert!(registry.get_nodes().is_empty());
}

#[test]
fn test_subscribed_node_is_not_evicted() {
    let clock = ManualClock::new();
    let registry = ttl_registry(&clock);
    let cell = state(1);

    let _subscription = registry.subscribe(cell.as_atom(), || (), true).unwrap();
    clock.advance(10_000);
    registry.tick();
    assert_eq!(registry.get_nodes().len(), 1);
}

#[test]
fn test_reset_clears_pending_evictions() {
    let clock = ManualClock::new();
    let registry = ttl_registry(&clock);
    let cell = state(1);

    let subscription = registry.subscribe(cell.as_atom(), || (), true).unwrap();
    subscription.unsubscribe();
    registry.run_until_idle();
    registry.reset().unwrap();
    assert!(registry.get_nodes().is_empty());

    // Nothing left to sweep after the reset.
    clock.advance(1_000);
    registry.tick();
    assert!(registry.get_nodes().is_empty());
}
