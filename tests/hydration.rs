//! Serializable atoms: shared identity, staged hydration, dehydration.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use serde_json::json;

use atomflow::{effect, state, value, AsyncResult, InitialValue, Registry, RegistryOptions};

struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[test]
fn test_atoms_with_same_key_share_one_node() {
    let registry = Registry::new();
    let writer = state(0i64).serializable("counter");
    let reader = value(999i64).serializable("counter");

    assert_eq!(registry.get(writer.as_atom()).unwrap(), 0);
    // Same key, same node: the reader sees the shared state, not its own
    // read function.
    assert_eq!(registry.get(&reader).unwrap(), 0);
    registry.set(&writer, 5).unwrap();
    assert_eq!(registry.get(&reader).unwrap(), 5);
    assert_eq!(registry.get_nodes().len(), 1);
}

#[test]
fn test_staged_value_seeds_first_read() {
    let registry = Registry::new();
    registry.set_serializable("counter", json!(7)).unwrap();

    let cell = state(0i64).serializable("counter");
    assert_eq!(registry.get(cell.as_atom()).unwrap(), 7);
}

#[test]
fn test_hydrating_live_node_overwrites_and_notifies() {
    let registry = Registry::new();
    let cell = state(0i64).serializable("counter");
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

    registry.set_serializable("counter", json!(9)).unwrap();
    assert_eq!(registry.get(cell.as_atom()).unwrap(), 9);
    assert_eq!(notifications.load(Ordering::Relaxed), 1);
}

#[test]
fn test_dehydrate_emits_serializable_nodes_only() {
    let registry = Registry::new();
    let keyed = state(3i64).serializable("kept");
    let plain = state(4i64);

    registry.get(keyed.as_atom()).unwrap();
    registry.get(plain.as_atom()).unwrap();

    let entries = registry.dehydrate();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "kept");
    assert_eq!(entries[0].value, json!(3));
}

#[test]
fn test_hydrate_round_trip() {
    let source = Registry::new();
    let cell = state(0i64).serializable("shared");
    source.set(&cell, 11).unwrap();
    let entries = source.dehydrate();

    let target = Registry::new();
    target.hydrate(entries).unwrap();
    assert_eq!(target.get(cell.as_atom()).unwrap(), 11);
}

#[test]
fn test_initial_values_serial_option() {
    let registry = Registry::with_options(RegistryOptions {
        initial_values: vec![InitialValue::serial("boot", json!(5))],
        ..Default::default()
    });
    let cell = state(0i64).serializable("boot");
    assert_eq!(registry.get(cell.as_atom()).unwrap(), 5);
}

#[test]
fn test_server_value_applies_only_while_initial() {
    let registry = Registry::new();
    let remote: atomflow::Atom<AsyncResult<i64, String>> = effect(|_ctx| {
        Box::pin(async {
            YieldOnce(false).await;
            Ok(42)
        })
    })
    .serializable_result("remote")
    .with_server_value_initial();

    // Still waiting on the first run: the staged value applies.
    assert!(registry.get(&remote).unwrap().is_initial());
    registry.set_serializable("remote", json!(1)).unwrap();
    assert_eq!(registry.get(&remote).unwrap().value(), Some(&1));

    registry.run_until_idle();
    assert_eq!(registry.get(&remote).unwrap().value(), Some(&42));

    // Settled now, so a late staged value is ignored.
    registry.set_serializable("remote", json!(2)).unwrap();
    assert_eq!(registry.get(&remote).unwrap().value(), Some(&42));
}

#[test]
fn test_server_value_overwrites_when_not_restricted() {
    let registry = Registry::new();
    let remote: atomflow::Atom<AsyncResult<i64, String>> =
        effect(|_ctx| Box::pin(async { Ok(42) })).serializable_result("remote2");

    assert_eq!(registry.get(&remote).unwrap().value(), Some(&42));
    registry.set_serializable("remote2", json!(2)).unwrap();
    assert_eq!(registry.get(&remote).unwrap().value(), Some(&2));
}

#[test]
fn test_dehydrate_with_captures_first_value() {
    let registry = Registry::new();
    let remote: atomflow::Atom<AsyncResult<i64, String>> = effect(|_ctx| {
        Box::pin(async {
            YieldOnce(false).await;
            Ok(33)
        })
    })
    .serializable_result("pending");

    // Mounted but not settled yet.
    let _subscription = registry.subscribe(&remote, || (), true).unwrap();
    let (entries, pending) = registry.dehydrate_with(true);
    assert_eq!(entries.len(), 1);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, "pending");

    registry.run_until_idle();
    let captured = futures::executor::block_on(
        pending.into_iter().next().map(|p| p.value).unwrap(),
    );
    assert_eq!(captured, json!(33));
}
