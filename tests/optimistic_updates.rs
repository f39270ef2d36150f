//! Optimistic writes: forwarded transitions, base suppression, revert and
//! refresh after the burst drains.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use atomflow::{optimistic, optimistic_fn, state, AsyncResult, Registry};

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

type IntResult = AsyncResult<i32, String>;

#[test]
fn test_optimistic_mirrors_base_when_idle() {
    let registry = Registry::new();
    let base = state(IntResult::success(1, 0));
    let mirror = optimistic(base.as_atom());

    assert_eq!(registry.get(mirror.as_atom()).unwrap().value(), Some(&1));

    registry.set(&base, IntResult::success(2, 1)).unwrap();
    assert_eq!(registry.get(mirror.as_atom()).unwrap().value(), Some(&2));
}

#[test]
fn test_optimistic_fn_shows_reduced_value_then_reverts() {
    let registry = Registry::new();
    let base = state(IntResult::success(1, 0));
    let mirror = optimistic(base.as_atom());
    let add = optimistic_fn(
        &mirror,
        |current: &IntResult, delta: &i32| current.value().copied().unwrap_or(0) + delta,
        |delta| {
            Box::pin(async move {
                YieldOnce(false).await;
                Ok(100 + delta)
            })
        },
    );

    registry.set(&add, 5).unwrap();
    // The reduced optimistic value is visible while the work runs.
    assert_eq!(registry.get(mirror.as_atom()).unwrap().value(), Some(&6));

    registry.run_until_idle();
    // Burst drained: the mirror reverted to the (refreshed) base.
    assert_eq!(registry.get(mirror.as_atom()).unwrap().value(), Some(&1));
}

#[test]
fn test_optimistic_failure_surfaces_then_reverts() {
    let registry = Registry::new();
    let base = state(IntResult::success(1, 0));
    let mirror = optimistic(base.as_atom());
    let failing = optimistic_fn(
        &mirror,
        |current: &IntResult, delta: &i32| current.value().copied().unwrap_or(0) + delta,
        |_delta| {
            Box::pin(async move {
                YieldOnce(false).await;
                Err("rejected".to_string())
            })
        },
    );

    let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = log.clone();
    let _subscription = registry
        .subscribe_result(
            mirror.as_atom(),
            move |result: IntResult| sink.lock().unwrap().push(result),
            false,
        )
        .unwrap();

    registry.set(&failing, 5).unwrap();
    registry.run_until_idle();

    let log = log.lock().unwrap();
    // Optimistic value first, then the surfaced failure, then the revert.
    assert!(log.iter().any(|r| r.is_success() && r.value() == Some(&6)));
    assert!(log.iter().any(|r| r.error() == Some(&"rejected".to_string())));
    assert_eq!(
        registry.get(mirror.as_atom()).unwrap().value(),
        Some(&1)
    );
}

#[test]
fn test_base_updates_ignored_while_in_flight() {
    let registry = Registry::new();
    let base = state(IntResult::success(1, 0));
    let mirror = optimistic(base.as_atom());
    let add = optimistic_fn(
        &mirror,
        |current: &IntResult, delta: &i32| current.value().copied().unwrap_or(0) + delta,
        |delta| {
            Box::pin(async move {
                YieldOnce(false).await;
                Ok(delta)
            })
        },
    );

    registry.set(&add, 5).unwrap();
    // A base update during the burst does not disturb the optimistic view.
    registry.set(&base, IntResult::success(50, 2)).unwrap();
    assert_eq!(registry.get(mirror.as_atom()).unwrap().value(), Some(&6));

    registry.run_until_idle();
    // After the burst the mirror follows the base again.
    assert_eq!(registry.get(mirror.as_atom()).unwrap().value(), Some(&50));
}
