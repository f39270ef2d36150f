//! Optimistic update combinators.
//!
//! An optimistic atom mirrors a base result atom, but accepts *transition
//! atoms* as writes. While transitions are in flight their values are
//! forwarded into the mirror and base updates are ignored; once the burst
//! drains the mirror reverts to the base, refreshing it first if any
//! transition completed successfully. A transition failure is surfaced
//! and the remaining transitions keep running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::atom::{stream as stream_atom, Atom, WritableAtom};
use crate::internals::{AnyNode, Context, Node, WriteContext};
use crate::registry::{Registry, Subscription};
use crate::result::AsyncResult;
use crate::types::{AtomValue, ReadFn, WriteFn};

#[derive(Default)]
struct OptimisticSlot {
    inflight: usize,
    needs_refresh: bool,
    subscriptions: Vec<Subscription>,
}

fn settle<A: AtomValue, E: AtomValue>(
    node: &Arc<Node<AsyncResult<A, E>>>,
    registry: &Registry,
    base: &Atom<AsyncResult<A, E>>,
    completed: bool,
) {
    let (drained, needs_refresh, subscriptions) =
        node.with_slot(OptimisticSlot::default, |slot| {
            slot.inflight = slot.inflight.saturating_sub(1);
            if completed {
                slot.needs_refresh = true;
            }
            if slot.inflight == 0 {
                (
                    true,
                    std::mem::take(&mut slot.needs_refresh),
                    std::mem::take(&mut slot.subscriptions),
                )
            } else {
                (false, false, Vec::new())
            }
        });
    if !drained {
        return;
    }
    drop(subscriptions);
    if needs_refresh {
        let _ = registry.refresh(base);
    }
    // Revert to the base atom's latest value.
    node.invalidate();
}

/// Writable mirror of `base` that applies transition atoms optimistically.
pub fn optimistic<A: AtomValue, E: AtomValue>(
    base: &Atom<AsyncResult<A, E>>,
) -> WritableAtom<AsyncResult<A, E>, Atom<AsyncResult<A, E>>> {
    let read_base = base.clone();
    let read: ReadFn<AsyncResult<A, E>> = Arc::new(move |ctx: &Context<AsyncResult<A, E>>| {
        let busy = ctx
            .node_arc()
            .with_slot(OptimisticSlot::default, |slot| slot.inflight > 0);
        let base_value = ctx.get(&read_base)?;
        if busy {
            // The base stays observed, but its updates are ignored until
            // the transition burst drains.
            Ok(ctx.self_value().unwrap_or_else(AsyncResult::initial))
        } else {
            Ok(base_value)
        }
    });

    let write_base = base.clone();
    let write: WriteFn<AsyncResult<A, E>, Atom<AsyncResult<A, E>>> = Arc::new(
        move |wctx: &WriteContext<AsyncResult<A, E>>, transition: Atom<AsyncResult<A, E>>| {
            let node = wctx.node_arc().clone();
            let registry = wctx.registry().clone();
            node.with_slot(OptimisticSlot::default, |slot| slot.inflight += 1);

            let seen_final = Arc::new(AtomicBool::new(false));
            let listener_final = seen_final.clone();
            let listener_node = node.clone();
            let listener_registry = registry.clone();
            let listener_transition = transition.clone();
            let listener_base = write_base.clone();
            let subscription = registry.subscribe(
                &transition,
                move || {
                    let Ok(result) = listener_registry.get(&listener_transition) else {
                        return;
                    };
                    match &result {
                        AsyncResult::Initial { .. } => {}
                        AsyncResult::Success { waiting: true, .. } => {
                            // In-flight optimistic value.
                            listener_node.set_value(result);
                        }
                        AsyncResult::Success { waiting: false, .. } => {
                            if listener_final.swap(true, Ordering::AcqRel) {
                                return;
                            }
                            listener_node.set_value(result);
                            settle(&listener_node, &listener_registry, &listener_base, true);
                        }
                        AsyncResult::Failure { .. } => {
                            if listener_final.swap(true, Ordering::AcqRel) {
                                return;
                            }
                            listener_node.set_value(result);
                            settle(&listener_node, &listener_registry, &listener_base, false);
                        }
                    }
                },
                true,
            )?;
            if seen_final.load(Ordering::Acquire) {
                // The transition settled synchronously during subscribe.
                drop(subscription);
            } else {
                node.with_slot(OptimisticSlot::default, |slot| {
                    slot.subscriptions.push(subscription)
                });
            }
            Ok(())
        },
    );

    WritableAtom {
        atom: Atom::from_read(read),
        write,
    }
}

/// Function-shaped optimistic updates: each call reduces the current
/// value into an optimistic one, pushes it through a hidden transition
/// atom, and delegates the real work to `run`.
pub fn optimistic_fn<Arg, A, E, R, F>(
    target: &WritableAtom<AsyncResult<A, E>, Atom<AsyncResult<A, E>>>,
    reducer: R,
    run: F,
) -> WritableAtom<AsyncResult<A, E>, Arg>
where
    Arg: Send + Sync + 'static,
    A: AtomValue,
    E: AtomValue,
    R: Fn(&AsyncResult<A, E>, &Arg) -> A + Send + Sync + 'static,
    F: Fn(Arg) -> BoxFuture<'static, std::result::Result<A, E>> + Send + Sync + 'static,
{
    let read_target = target.as_atom().clone();
    let read: ReadFn<AsyncResult<A, E>> =
        Arc::new(move |ctx: &Context<AsyncResult<A, E>>| ctx.get(&read_target));

    let write_target = target.clone();
    let reducer = Arc::new(reducer);
    let run = Arc::new(run);
    let write: WriteFn<AsyncResult<A, E>, Arg> =
        Arc::new(move |wctx: &WriteContext<AsyncResult<A, E>>, arg: Arg| {
            let current = wctx.get(write_target.as_atom())?;
            let optimistic_value = reducer(&current, &arg);
            let future = run(arg);
            let payload = Arc::new(Mutex::new(Some((optimistic_value, future))));
            let transition = stream_atom(move |_ctx: &Context<AsyncResult<A, E>>| {
                match payload.lock().take() {
                    Some((optimistic_value, future)) => {
                        futures::stream::once(async move { Ok(optimistic_value) })
                            .chain(futures::stream::once(future))
                            .boxed()
                    }
                    None => futures::stream::empty().boxed(),
                }
            });
            wctx.set(&write_target, transition)
        });

    WritableAtom {
        atom: Atom::from_read(read),
        write,
    }
}
