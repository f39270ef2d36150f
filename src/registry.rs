//! The registry: container of live nodes and home of every entry point.
//!
//! All operations are synchronous and single-threaded. Effectful work and
//! deferred bookkeeping (removal re-checks, fiber re-polls, TTL sweeps,
//! debounce timers) are driven cooperatively through [`Registry::tick`] /
//! [`Registry::run_until_idle`], or handed to a host loop via the
//! `schedule_task` option.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::atom::{Atom, WritableAtom};
use crate::error::{AtomError, Result};
use crate::internals::{flags, AnyNode, Node, WriteContext};
use crate::reactivity::Reactivity;
use crate::result::{AsyncResult, Cause};
use crate::runtime::{
    Clock, DeferredQueue, Scheduler, TimerKey, Timers, DEFAULT_MAX_OPS_BEFORE_YIELD,
};
use crate::types::{AtomValue, NodeKey, Task, Timestamp};

// ----------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------

/// A typed seed applied before any read.
pub struct InitialValue {
    seed: Box<dyn FnOnce(&Registry) + Send>,
}

impl InitialValue {
    pub fn of<T: AtomValue>(atom: &Atom<T>, value: T) -> Self {
        let atom = atom.clone();
        InitialValue {
            seed: Box::new(move |registry| {
                if let Ok(node) = registry.inner.ensure_node(&atom) {
                    node.seed(value);
                }
            }),
        }
    }

    /// Stage an encoded value under a serializable key.
    pub fn serial(key: impl Into<String>, encoded: serde_json::Value) -> Self {
        let key = key.into();
        InitialValue {
            seed: Box::new(move |registry| {
                let _ = registry.set_serializable(&key, encoded);
            }),
        }
    }
}

/// Configuration consumed by [`Registry::with_options`].
pub struct RegistryOptions {
    /// Seeds consumed before any reads.
    pub initial_values: Vec<InitialValue>,
    /// Host-provided deferred-task primitive. Without one, deferred work
    /// waits for [`Registry::tick`].
    pub schedule_task: Option<Arc<dyn Fn(Task) + Send + Sync>>,
    /// Bucket granularity for idle-TTL eviction. Defaults to half the
    /// default idle TTL when one is set, else one second.
    pub timeout_resolution: Option<Duration>,
    /// Fallback idle TTL for atoms that do not declare their own.
    pub default_idle_ttl: Option<Duration>,
    /// Time source; defaults to the system clock.
    pub clock: Option<Clock>,
    /// Cooperative yield threshold of the sync scheduler.
    pub max_ops_before_yield: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        RegistryOptions {
            initial_values: Vec::new(),
            schedule_task: None,
            timeout_resolution: None,
            default_idle_ttl: None,
            clock: None,
            max_ops_before_yield: DEFAULT_MAX_OPS_BEFORE_YIELD,
        }
    }
}

// ----------------------------------------------------------------------
// Batch state
// ----------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BatchPhase {
    Disabled,
    Collect,
    Commit,
}

struct BatchState {
    phase: BatchPhase,
    depth: usize,
    stale: Vec<NodeKey>,
    notify: Vec<NodeKey>,
}

impl BatchState {
    fn new() -> Self {
        BatchState {
            phase: BatchPhase::Disabled,
            depth: 0,
            stale: Vec::new(),
            notify: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------
// Idle TTL buckets
// ----------------------------------------------------------------------

#[derive(Default)]
struct TtlState {
    buckets: BTreeMap<Timestamp, HashSet<NodeKey>>,
    node_bucket: HashMap<NodeKey, Timestamp>,
    node_deadline: HashMap<NodeKey, Timestamp>,
}

fn next_multiple_of(value: Timestamp, step: Timestamp) -> Timestamp {
    value.div_ceil(step.max(1)) * step.max(1)
}

// ----------------------------------------------------------------------
// RegistryInner
// ----------------------------------------------------------------------

pub(crate) struct RegistryInner {
    self_ref: Weak<RegistryInner>,
    nodes: DashMap<NodeKey, Arc<dyn AnyNode>>,
    preloaded: Mutex<HashMap<Arc<str>, serde_json::Value>>,
    batch: Mutex<BatchState>,
    scheduler: Scheduler,
    deferred: DeferredQueue,
    timers: Timers,
    clock: Clock,
    ttl: Mutex<TtlState>,
    reactivity: Reactivity,
    timeout_resolution: Duration,
    default_idle_ttl: Option<Duration>,
    disposed: AtomicBool,
}

impl RegistryInner {
    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn defer_task(&self, task: Task) {
        self.deferred.push(task);
    }

    pub(crate) fn lookup_node(&self, key: &NodeKey) -> Option<Arc<dyn AnyNode>> {
        self.nodes.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn in_collect_phase(&self) -> bool {
        self.batch.lock().phase == BatchPhase::Collect
    }

    pub(crate) fn batch_mark_stale(&self, key: NodeKey) {
        let mut batch = self.batch.lock();
        if !batch.stale.contains(&key) {
            batch.stale.push(key);
        }
    }

    pub(crate) fn batch_note_changed(&self, key: NodeKey) {
        let mut batch = self.batch.lock();
        if !batch.notify.contains(&key) {
            batch.notify.push(key);
        }
    }

    /// Find-or-create the typed node for an atom. Re-acquisition cancels
    /// any pending TTL eviction; creation consumes a staged encoded value
    /// for serializable atoms.
    pub(crate) fn ensure_node<T: AtomValue>(&self, atom: &Atom<T>) -> Result<Arc<Node<T>>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(AtomError::RegistryDisposed);
        }
        let key = atom.node_key();
        self.ttl_cancel(&key);
        if let Some(existing) = self.lookup_node(&key) {
            return existing
                .as_any_arc()
                .downcast::<Node<T>>()
                .map_err(|_| AtomError::type_mismatch::<T>(key));
        }
        let node = Node::new(key.clone(), atom.clone(), self.self_ref.clone());
        self.nodes.insert(key.clone(), node.clone());
        tracing::trace!(node = %key, "node created");
        if let NodeKey::Serial(serial) = &key {
            let staged = self.preloaded.lock().remove(serial);
            if let (Some(encoded), Some(facet)) = (staged, atom.serializable_facet()) {
                if let Ok(value) = (facet.decode)(&encoded) {
                    node.seed(value);
                }
            }
        }
        Ok(node)
    }

    /// A node is never removed on the spot; it is re-checked on the
    /// deferred queue, where TTL scheduling happens too.
    pub(crate) fn schedule_removal_check(&self, key: NodeKey) {
        let registry = self.self_ref.clone();
        self.deferred.push(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.removal_check(&key);
            }
        }));
    }

    fn removal_check(&self, key: &NodeKey) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let Some(node) = self.lookup_node(key) else {
            return;
        };
        if !node.can_be_removed() {
            return;
        }
        let ttl = node.idle_ttl().or(self.default_idle_ttl);
        match ttl {
            Some(ttl) if !ttl.is_zero() => self.ttl_schedule(key.clone(), ttl),
            _ => self.remove_node(key),
        }
    }

    fn remove_node(&self, key: &NodeKey) {
        let Some((_, node)) = self.nodes.remove(key) else {
            return;
        };
        tracing::debug!(node = %key, "node removed");
        self.ttl_cancel(key);
        let parents = node.parent_keys();
        node.teardown();
        for parent_key in parents {
            if let Some(parent) = self.lookup_node(&parent_key) {
                parent.remove_child(key);
                if parent.can_be_removed() {
                    self.schedule_removal_check(parent_key);
                }
            }
        }
    }

    fn ttl_schedule(&self, key: NodeKey, ttl: Duration) {
        let now = self.clock.now();
        let deadline = now.saturating_add(ttl.as_millis() as Timestamp);
        self.ttl_schedule_at(key, deadline);
    }

    fn ttl_schedule_at(&self, key: NodeKey, deadline: Timestamp) {
        let now = self.clock.now();
        if deadline <= now {
            self.remove_node(&key);
            return;
        }
        let resolution = (self.timeout_resolution.as_millis() as Timestamp).max(1);
        let mut state = self.ttl.lock();
        // A node already waiting keeps its earlier deadline.
        let deadline = match state.node_deadline.get(&key) {
            Some(existing) => deadline.min(*existing),
            None => deadline,
        };
        let bucket = next_multiple_of(deadline, resolution);
        if let Some(old_bucket) = state.node_bucket.insert(key.clone(), bucket) {
            if let Some(members) = state.buckets.get_mut(&old_bucket) {
                members.remove(&key);
                if members.is_empty() {
                    state.buckets.remove(&old_bucket);
                }
            }
        }
        state.node_deadline.insert(key.clone(), deadline);
        state.buckets.entry(bucket).or_default().insert(key.clone());
        tracing::trace!(node = %key, deadline, bucket, "idle ttl scheduled");
    }

    fn ttl_cancel(&self, key: &NodeKey) {
        let mut state = self.ttl.lock();
        if let Some(bucket) = state.node_bucket.remove(key) {
            if let Some(members) = state.buckets.get_mut(&bucket) {
                members.remove(key);
                if members.is_empty() {
                    state.buckets.remove(&bucket);
                }
            }
        }
        state.node_deadline.remove(key);
    }

    fn ttl_has_due(&self, now: Timestamp) -> bool {
        self.ttl
            .lock()
            .buckets
            .keys()
            .next()
            .is_some_and(|bucket| *bucket <= now)
    }

    fn ttl_sweep(&self, now: Timestamp) {
        loop {
            let due = {
                let mut state = self.ttl.lock();
                let next_bucket = state.buckets.keys().next().copied();
                match next_bucket {
                    Some(bucket) if bucket <= now => {
                        let members = state.buckets.remove(&bucket).unwrap_or_default();
                        for key in &members {
                            state.node_bucket.remove(key);
                        }
                        Some(members)
                    }
                    _ => None,
                }
            };
            let Some(members) = due else {
                break;
            };
            for key in members {
                let deadline = self.ttl.lock().node_deadline.remove(&key);
                let Some(node) = self.lookup_node(&key) else {
                    continue;
                };
                if !node.can_be_removed() {
                    continue;
                }
                match deadline {
                    // The bucket fired before the node's own deadline
                    // (rounding); re-park it for the residual window.
                    Some(deadline) if deadline > now => self.ttl_schedule_at(key, deadline),
                    _ => self.remove_node(&key),
                }
            }
        }
    }

    fn reset_internal(&self) {
        {
            let mut state = self.ttl.lock();
            state.buckets.clear();
            state.node_bucket.clear();
            state.node_deadline.clear();
        }
        {
            let mut batch = self.batch.lock();
            batch.stale.clear();
            batch.notify.clear();
        }
        let nodes: Vec<Arc<dyn AnyNode>> =
            self.nodes.iter().map(|entry| entry.value().clone()).collect();
        self.nodes.clear();
        for node in nodes {
            node.teardown();
        }
        self.preloaded.lock().clear();
        tracing::debug!("registry reset");
    }

    fn batch_exit(&self, commit: bool) {
        let outermost = {
            let mut batch = self.batch.lock();
            batch.depth = batch.depth.saturating_sub(1);
            batch.depth == 0
        };
        if !outermost {
            return;
        }
        if !commit {
            let mut batch = self.batch.lock();
            batch.phase = BatchPhase::Disabled;
            batch.stale.clear();
            batch.notify.clear();
            return;
        }
        self.commit_batch();
    }

    fn commit_batch(&self) {
        // Rebuild cascades can mark further nodes stale; drain until dry.
        loop {
            let stale: Vec<NodeKey> = {
                let mut batch = self.batch.lock();
                std::mem::take(&mut batch.stale)
            };
            if stale.is_empty() {
                break;
            }
            for key in stale {
                if let Some(node) = self.lookup_node(&key) {
                    node.rebuild();
                }
            }
        }
        let notify: Vec<NodeKey> = {
            let mut batch = self.batch.lock();
            batch.phase = BatchPhase::Commit;
            std::mem::take(&mut batch.notify)
        };
        for key in notify {
            if let Some(node) = self.lookup_node(&key) {
                node.notify_listeners();
            }
        }
        self.batch.lock().phase = BatchPhase::Disabled;
        tracing::debug!("batch committed");
    }
}

// ----------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------

/// Handle to a node registry. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_options(RegistryOptions::default())
    }

    pub fn with_options(options: RegistryOptions) -> Self {
        let clock = options.clock.unwrap_or_default();
        let timeout_resolution = options.timeout_resolution.unwrap_or_else(|| {
            options
                .default_idle_ttl
                .map(|ttl| (ttl / 2).max(Duration::from_millis(1)))
                .unwrap_or(Duration::from_secs(1))
        });
        let inner = Arc::new_cyclic(|self_ref| RegistryInner {
            self_ref: self_ref.clone(),
            nodes: DashMap::new(),
            preloaded: Mutex::new(HashMap::new()),
            batch: Mutex::new(BatchState::new()),
            scheduler: Scheduler::new(options.max_ops_before_yield),
            deferred: DeferredQueue::new(options.schedule_task),
            timers: Timers::new(),
            clock,
            ttl: Mutex::new(TtlState::default()),
            reactivity: Reactivity::new(),
            timeout_resolution,
            default_idle_ttl: options.default_idle_ttl,
            disposed: AtomicBool::new(false),
        });
        let registry = Registry { inner };
        for initial in options.initial_values {
            (initial.seed)(&registry);
        }
        registry
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Registry { inner }
    }

    pub(crate) fn inner_ref(&self) -> &Arc<RegistryInner> {
        &self.inner
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// The keyed pub-sub service owned by this registry.
    pub fn reactivity(&self) -> &Reactivity {
        &self.inner.reactivity
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(AtomError::RegistryDisposed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Read an atom's current value, evaluating lazily.
    pub fn get<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T> {
        self.ensure_not_disposed()?;
        let node = self.inner.ensure_node(atom)?;
        node.value()
    }

    /// Write through a writable atom's write function.
    pub fn set<T: AtomValue, W: Send + Sync + 'static>(
        &self,
        atom: &WritableAtom<T, W>,
        value: W,
    ) -> Result<()> {
        self.ensure_not_disposed()?;
        let node = self.inner.ensure_node(atom.as_atom())?;
        // Wire the node into the graph before writing.
        let _ = node.value();
        let ctx = WriteContext::new(self.clone(), node);
        (atom.write_fn())(&ctx, value)
    }

    /// `[ret, next] = f(current)`; write `next`, return `ret`.
    pub fn modify<T: AtomValue, W: Send + Sync + 'static, R>(
        &self,
        atom: &WritableAtom<T, W>,
        f: impl FnOnce(T) -> (R, W),
    ) -> Result<R> {
        let current = self.get(atom.as_atom())?;
        let (ret, next) = f(current);
        self.set(atom, next)?;
        Ok(ret)
    }

    pub fn update<T: AtomValue>(
        &self,
        atom: &WritableAtom<T, T>,
        f: impl FnOnce(T) -> T,
    ) -> Result<()> {
        let next = f(self.get(atom.as_atom())?);
        self.set(atom, next)
    }

    /// Invalidate an atom (and recompute it if observed), or run its
    /// custom refresh hook.
    pub fn refresh<T: AtomValue>(&self, atom: &Atom<T>) -> Result<()> {
        self.ensure_not_disposed()?;
        match atom.refresh_fn() {
            Some(refresh) => refresh(self),
            None => {
                if let Some(node) = self.inner.lookup_node(&atom.node_key()) {
                    node.invalidate();
                }
                Ok(())
            }
        }
    }

    /// Subscribe to value changes. The node is evaluated so the graph is
    /// wired; with `immediate` the listener also fires right away.
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe<T: AtomValue>(
        &self,
        atom: &Atom<T>,
        listener: impl Fn() + Send + Sync + 'static,
        immediate: bool,
    ) -> Result<Subscription> {
        self.ensure_not_disposed()?;
        let node = self.inner.ensure_node(atom)?;
        node.value()?;
        if immediate {
            listener();
        }
        let id = node.add_listener(Arc::new(listener));
        Ok(Subscription {
            registry: Arc::downgrade(&self.inner),
            key: node.key_ref().clone(),
            id,
            active: AtomicBool::new(true),
        })
    }

    /// Subscribe to a result atom, handing the listener the projected
    /// result on every change.
    pub fn subscribe_result<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
        listener: impl Fn(AsyncResult<A, E>) + Send + Sync + 'static,
        immediate: bool,
    ) -> Result<Subscription> {
        let registry = self.clone();
        let source = atom.clone();
        self.subscribe(
            atom,
            move || {
                if let Ok(result) = registry.get(&source) {
                    listener(result);
                }
            },
            immediate,
        )
    }

    /// Keep an atom mounted without observing it.
    pub fn mount<T: AtomValue>(&self, atom: &Atom<T>) -> Result<Subscription> {
        self.subscribe(atom, || (), true)
    }

    /// Stage an encoded value for a serializable key, or apply it right
    /// away when the node already exists.
    pub fn set_serializable(&self, key: &str, encoded: serde_json::Value) -> Result<()> {
        self.ensure_not_disposed()?;
        let serial: Arc<str> = Arc::from(key);
        match self.inner.lookup_node(&NodeKey::Serial(serial.clone())) {
            Some(node) => node.hydrate_staged(&encoded),
            None => {
                self.inner.preloaded.lock().insert(serial, encoded);
                Ok(())
            }
        }
    }

    /// Snapshot of every live node, for devtooling.
    pub fn get_nodes(&self) -> Vec<NodeSnapshot> {
        self.inner
            .nodes
            .iter()
            .map(|entry| {
                let node = entry.value();
                let state = node.state_flags();
                let status = if !flags::is_initialized(state) {
                    NodeStatus::Uninitialized
                } else if flags::is_waiting(state) {
                    NodeStatus::Stale
                } else {
                    NodeStatus::Valid
                };
                NodeSnapshot {
                    key: node.key(),
                    label: node.label(),
                    status,
                    listeners: node.listener_count(),
                    children: node.child_count(),
                }
            })
            .collect()
    }

    /// Run `f` with invalidations collected and notifications deferred:
    /// every stale node rebuilds once, listeners fire once at commit.
    /// Nested batches commit at the outermost boundary.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut batch = self.inner.batch.lock();
            batch.depth += 1;
            if batch.depth == 1 {
                batch.phase = BatchPhase::Collect;
            }
        }
        let guard = BatchGuard {
            inner: &self.inner,
            done: false,
        };
        let output = f();
        guard.complete();
        output
    }

    /// Clear all TTL state and remove every node.
    pub fn reset(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        self.inner.reset_internal();
        Ok(())
    }

    /// Reset and lock further access.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reset_internal();
        tracing::debug!("registry disposed");
    }

    // ------------------------------------------------------------------
    // Cooperative driving
    // ------------------------------------------------------------------

    /// One cooperative turn: flush leftover sync work, run deferred tasks,
    /// fire due timers, sweep due TTL buckets.
    pub fn tick(&self) {
        if self.is_disposed() {
            return;
        }
        self.inner.scheduler.flush();
        for task in self.inner.deferred.drain() {
            task();
        }
        let now = self.inner.clock.now();
        for task in self.inner.timers.fire_due(now) {
            task();
        }
        self.inner.ttl_sweep(now);
    }

    /// Tick until no runnable work remains. Timers and TTL buckets with
    /// future deadlines do not count as runnable.
    pub fn run_until_idle(&self) {
        for _ in 0..10_000 {
            if self.is_disposed() {
                return;
            }
            let now = self.inner.clock.now();
            let pending = !self.inner.scheduler.is_empty()
                || !self.inner.deferred.is_empty()
                || self.inner.timers.has_due(now)
                || self.inner.ttl_has_due(now);
            if !pending {
                return;
            }
            self.tick();
        }
    }

    // ------------------------------------------------------------------
    // Dehydration / hydration
    // ------------------------------------------------------------------

    /// Encode the current value of every serializable node.
    pub fn dehydrate(&self) -> Vec<DehydratedAtom> {
        let now = self.inner.clock.now();
        self.inner
            .nodes
            .iter()
            .filter_map(|entry| entry.value().encoded())
            .map(|(key, value)| DehydratedAtom {
                key,
                value,
                dehydrated_at: now,
            })
            .collect()
    }

    /// Like [`dehydrate`](Self::dehydrate), additionally capturing, for
    /// serializable nodes still at `Initial`, a future resolving to the
    /// first non-initial value.
    pub fn dehydrate_with(&self, capture_pending: bool) -> (Vec<DehydratedAtom>, Vec<PendingValue>) {
        let entries = self.dehydrate();
        let mut pending = Vec::new();
        if capture_pending {
            let nodes: Vec<Arc<dyn AnyNode>> = self
                .inner
                .nodes
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for node in nodes {
                if let NodeKey::Serial(serial) = node.key() {
                    if let Some(future) = node.pending_encoded() {
                        pending.push(PendingValue {
                            key: serial.to_string(),
                            value: future,
                        });
                    }
                }
            }
        }
        (entries, pending)
    }

    /// Feed dehydrated entries back through [`Self::set_serializable`].
    pub fn hydrate(&self, entries: impl IntoIterator<Item = DehydratedAtom>) -> Result<()> {
        for entry in entries {
            self.set_serializable(&entry.key, entry.value)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal services
    // ------------------------------------------------------------------

    pub(crate) fn schedule_timer_at(&self, deadline: Timestamp, task: Task) -> TimerKey {
        self.inner.timers.schedule_at(deadline, task)
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        self.inner.timers.cancel(key);
    }

    /// Future resolving at an atom's first settled result: a success, or
    /// (unless `success_only`) a failure cause.
    pub(crate) fn result_future<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
        success_only: bool,
    ) -> BoxFuture<'static, std::result::Result<A, Cause<E>>> {
        let registry = self.clone();
        let atom = atom.clone();
        Box::pin(async move {
            let (tx, mut rx) = futures::channel::mpsc::unbounded::<()>();
            let subscription = match registry.subscribe(
                &atom,
                move || {
                    let _ = tx.unbounded_send(());
                },
                false,
            ) {
                Ok(subscription) => subscription,
                Err(error) => return Err(Cause::Die(error.to_string())),
            };
            let outcome = loop {
                match registry.get(&atom) {
                    Ok(AsyncResult::Success { value, .. }) => break Ok(value),
                    Ok(AsyncResult::Failure { cause, .. }) if !success_only => break Err(cause),
                    Ok(_) => {}
                    Err(error) => break Err(Cause::Die(error.to_string())),
                }
                if rx.next().await.is_none() {
                    break Err(Cause::Interrupt);
                }
            };
            drop(subscription);
            outcome
        })
    }

    /// Stream of an atom's successive settled results, deduplicating
    /// unchanged values. The stream ends if the registry is disposed.
    pub(crate) fn result_stream<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
    ) -> futures::stream::BoxStream<'static, std::result::Result<A, Cause<E>>> {
        struct StreamState<A: AtomValue, E: AtomValue> {
            registry: Registry,
            atom: Atom<AsyncResult<A, E>>,
            rx: futures::channel::mpsc::UnboundedReceiver<()>,
            _subscription: Option<Subscription>,
            last: Option<AsyncResult<A, E>>,
        }

        let (tx, rx) = futures::channel::mpsc::unbounded::<()>();
        let subscription = self
            .subscribe(
                atom,
                move || {
                    let _ = tx.unbounded_send(());
                },
                false,
            )
            .ok();
        let state = StreamState {
            registry: self.clone(),
            atom: atom.clone(),
            rx,
            _subscription: subscription,
            last: None,
        };
        futures::stream::unfold(state, |mut state| async move {
            loop {
                let current = match state.registry.get(&state.atom) {
                    Ok(result) => result,
                    Err(_) => return None,
                };
                let settled = match &current {
                    AsyncResult::Success { value, .. } => Some(Ok(value.clone())),
                    AsyncResult::Failure { cause, .. } => Some(Err(cause.clone())),
                    AsyncResult::Initial { .. } => None,
                };
                if let Some(item) = settled {
                    if state.last.as_ref() != Some(&current) {
                        state.last = Some(current);
                        return Some((item, state));
                    }
                }
                state.rx.next().await?;
            }
        })
        .boxed()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("nodes", &self.inner.nodes.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

struct BatchGuard<'a> {
    inner: &'a Arc<RegistryInner>,
    done: bool,
}

impl BatchGuard<'_> {
    fn complete(mut self) {
        self.done = true;
        self.inner.batch_exit(true);
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            // Unwinding out of a batch: abandon the collect phase cleanly.
            self.inner.batch_exit(false);
        }
    }
}

// ----------------------------------------------------------------------
// Subscriptions & snapshots
// ----------------------------------------------------------------------

/// Handle returned by [`Registry::subscribe`]. Unsubscribes on drop; when
/// the node becomes removable it is re-checked on the next tick.
pub struct Subscription {
    registry: Weak<RegistryInner>,
    key: NodeKey,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn release(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Some(node) = registry.lookup_node(&self.key) {
            node.unsubscribe_listener(self.id);
            if node.can_be_removed() {
                registry.schedule_removal_check(self.key.clone());
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeStatus {
    Uninitialized,
    Stale,
    Valid,
}

/// Devtooling view of one live node.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub key: NodeKey,
    pub label: Option<String>,
    pub status: NodeStatus,
    pub listeners: usize,
    pub children: usize,
}

/// One serializable node's encoded state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehydratedAtom {
    pub key: String,
    pub value: serde_json::Value,
    pub dehydrated_at: Timestamp,
}

/// First-value capture for a node that was still `Initial` at dehydration
/// time.
pub struct PendingValue {
    pub key: String,
    pub value: BoxFuture<'static, serde_json::Value>,
}
