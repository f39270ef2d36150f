//! Internal live state: nodes, lifetimes, and evaluation contexts.
//!
//! A [`Node`] is the per-registry instantiation of an atom. It caches the
//! last computed value, tracks the nodes it read (`parents`) and the nodes
//! that read it (`children`), holds external listeners, and owns the
//! current evaluation's [`Lifetime`] of finalizers. Nodes are stored
//! type-erased behind [`AnyNode`] in the registry table and downcast back
//! at the typed entry points.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::atom::{Atom, PullChunk, WritableAtom};
use crate::error::{AtomError, Result};
use crate::registry::{Registry, RegistryInner};
use crate::result::{AsyncResult, Cause, Exit};
use crate::runtime::{self, FiberHandle};
use crate::types::{AtomValue, Listener, NodeKey};

/// Node state bitset.
pub(crate) mod flags {
    /// Cleared when the node is removed or the registry resets.
    pub const ALIVE: u8 = 1;
    /// Set once a value has been stored.
    pub const INITIALIZED: u8 = 2;
    /// Set while the cached value is stale and a (re-)evaluation is owed.
    pub const WAITING: u8 = 4;

    pub fn is_alive(state: u8) -> bool {
        state & ALIVE != 0
    }

    pub fn is_initialized(state: u8) -> bool {
        state & INITIALIZED != 0
    }

    pub fn is_waiting(state: u8) -> bool {
        state & WAITING != 0
    }
}

// ----------------------------------------------------------------------
// Lifetime
// ----------------------------------------------------------------------

/// Per-evaluation finalizer bag.
///
/// Finalizers run LIFO exactly once, on re-evaluation, invalidation, or
/// node removal. Running effects register their interrupt here, so
/// disposing a lifetime cancels them.
pub struct Lifetime {
    disposed: AtomicBool,
    finalizers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Lifetime {
    pub(crate) fn new() -> Self {
        Lifetime {
            disposed: AtomicBool::new(false),
            finalizers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn add(&self, finalizer: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.is_disposed() {
            return Err(AtomError::ContextDisposed);
        }
        self.finalizers.lock().push(Box::new(finalizer));
        Ok(())
    }

    /// Idempotent. Finalizers added while disposal runs are drained too.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let finalizer = self.finalizers.lock().pop();
            match finalizer {
                Some(finalizer) => finalizer(),
                None => break,
            }
        }
    }
}

// ----------------------------------------------------------------------
// Node
// ----------------------------------------------------------------------

struct NodeInner<T> {
    state: u8,
    value: Option<T>,
    parents: Vec<NodeKey>,
    previous_parents: Vec<NodeKey>,
    children: Vec<NodeKey>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    lifetime: Option<Arc<Lifetime>>,
    /// Bridge state (fiber handles, pull buffers, debounce holdbacks).
    slot: Option<Box<dyn Any + Send>>,
    skip_invalidation: bool,
    evaluating: bool,
}

/// Live mirror of an atom inside one registry.
pub(crate) struct Node<T: AtomValue> {
    key: NodeKey,
    atom: Atom<T>,
    registry: Weak<RegistryInner>,
    self_ref: Weak<Node<T>>,
    inner: Mutex<NodeInner<T>>,
}

impl<T: AtomValue> Node<T> {
    pub(crate) fn new(key: NodeKey, atom: Atom<T>, registry: Weak<RegistryInner>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Node {
            key,
            atom,
            registry,
            self_ref: self_ref.clone(),
            inner: Mutex::new(NodeInner {
                state: flags::ALIVE | flags::WAITING,
                value: None,
                parents: Vec::new(),
                previous_parents: Vec::new(),
                children: Vec::new(),
                listeners: Vec::new(),
                next_listener_id: 0,
                lifetime: None,
                slot: None,
                skip_invalidation: false,
                evaluating: false,
            }),
        })
    }

    pub(crate) fn key_ref(&self) -> &NodeKey {
        &self.key
    }

    fn registry_inner(&self) -> Result<Arc<RegistryInner>> {
        self.registry.upgrade().ok_or(AtomError::RegistryDisposed)
    }

    pub(crate) fn current_value(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    /// Return the cached value, (re-)evaluating first when stale.
    pub(crate) fn value(&self) -> Result<T> {
        {
            let inner = self.inner.lock();
            if !flags::is_alive(inner.state) {
                return Err(AtomError::RegistryDisposed);
            }
            if flags::is_initialized(inner.state) && !flags::is_waiting(inner.state) {
                if let Some(value) = &inner.value {
                    return Ok(value.clone());
                }
            }
            if inner.evaluating {
                return Err(AtomError::CircularDependency {
                    node: self.key.clone(),
                });
            }
        }
        self.evaluate()?;
        self.inner
            .lock()
            .value
            .clone()
            .ok_or_else(|| AtomError::read_error(self.key.clone(), "read produced no value"))
    }

    fn evaluate(&self) -> Result<()> {
        let registry = self.registry_inner()?;
        let Some(this) = self.self_ref.upgrade() else {
            return Err(AtomError::RegistryDisposed);
        };
        let old_lifetime = {
            let mut inner = self.inner.lock();
            if !flags::is_alive(inner.state) {
                return Err(AtomError::RegistryDisposed);
            }
            inner.evaluating = true;
            let previous = std::mem::take(&mut inner.parents);
            inner.previous_parents = previous;
            inner.lifetime.take()
        };
        if let Some(lifetime) = old_lifetime {
            lifetime.dispose();
        }
        let lifetime = Arc::new(Lifetime::new());
        self.inner.lock().lifetime = Some(lifetime.clone());
        let ctx = Context {
            registry: Registry::from_inner(registry.clone()),
            node: this,
            lifetime,
        };
        let outcome = (self.atom.read_fn())(&ctx);
        self.inner.lock().evaluating = false;
        match outcome {
            Ok(value) => {
                self.set_value(value);
                self.unlink_stale_parents(&registry);
                Ok(())
            }
            Err(error) => {
                // The node stays stale and retries on the next read. Keep
                // the previously-recorded edges so invalidation still
                // reaches us.
                let mut inner = self.inner.lock();
                let leftovers = std::mem::take(&mut inner.previous_parents);
                for key in leftovers {
                    if !inner.parents.contains(&key) {
                        inner.parents.push(key);
                    }
                }
                Err(error)
            }
        }
    }

    /// Store a value, suppressing equal writes, cascading invalidation to
    /// children, and notifying listeners (deferred while a batch collects).
    pub(crate) fn set_value(&self, value: T) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        enum Outcome {
            Unchanged,
            Stored { invalidate: bool },
        }
        let outcome = {
            let mut inner = self.inner.lock();
            if !flags::is_alive(inner.state) {
                return;
            }
            inner.state = (inner.state | flags::INITIALIZED) & !flags::WAITING;
            // Consume the deferral flag on every store: it records that the
            // children of the *pending* change were already invalidated.
            let skip = std::mem::replace(&mut inner.skip_invalidation, false);
            match &inner.value {
                Some(old) if *old == value => Outcome::Unchanged,
                None => {
                    inner.value = Some(value);
                    Outcome::Stored { invalidate: false }
                }
                _ => {
                    inner.value = Some(value);
                    Outcome::Stored { invalidate: !skip }
                }
            }
        };
        match outcome {
            Outcome::Unchanged => {}
            Outcome::Stored { invalidate } => {
                tracing::trace!(node = %self.key, "value stored");
                if invalidate {
                    self.invalidate_children(&registry);
                }
                if registry.in_collect_phase() {
                    registry.batch_note_changed(self.key.clone());
                } else {
                    self.notify_listeners();
                }
            }
        }
    }

    /// Seed a value without notification; used for hydration at node
    /// creation and for registry initial values.
    pub(crate) fn seed(&self, value: T) {
        let mut inner = self.inner.lock();
        if inner.value.is_none() {
            inner.value = Some(value);
            inner.state = (inner.state | flags::INITIALIZED) & !flags::WAITING;
        }
    }

    fn invalidate_children(&self, registry: &Arc<RegistryInner>) {
        let children: Vec<NodeKey> = self.inner.lock().children.clone();
        for key in children {
            if let Some(child) = registry.lookup_node(&key) {
                child.invalidate();
            }
        }
    }

    fn unlink_stale_parents(&self, registry: &Arc<RegistryInner>) {
        let stale: Vec<NodeKey> = std::mem::take(&mut self.inner.lock().previous_parents);
        for key in stale {
            if let Some(parent) = registry.lookup_node(&key) {
                parent.remove_child(&self.key);
                if parent.can_be_removed() {
                    registry.schedule_removal_check(key);
                }
            }
        }
    }

    pub(crate) fn record_parent(&self, key: &NodeKey) {
        let mut inner = self.inner.lock();
        if !inner.parents.contains(key) {
            inner.parents.push(key.clone());
        }
        inner.previous_parents.retain(|k| k != key);
    }

    pub(crate) fn link_child(&self, key: NodeKey) {
        let mut inner = self.inner.lock();
        if !inner.children.contains(&key) {
            inner.children.push(key);
        }
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: u64) {
        self.inner.lock().listeners.retain(|(lid, _)| *lid != id);
    }

    /// Dispose the current lifetime without marking the node stale.
    /// Interrupt exits raised by this teardown are swallowed, so the
    /// replaced computation vanishes silently.
    pub(crate) fn dispose_lifetime(&self) {
        let lifetime = self.inner.lock().lifetime.take();
        if let Some(lifetime) = lifetime {
            lifetime.dispose();
        }
    }

    /// The lifetime of the current evaluation frame, created on demand for
    /// imperative writes that land before any read.
    pub(crate) fn current_lifetime(&self) -> Arc<Lifetime> {
        let mut inner = self.inner.lock();
        match &inner.lifetime {
            Some(lifetime) => lifetime.clone(),
            None => {
                let lifetime = Arc::new(Lifetime::new());
                inner.lifetime = Some(lifetime.clone());
                lifetime
            }
        }
    }

    /// Run `f` against the node's typed bridge slot, initializing it (or
    /// replacing a slot of a different type) first. `f` runs under the
    /// node lock and must not call back into the graph.
    pub(crate) fn with_slot<S: Any + Send, R>(
        &self,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let mut inner = self.inner.lock();
        let fresh = match &inner.slot {
            Some(existing) => !existing.is::<S>(),
            None => true,
        };
        if fresh {
            inner.slot = Some(Box::new(init()));
        }
        match inner.slot.as_mut().and_then(|slot| slot.downcast_mut::<S>()) {
            Some(slot) => f(slot),
            None => unreachable!("slot was just initialized with this type"),
        }
    }

    fn should_defer(&self, registry: &Arc<RegistryInner>) -> bool {
        self.atom.is_lazy() && !self.has_listeners() && !self.has_active_descendant(registry)
    }

    fn has_active_descendant(&self, registry: &Arc<RegistryInner>) -> bool {
        let mut stack: Vec<NodeKey> = self.inner.lock().children.clone();
        let mut visited: HashSet<NodeKey> = HashSet::new();
        while let Some(key) = stack.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            let Some(node) = registry.lookup_node(&key) else {
                continue;
            };
            if !node.is_lazy() || node.has_listeners() {
                return true;
            }
            stack.extend(node.child_keys());
        }
        false
    }

    fn is_observed(&self, registry: &Arc<RegistryInner>) -> bool {
        !self.atom.is_lazy() || self.has_listeners() || self.has_active_descendant(registry)
    }

    fn rebuild_now(&self) {
        if let Err(error) = self.value() {
            tracing::debug!(node = %self.key, %error, "re-evaluation failed; node stays stale");
        }
    }
}

// ----------------------------------------------------------------------
// Type-erased node operations
// ----------------------------------------------------------------------

/// Untyped node operations used by the registry table, graph edges, and
/// the hydration protocol.
pub(crate) trait AnyNode: Send + Sync {
    fn key(&self) -> NodeKey;
    fn label(&self) -> Option<String>;
    fn state_flags(&self) -> u8;
    fn is_lazy(&self) -> bool;
    fn keep_alive(&self) -> bool;
    fn idle_ttl(&self) -> Option<Duration>;
    fn has_listeners(&self) -> bool;
    fn listener_count(&self) -> usize;
    fn child_count(&self) -> usize;
    fn child_keys(&self) -> Vec<NodeKey>;
    fn parent_keys(&self) -> Vec<NodeKey>;
    fn remove_child(&self, key: &NodeKey);
    fn can_be_removed(&self) -> bool;
    fn invalidate(&self);
    fn rebuild(&self);
    fn notify_listeners(&self);
    fn unsubscribe_listener(&self, id: u64);
    fn teardown(&self);
    fn encoded(&self) -> Option<(String, serde_json::Value)>;
    fn pending_encoded(self: Arc<Self>) -> Option<BoxFuture<'static, serde_json::Value>>;
    fn hydrate_staged(&self, encoded: &serde_json::Value) -> Result<()>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: AtomValue> AnyNode for Node<T> {
    fn key(&self) -> NodeKey {
        self.key.clone()
    }

    fn label(&self) -> Option<String> {
        self.atom.label().map(str::to_string)
    }

    fn state_flags(&self) -> u8 {
        self.inner.lock().state
    }

    fn is_lazy(&self) -> bool {
        self.atom.is_lazy()
    }

    fn keep_alive(&self) -> bool {
        self.atom.is_keep_alive()
    }

    fn idle_ttl(&self) -> Option<Duration> {
        self.atom.idle_ttl()
    }

    fn has_listeners(&self) -> bool {
        !self.inner.lock().listeners.is_empty()
    }

    fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    fn child_keys(&self) -> Vec<NodeKey> {
        self.inner.lock().children.clone()
    }

    fn parent_keys(&self) -> Vec<NodeKey> {
        self.inner.lock().parents.clone()
    }

    fn remove_child(&self, key: &NodeKey) {
        self.inner.lock().children.retain(|k| k != key);
    }

    fn can_be_removed(&self) -> bool {
        if self.atom.is_keep_alive() {
            return false;
        }
        let inner = self.inner.lock();
        flags::is_alive(inner.state) && inner.listeners.is_empty() && inner.children.is_empty()
    }

    /// Valid → stale transition. Disposes the current lifetime (cancelling
    /// any running effect), then either recomputes immediately, defers
    /// under the lazy rule, or hands off to the collecting batch.
    fn invalidate(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let lifetime = {
            let mut inner = self.inner.lock();
            if !flags::is_alive(inner.state)
                || !flags::is_initialized(inner.state)
                || flags::is_waiting(inner.state)
            {
                return;
            }
            inner.state |= flags::WAITING;
            inner.lifetime.take()
        };
        if let Some(lifetime) = lifetime {
            lifetime.dispose();
        }
        tracing::trace!(node = %self.key, "invalidated");
        if registry.in_collect_phase() {
            registry.batch_mark_stale(self.key.clone());
            return;
        }
        if self.should_defer(&registry) {
            self.inner.lock().skip_invalidation = true;
            self.invalidate_children(&registry);
        } else {
            self.rebuild_now();
        }
    }

    /// Batch-commit rebuild: parents first, then this node, observing the
    /// same lazy deferral rule as direct invalidation.
    fn rebuild(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        {
            let inner = self.inner.lock();
            if !flags::is_alive(inner.state) || !flags::is_waiting(inner.state) {
                return;
            }
        }
        for key in self.parent_keys() {
            if let Some(parent) = registry.lookup_node(&key) {
                parent.rebuild();
            }
        }
        if self.is_observed(&registry) {
            self.rebuild_now();
        } else {
            self.inner.lock().skip_invalidation = true;
            self.invalidate_children(&registry);
        }
    }

    fn unsubscribe_listener(&self, id: u64) {
        self.remove_listener(id);
    }

    fn notify_listeners(&self) {
        let listeners: Vec<Listener> = {
            let inner = self.inner.lock();
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener();
        }
    }

    fn teardown(&self) {
        let (lifetime, listeners) = {
            let mut inner = self.inner.lock();
            inner.state &= !flags::ALIVE;
            (
                inner.lifetime.take(),
                std::mem::take(&mut inner.listeners),
            )
        };
        drop(listeners);
        if let Some(lifetime) = lifetime {
            lifetime.dispose();
        }
        let mut inner = self.inner.lock();
        inner.slot = None;
        inner.children.clear();
        inner.parents.clear();
        inner.previous_parents.clear();
        inner.value = None;
    }

    fn encoded(&self) -> Option<(String, serde_json::Value)> {
        let facet = self.atom.serializable_facet()?;
        let value = self.inner.lock().value.clone()?;
        Some((facet.key.to_string(), (facet.encode)(&value)))
    }

    fn pending_encoded(self: Arc<Self>) -> Option<BoxFuture<'static, serde_json::Value>> {
        let facet = self.atom.serializable_facet()?.clone();
        let probe = facet.initial_probe.clone()?;
        {
            let inner = self.inner.lock();
            if let Some(value) = &inner.value {
                if !probe(value) {
                    return None;
                }
            }
        }
        let (tx, mut rx) = futures::channel::mpsc::unbounded::<()>();
        let id = self.add_listener(Arc::new(move || {
            let _ = tx.unbounded_send(());
        }));
        let node = self;
        Some(Box::pin(async move {
            loop {
                let ready = {
                    let inner = node.inner.lock();
                    match &inner.value {
                        Some(value) if !probe(value) => Some((facet.encode)(value)),
                        _ => None,
                    }
                };
                if let Some(encoded) = ready {
                    node.remove_listener(id);
                    return encoded;
                }
                if rx.next().await.is_none() {
                    node.remove_listener(id);
                    return serde_json::Value::Null;
                }
            }
        }))
    }

    fn hydrate_staged(&self, encoded: &serde_json::Value) -> Result<()> {
        let Some(facet) = self.atom.serializable_facet() else {
            return Ok(());
        };
        if facet.only_initial {
            if let (Some(probe), Some(current)) =
                (facet.initial_probe.as_ref(), self.current_value())
            {
                if !probe(&current) {
                    return Ok(());
                }
            }
        }
        let value = (facet.decode)(encoded)
            .map_err(|_| AtomError::type_mismatch::<T>(self.key.clone()))?;
        self.set_value(value);
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ----------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------

/// Capability object handed to an atom's read function for exactly one
/// evaluation frame. Tracked reads become parents of the evaluating node;
/// every method fails once the frame's lifetime is disposed.
pub struct Context<T: AtomValue> {
    registry: Registry,
    node: Arc<Node<T>>,
    lifetime: Arc<Lifetime>,
}

impl<T: AtomValue> Context<T> {
    fn guard(&self) -> Result<()> {
        if self.lifetime.is_disposed() {
            return Err(AtomError::ContextDisposed);
        }
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Tracked read: the atom becomes a parent of the evaluating node.
    pub fn get<U: AtomValue>(&self, atom: &Atom<U>) -> Result<U> {
        self.guard()?;
        let parent = self.registry.inner_ref().ensure_node(atom)?;
        if parent.key_ref() == &self.node.key {
            return Err(AtomError::CircularDependency {
                node: self.node.key.clone(),
            });
        }
        self.node.record_parent(parent.key_ref());
        parent.link_child(self.node.key.clone());
        parent.value()
    }

    /// Untracked read: observes the current value without subscribing.
    pub fn once<U: AtomValue>(&self, atom: &Atom<U>) -> Result<U> {
        self.guard()?;
        let node = self.registry.inner_ref().ensure_node(atom)?;
        node.value()
    }

    /// The value this node computed last time, if any.
    pub fn self_value(&self) -> Option<T> {
        self.node.current_value()
    }

    pub fn set_self(&self, value: T) -> Result<()> {
        self.guard()?;
        self.node.set_value(value);
        Ok(())
    }

    pub fn set<U: AtomValue, W: Send + Sync + 'static>(
        &self,
        atom: &WritableAtom<U, W>,
        value: W,
    ) -> Result<()> {
        self.guard()?;
        self.registry.set(atom, value)
    }

    pub fn refresh<U: AtomValue>(&self, atom: &Atom<U>) -> Result<()> {
        self.guard()?;
        self.registry.refresh(atom)
    }

    pub fn refresh_self(&self) -> Result<()> {
        self.guard()?;
        self.node.invalidate();
        Ok(())
    }

    /// A callback that invalidates this node from outside any evaluation
    /// frame. Used by reactivity handlers.
    pub fn invalidator(&self) -> impl Fn() + Send + Sync + Clone + 'static {
        let registry = Arc::downgrade(self.registry.inner_ref());
        let key = self.node.key.clone();
        move || {
            if let Some(registry) = registry.upgrade() {
                if let Some(node) = registry.lookup_node(&key) {
                    node.invalidate();
                }
            }
        }
    }

    /// Register a teardown callback on the current evaluation frame.
    pub fn add_finalizer(&self, finalizer: impl FnOnce() + Send + 'static) -> Result<()> {
        self.guard()?;
        self.lifetime.add(finalizer)
    }

    pub(crate) fn node_arc(&self) -> &Arc<Node<T>> {
        &self.node
    }

    pub(crate) fn lifetime_arc(&self) -> &Arc<Lifetime> {
        &self.lifetime
    }

    // ------------------------------------------------------------------
    // Effect projections
    // ------------------------------------------------------------------

    /// Tracked projection of an effect atom: resolves at its first
    /// non-initial result, success or failure.
    pub fn result_of<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
    ) -> Result<BoxFuture<'static, std::result::Result<A, Cause<E>>>> {
        let _ = self.get(atom)?;
        Ok(self.registry.result_future(atom, false))
    }

    /// Like [`result_of`](Self::result_of) without subscribing the
    /// evaluating node.
    pub fn result_once<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
    ) -> Result<BoxFuture<'static, std::result::Result<A, Cause<E>>>> {
        self.guard()?;
        Ok(self.registry.result_future(atom, false))
    }

    /// Tracked projection that waits for a success, riding out failures.
    pub fn some_of<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
    ) -> Result<BoxFuture<'static, std::result::Result<A, Cause<E>>>> {
        let _ = self.get(atom)?;
        Ok(self.registry.result_future(atom, true))
    }

    pub fn some_once<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
    ) -> Result<BoxFuture<'static, std::result::Result<A, Cause<E>>>> {
        self.guard()?;
        Ok(self.registry.result_future(atom, true))
    }

    /// Tracked projection of an atom's successive settled results.
    pub fn stream_result_of<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
    ) -> Result<BoxStream<'static, std::result::Result<A, Cause<E>>>> {
        let _ = self.get(atom)?;
        Ok(self.registry.result_stream(atom))
    }

    /// Tracked projection of an atom's successive success values; failures
    /// are skipped.
    pub fn stream_of<A: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<A, E>>,
    ) -> Result<BoxStream<'static, A>> {
        let _ = self.get(atom)?;
        let settled = self.registry.result_stream(atom);
        Ok(settled
            .filter_map(|result| async move { result.ok() })
            .boxed())
    }
}

// ----------------------------------------------------------------------
// WriteContext
// ----------------------------------------------------------------------

/// Capability object handed to a writable atom's write function.
///
/// Reads through a write context never register dependencies; writes land
/// exactly like registry writes.
pub struct WriteContext<T: AtomValue> {
    registry: Registry,
    node: Arc<Node<T>>,
}

impl<T: AtomValue> WriteContext<T> {
    pub(crate) fn new(registry: Registry, node: Arc<Node<T>>) -> Self {
        WriteContext { registry, node }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn get<U: AtomValue>(&self, atom: &Atom<U>) -> Result<U> {
        self.registry.get(atom)
    }

    pub fn get_self(&self) -> Result<T> {
        self.node.value()
    }

    pub fn set_self(&self, value: T) -> Result<()> {
        self.node.set_value(value);
        Ok(())
    }

    pub fn set<U: AtomValue, W: Send + Sync + 'static>(
        &self,
        atom: &WritableAtom<U, W>,
        value: W,
    ) -> Result<()> {
        self.registry.set(atom, value)
    }

    pub fn refresh<U: AtomValue>(&self, atom: &Atom<U>) -> Result<()> {
        self.registry.refresh(atom)
    }

    pub fn refresh_self(&self) -> Result<()> {
        self.node.invalidate();
        Ok(())
    }

    /// Register teardown on the node's current lifetime; it runs when the
    /// node is invalidated or removed.
    pub fn add_finalizer(&self, finalizer: impl FnOnce() + Send + 'static) -> Result<()> {
        self.node.current_lifetime().add(finalizer)
    }

    pub(crate) fn node_arc(&self) -> &Arc<Node<T>> {
        &self.node
    }
}

// ----------------------------------------------------------------------
// Effect / stream bridges
// ----------------------------------------------------------------------

/// Fork an effect future against a result node: publish the waiting
/// marker, bind the fiber's interrupt to the lifetime, and map the exit
/// into the node's [`AsyncResult`]. Returns the node's value as of this
/// call (final if the fiber completed on the synchronous flush) plus the
/// fiber handle.
pub(crate) fn launch_result_effect<A: AtomValue, E: AtomValue>(
    registry: &Registry,
    node: &Arc<Node<AsyncResult<A, E>>>,
    lifetime: &Arc<Lifetime>,
    future: BoxFuture<'static, std::result::Result<A, E>>,
) -> Result<(AsyncResult<A, E>, FiberHandle)> {
    let previous = node.current_value();
    let previous_success = previous.as_ref().and_then(|r| r.latest_success());
    let waiting = AsyncResult::waiting_from(previous);
    node.set_value(waiting.clone());

    let observer_node = node.clone();
    let observer_lifetime = lifetime.clone();
    let clock = registry.clock().clone();
    let handle = runtime::spawn(registry.inner_ref(), future, move |exit| {
        // An interrupt raised by the lifetime's own teardown is not an
        // observable transition; the node is being re-evaluated or removed.
        if matches!(exit, Exit::Failure(Cause::Interrupt)) && observer_lifetime.is_disposed() {
            return;
        }
        let result = AsyncResult::from_exit_with_previous(exit, previous_success, clock.now());
        observer_node.set_value(result);
    });
    {
        let interrupt = handle.clone();
        lifetime.add(move || interrupt.interrupt())?;
    }
    let current = node.current_value().unwrap_or(waiting);
    Ok((current, handle))
}

/// Drive a stream against a result node: every chunk publishes a waiting
/// success, closure settles to a non-waiting success, and an empty stream
/// fails with [`Cause::NoElement`].
pub(crate) fn launch_result_stream<A: AtomValue, E: AtomValue>(
    registry: &Registry,
    node: &Arc<Node<AsyncResult<A, E>>>,
    lifetime: &Arc<Lifetime>,
    stream: BoxStream<'static, std::result::Result<A, E>>,
) -> Result<AsyncResult<A, E>> {
    let previous = node.current_value();
    let waiting = AsyncResult::waiting_from(previous);
    node.set_value(waiting.clone());

    let driver_node = node.clone();
    let clock = registry.clock().clone();
    let driver: BoxFuture<'static, std::result::Result<(), E>> = Box::pin(async move {
        let mut stream = stream;
        let mut last: Option<A> = None;
        loop {
            match stream.next().await {
                Some(Ok(value)) => {
                    last = Some(value.clone());
                    driver_node.set_value(AsyncResult::success_waiting(value, clock.now()));
                }
                Some(Err(error)) => {
                    let previous =
                        driver_node.current_value().and_then(|r| r.latest_success());
                    driver_node
                        .set_value(AsyncResult::failure_with(Cause::Fail(error), previous));
                    return Ok(());
                }
                None => break,
            }
        }
        match last {
            Some(value) => driver_node.set_value(AsyncResult::success(value, clock.now())),
            None => driver_node.set_value(AsyncResult::failure(Cause::NoElement)),
        }
        Ok(())
    });

    let observer_node = node.clone();
    let observer_lifetime = lifetime.clone();
    let handle = runtime::spawn(registry.inner_ref(), driver, move |exit: Exit<(), E>| {
        if let Exit::Failure(cause) = exit {
            if cause.is_interrupt() && observer_lifetime.is_disposed() {
                return;
            }
            let previous = observer_node.current_value().and_then(|r| r.latest_success());
            observer_node.set_value(AsyncResult::failure_with(cause, previous));
        }
    });
    {
        let interrupt = handle.clone();
        lifetime.add(move || interrupt.interrupt())?;
    }
    Ok(node.current_value().unwrap_or(waiting))
}

/// Per-node state of a pull atom.
pub(crate) struct PullState<A, E> {
    stream: Option<BoxStream<'static, std::result::Result<A, E>>>,
    buffer: Vec<A>,
    finished: bool,
    pulling: bool,
}

impl<A, E> Default for PullState<A, E> {
    fn default() -> Self {
        PullState {
            stream: None,
            buffer: Vec::new(),
            finished: false,
            pulling: false,
        }
    }
}

/// Pull the next element on demand. Repeated triggers while a pull is in
/// flight, or after the stream finished, leave the node untouched.
pub(crate) fn launch_pull_step<A: AtomValue, E: AtomValue>(
    registry: &Registry,
    node: &Arc<Node<AsyncResult<PullChunk<A>, E>>>,
    lifetime: &Arc<Lifetime>,
    factory: &Arc<dyn Fn() -> BoxStream<'static, std::result::Result<A, E>> + Send + Sync>,
    accumulate: bool,
) -> Result<AsyncResult<PullChunk<A>, E>> {
    enum Step<S> {
        Skip,
        Pull(Option<S>),
    }
    let step = node.with_slot(PullState::<A, E>::default, |state| {
        if state.finished || state.pulling {
            Step::Skip
        } else {
            state.pulling = true;
            Step::Pull(state.stream.take())
        }
    });
    let parked = match step {
        Step::Skip => {
            return Ok(node
                .current_value()
                .unwrap_or_else(AsyncResult::initial_waiting))
        }
        Step::Pull(parked) => parked,
    };
    let stream = parked.unwrap_or_else(|| (factory)());

    let previous = node.current_value();
    let waiting = AsyncResult::waiting_from(previous);
    node.set_value(waiting.clone());

    let driver_node = node.clone();
    let clock = registry.clock().clone();
    let driver: BoxFuture<'static, std::result::Result<(), E>> = Box::pin(async move {
        let mut stream = stream;
        match stream.next().await {
            Some(Ok(value)) => {
                let chunk = driver_node.with_slot(PullState::<A, E>::default, |state| {
                    state.pulling = false;
                    state.stream = Some(stream);
                    if accumulate {
                        state.buffer.push(value);
                    } else {
                        state.buffer = vec![value];
                    }
                    PullChunk {
                        done: false,
                        items: state.buffer.clone(),
                    }
                });
                driver_node.set_value(AsyncResult::success(chunk, clock.now()));
            }
            Some(Err(error)) => {
                driver_node.with_slot(PullState::<A, E>::default, |state| {
                    state.pulling = false;
                    state.finished = true;
                });
                let previous = driver_node.current_value().and_then(|r| r.latest_success());
                driver_node.set_value(AsyncResult::failure_with(Cause::Fail(error), previous));
            }
            None => {
                let (empty, chunk) = driver_node.with_slot(PullState::<A, E>::default, |state| {
                    state.pulling = false;
                    state.finished = true;
                    (
                        state.buffer.is_empty(),
                        PullChunk {
                            done: true,
                            items: state.buffer.clone(),
                        },
                    )
                });
                if empty {
                    driver_node.set_value(AsyncResult::failure(Cause::NoElement));
                } else {
                    driver_node.set_value(AsyncResult::success(chunk, clock.now()));
                }
            }
        }
        Ok(())
    });

    let observer_node = node.clone();
    let observer_lifetime = lifetime.clone();
    let handle = runtime::spawn(registry.inner_ref(), driver, move |exit: Exit<(), E>| {
        if let Exit::Failure(cause) = exit {
            if cause.is_interrupt() && observer_lifetime.is_disposed() {
                return;
            }
            let previous = observer_node.current_value().and_then(|r| r.latest_success());
            observer_node.set_value(AsyncResult::failure_with(cause, previous));
        }
    });
    {
        let interrupt = handle.clone();
        lifetime.add(move || interrupt.interrupt())?;
    }
    Ok(node.current_value().unwrap_or(waiting))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_runs_finalizers_lifo() {
        let lifetime = Lifetime::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            lifetime.add(move || order.lock().push(tag)).unwrap();
        }
        lifetime.dispose();
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_lifetime_dispose_is_idempotent() {
        let lifetime = Lifetime::new();
        let count = Arc::new(Mutex::new(0));
        {
            let count = count.clone();
            lifetime.add(move || *count.lock() += 1).unwrap();
        }
        lifetime.dispose();
        lifetime.dispose();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_lifetime_rejects_after_dispose() {
        let lifetime = Lifetime::new();
        lifetime.dispose();
        assert_eq!(lifetime.add(|| ()), Err(AtomError::ContextDisposed));
    }

    #[test]
    fn test_flags() {
        let state = flags::ALIVE | flags::WAITING;
        assert!(flags::is_alive(state));
        assert!(flags::is_waiting(state));
        assert!(!flags::is_initialized(state));
    }
}
