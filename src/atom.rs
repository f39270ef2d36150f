//! Atom descriptions: factory functions and combinators.
//!
//! Atoms are immutable configuration objects. They describe how to compute
//! a value (and optionally how to write one), but never store the value
//! themselves; the live state lives in a registry node. Every constructor
//! and combinator returns a fresh description with its own identity. Two
//! descriptions share a live node only when they carry the same
//! serializable key.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::internals::{
    launch_pull_step, launch_result_effect, launch_result_stream, Context, WriteContext,
};
use crate::reactivity::Key;
use crate::registry::Registry;
use crate::result::AsyncResult;
use crate::runtime::FiberHandle;
use crate::types::{next_atom_id, AtomId, AtomValue, NodeKey, ReadFn, RefreshFn, WriteFn};

// ----------------------------------------------------------------------
// Serializable facet
// ----------------------------------------------------------------------

/// Opt-in facet for dehydration/hydration.
///
/// Atoms carrying a facet are keyed by `key` instead of identity, so two
/// descriptions sharing a key share one live node.
pub struct Serializable<T> {
    pub key: Arc<str>,
    pub(crate) encode: Arc<dyn Fn(&T) -> serde_json::Value + Send + Sync>,
    pub(crate) decode:
        Arc<dyn Fn(&serde_json::Value) -> std::result::Result<T, String> + Send + Sync>,
    /// Staged values only overwrite a node still at its initial value.
    pub(crate) only_initial: bool,
    /// Recognizes values that have not produced anything yet; enables the
    /// first-value capture of the dehydration protocol.
    pub(crate) initial_probe: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
}

impl<T> Clone for Serializable<T> {
    fn clone(&self) -> Self {
        Serializable {
            key: self.key.clone(),
            encode: self.encode.clone(),
            decode: self.decode.clone(),
            only_initial: self.only_initial,
            initial_probe: self.initial_probe.clone(),
        }
    }
}

// ----------------------------------------------------------------------
// Atom
// ----------------------------------------------------------------------

struct AtomCore<T: AtomValue> {
    id: AtomId,
    read: ReadFn<T>,
    label: Option<String>,
    keep_alive: bool,
    lazy: bool,
    idle_ttl: Option<Duration>,
    refresh: Option<RefreshFn>,
    serializable: Option<Serializable<T>>,
}

/// Immutable description of a reactive computation.
pub struct Atom<T: AtomValue> {
    core: Arc<AtomCore<T>>,
}

impl<T: AtomValue> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Atom {
            core: self.core.clone(),
        }
    }
}

impl<T: AtomValue> Atom<T> {
    pub(crate) fn from_read(read: ReadFn<T>) -> Self {
        Atom {
            core: Arc::new(AtomCore {
                id: next_atom_id(),
                read,
                label: None,
                keep_alive: false,
                lazy: true,
                idle_ttl: None,
                refresh: None,
                serializable: None,
            }),
        }
    }

    /// Fresh description with this one's configuration, adjusted by `f`.
    fn modified(&self, f: impl FnOnce(&mut AtomCore<T>)) -> Atom<T> {
        let mut core = AtomCore {
            id: next_atom_id(),
            read: self.core.read.clone(),
            label: self.core.label.clone(),
            keep_alive: self.core.keep_alive,
            lazy: self.core.lazy,
            idle_ttl: self.core.idle_ttl,
            refresh: self.core.refresh.clone(),
            serializable: self.core.serializable.clone(),
        };
        f(&mut core);
        Atom {
            core: Arc::new(core),
        }
    }

    /// Non-owning handle; lets caches hold descriptions without keeping
    /// them alive.
    pub(crate) fn downgrade(&self) -> WeakAtom<T> {
        WeakAtom {
            core: Arc::downgrade(&self.core),
        }
    }

    pub fn id(&self) -> AtomId {
        self.core.id
    }

    pub fn label(&self) -> Option<&str> {
        self.core.label.as_deref()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.core.keep_alive
    }

    pub fn is_lazy(&self) -> bool {
        self.core.lazy
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        self.core.idle_ttl
    }

    /// Identity of this atom's live node in a registry.
    pub fn node_key(&self) -> NodeKey {
        match &self.core.serializable {
            Some(facet) => NodeKey::Serial(facet.key.clone()),
            None => NodeKey::Id(self.core.id),
        }
    }

    pub(crate) fn read_fn(&self) -> &ReadFn<T> {
        &self.core.read
    }

    pub(crate) fn refresh_fn(&self) -> Option<&RefreshFn> {
        self.core.refresh.as_ref()
    }

    pub(crate) fn serializable_facet(&self) -> Option<&Serializable<T>> {
        self.core.serializable.as_ref()
    }

    // ------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------

    pub fn with_label(&self, label: impl Into<String>) -> Atom<T> {
        let label = label.into();
        self.modified(|core| core.label = Some(label))
    }

    /// Keep the node alive even with no listeners or children.
    pub fn keep_alive(&self) -> Atom<T> {
        self.modified(|core| core.keep_alive = true)
    }

    /// Remove the node as soon as it becomes unobserved.
    pub fn auto_dispose(&self) -> Atom<T> {
        self.modified(|core| {
            core.keep_alive = false;
            core.idle_ttl = None;
        })
    }

    pub fn set_lazy(&self, lazy: bool) -> Atom<T> {
        self.modified(|core| core.lazy = lazy)
    }

    /// Keep the unobserved node around for `ttl` before removal. A finite
    /// ttl implies `keep_alive = false`; `Duration::MAX` means keep alive
    /// forever.
    pub fn set_idle_ttl(&self, ttl: Duration) -> Atom<T> {
        self.modified(|core| {
            if ttl == Duration::MAX {
                core.keep_alive = true;
                core.idle_ttl = None;
            } else {
                core.keep_alive = false;
                core.idle_ttl = Some(ttl);
            }
        })
    }

    pub fn with_refresh(
        &self,
        refresh: impl Fn(&Registry) -> Result<()> + Send + Sync + 'static,
    ) -> Atom<T> {
        let refresh: RefreshFn = Arc::new(refresh);
        self.modified(|core| core.refresh = Some(refresh))
    }

    /// Derive a new atom by a pure function of this one's value.
    pub fn map<U: AtomValue>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Atom<U> {
        let source = self.clone();
        Atom::from_read(Arc::new(move |ctx: &Context<U>| Ok(f(ctx.get(&source)?))))
    }

    /// Derive a new atom with full access to the evaluation context and
    /// this description.
    pub fn transform<U: AtomValue>(
        &self,
        f: impl Fn(&Context<U>, &Atom<T>) -> Result<U> + Send + Sync + 'static,
    ) -> Atom<U> {
        let source = self.clone();
        Atom::from_read(Arc::new(move |ctx: &Context<U>| f(ctx, &source)))
    }

    /// Suppress propagation until the source has been quiet for `window`.
    /// The first value passes through immediately; later changes publish
    /// on the trailing edge of the window.
    pub fn debounce(&self, window: Duration) -> Atom<T> {
        #[derive(Default)]
        struct DebounceSlot {
            timer: Option<crate::runtime::TimerKey>,
        }
        let source = self.clone();
        Atom::from_read(Arc::new(move |ctx: &Context<T>| {
            let value = ctx.get(&source)?;
            match ctx.self_value() {
                None => Ok(value),
                Some(current) if current == value => Ok(current),
                Some(current) => {
                    let registry = ctx.registry().clone();
                    let node = ctx.node_arc().clone();
                    if let Some(armed) =
                        node.with_slot(DebounceSlot::default, |slot| slot.timer.take())
                    {
                        registry.cancel_timer(armed);
                    }
                    let deadline = registry.clock().now() + window.as_millis() as u64;
                    let publish_node = node.clone();
                    let timer = registry.schedule_timer_at(
                        deadline,
                        Box::new(move || {
                            publish_node.with_slot(DebounceSlot::default, |slot| {
                                slot.timer = None;
                            });
                            publish_node.set_value(value);
                        }),
                    );
                    node.with_slot(DebounceSlot::default, |slot| slot.timer = Some(timer));
                    Ok(current)
                }
            }
        }))
    }

    /// Refresh this atom whenever one of `keys` is invalidated through the
    /// registry's reactivity service.
    pub fn with_reactivity(&self, keys: Vec<Key>) -> Atom<T> {
        let source = self.clone();
        Atom::from_read(Arc::new(move |ctx: &Context<T>| {
            let handler = ctx.invalidator();
            let registration = ctx
                .registry()
                .reactivity()
                .register_unsafe(&keys, Arc::new(move || handler()));
            ctx.add_finalizer(move || drop(registration))?;
            ctx.get(&source)
        }))
    }

    /// Refresh when the well-known focus key is invalidated. Hosts with a
    /// focus event feed it via
    /// `registry.reactivity().invalidate_unsafe(&[Key::text("focus")])`.
    pub fn refresh_on_focus(&self) -> Atom<T> {
        self.with_reactivity(vec![FOCUS_KEY.clone()])
    }
}

static FOCUS_KEY: Lazy<Key> = Lazy::new(|| Key::text("focus"));

impl<T: AtomValue + Serialize + DeserializeOwned> Atom<T> {
    /// Attach a serializable facet with serde-backed encode/decode. The
    /// atom's node is now keyed by `key`.
    pub fn serializable(&self, key: impl Into<String>) -> Atom<T> {
        let facet = Serializable {
            key: Arc::from(key.into()),
            encode: Arc::new(|value: &T| {
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
            }),
            decode: Arc::new(|encoded: &serde_json::Value| {
                serde_json::from_value(encoded.clone()).map_err(|e| e.to_string())
            }),
            only_initial: false,
            initial_probe: None,
        };
        self.modified(|core| core.serializable = Some(facet))
    }
}

/// Weak counterpart of [`Atom`], used by [`crate::utils::atom_family`].
pub(crate) struct WeakAtom<T: AtomValue> {
    core: std::sync::Weak<AtomCore<T>>,
}

impl<T: AtomValue> Clone for WeakAtom<T> {
    fn clone(&self) -> Self {
        WeakAtom {
            core: self.core.clone(),
        }
    }
}

impl<T: AtomValue> WeakAtom<T> {
    pub(crate) fn upgrade(&self) -> Option<Atom<T>> {
        self.core.upgrade().map(|core| Atom { core })
    }
}

impl<T: AtomValue> std::fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .field("keep_alive", &self.core.keep_alive)
            .field("lazy", &self.core.lazy)
            .finish()
    }
}

impl<T: AtomValue> std::fmt::Display for Atom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.core.label {
            Some(label) => write!(f, "{}:{}", self.node_key(), label),
            None => write!(f, "{}", self.node_key()),
        }
    }
}

// ----------------------------------------------------------------------
// Result-atom combinators
// ----------------------------------------------------------------------

impl<A: AtomValue, E: AtomValue> Atom<AsyncResult<A, E>> {
    /// Map only success values (including the carried previous success of
    /// failures).
    pub fn map_result<B: AtomValue>(
        &self,
        f: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Atom<AsyncResult<B, E>> {
        let source = self.clone();
        Atom::from_read(Arc::new(move |ctx: &Context<AsyncResult<B, E>>| {
            Ok(ctx.get(&source)?.map(&f))
        }))
    }

    /// Substitute `Initial` with the fallback's value, marked waiting.
    pub fn with_fallback(&self, fallback: &Atom<AsyncResult<A, E>>) -> Atom<AsyncResult<A, E>> {
        let source = self.clone();
        let fallback = fallback.clone();
        Atom::from_read(Arc::new(move |ctx: &Context<AsyncResult<A, E>>| {
            let current = ctx.get(&source)?;
            if current.is_initial() {
                Ok(ctx.get(&fallback)?.into_waiting())
            } else {
                Ok(current)
            }
        }))
    }
}

impl<A, E> Atom<AsyncResult<A, E>>
where
    A: AtomValue + Serialize + DeserializeOwned,
    E: AtomValue,
{
    /// Serializable facet for result atoms: only the success value is
    /// encoded; decoding hydrates to a success with timestamp zero.
    pub fn serializable_result(&self, key: impl Into<String>) -> Atom<AsyncResult<A, E>> {
        let facet = Serializable {
            key: Arc::from(key.into()),
            encode: Arc::new(|result: &AsyncResult<A, E>| match result.value() {
                Some(value) => serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                None => serde_json::Value::Null,
            }),
            decode: Arc::new(|encoded: &serde_json::Value| {
                serde_json::from_value::<A>(encoded.clone())
                    .map(|value| AsyncResult::success(value, 0))
                    .map_err(|e| e.to_string())
            }),
            only_initial: false,
            initial_probe: Some(Arc::new(|result: &AsyncResult<A, E>| result.is_initial())),
        };
        self.modified(|core| core.serializable = Some(facet))
    }

    /// Staged server values overwrite whatever the node holds.
    pub fn with_server_value(&self) -> Atom<AsyncResult<A, E>> {
        self.modified(|core| {
            if let Some(facet) = &mut core.serializable {
                facet.only_initial = false;
            }
        })
    }

    /// Staged server values only apply while the node is still `Initial`.
    pub fn with_server_value_initial(&self) -> Atom<AsyncResult<A, E>> {
        self.modified(|core| {
            if let Some(facet) = &mut core.serializable {
                facet.only_initial = true;
            }
        })
    }
}

// ----------------------------------------------------------------------
// WritableAtom
// ----------------------------------------------------------------------

/// An atom that additionally accepts writes of `W`.
pub struct WritableAtom<T: AtomValue, W: Send + Sync + 'static> {
    pub(crate) atom: Atom<T>,
    pub(crate) write: WriteFn<T, W>,
}

impl<T: AtomValue, W: Send + Sync + 'static> Clone for WritableAtom<T, W> {
    fn clone(&self) -> Self {
        WritableAtom {
            atom: self.atom.clone(),
            write: self.write.clone(),
        }
    }
}

impl<T: AtomValue, W: Send + Sync + 'static> WritableAtom<T, W> {
    pub fn as_atom(&self) -> &Atom<T> {
        &self.atom
    }

    pub fn id(&self) -> AtomId {
        self.atom.id()
    }

    pub fn label(&self) -> Option<&str> {
        self.atom.label()
    }

    pub(crate) fn write_fn(&self) -> &WriteFn<T, W> {
        &self.write
    }

    fn map_atom(&self, f: impl FnOnce(&Atom<T>) -> Atom<T>) -> WritableAtom<T, W> {
        WritableAtom {
            atom: f(&self.atom),
            write: self.write.clone(),
        }
    }

    pub fn with_label(&self, label: impl Into<String>) -> WritableAtom<T, W> {
        let label = label.into();
        self.map_atom(|atom| atom.with_label(label))
    }

    pub fn keep_alive(&self) -> WritableAtom<T, W> {
        self.map_atom(Atom::keep_alive)
    }

    pub fn auto_dispose(&self) -> WritableAtom<T, W> {
        self.map_atom(Atom::auto_dispose)
    }

    pub fn set_lazy(&self, lazy: bool) -> WritableAtom<T, W> {
        self.map_atom(|atom| atom.set_lazy(lazy))
    }

    pub fn set_idle_ttl(&self, ttl: Duration) -> WritableAtom<T, W> {
        self.map_atom(|atom| atom.set_idle_ttl(ttl))
    }

    pub fn with_reactivity(&self, keys: Vec<Key>) -> WritableAtom<T, W> {
        self.map_atom(|atom| atom.with_reactivity(keys))
    }
}

impl<T, W> WritableAtom<T, W>
where
    T: AtomValue + Serialize + DeserializeOwned,
    W: Send + Sync + 'static,
{
    pub fn serializable(&self, key: impl Into<String>) -> WritableAtom<T, W> {
        let key = key.into();
        self.map_atom(|atom| atom.serializable(key))
    }
}

impl<T: AtomValue, W: Send + Sync + 'static> std::fmt::Debug for WritableAtom<T, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableAtom")
            .field("id", &self.atom.id())
            .field("label", &self.atom.label())
            .finish()
    }
}

// ----------------------------------------------------------------------
// Factory functions
// ----------------------------------------------------------------------

/// Primitive writable cell.
pub fn state<T: AtomValue>(initial: T) -> WritableAtom<T, T> {
    let seed = initial;
    let read: ReadFn<T> = Arc::new(move |ctx: &Context<T>| {
        Ok(ctx.self_value().unwrap_or_else(|| seed.clone()))
    });
    let write: WriteFn<T, T> = Arc::new(|ctx: &WriteContext<T>, value: T| ctx.set_self(value));
    WritableAtom {
        atom: Atom::from_read(read),
        write,
    }
}

/// Constant readable atom.
pub fn value<T: AtomValue>(constant: T) -> Atom<T> {
    Atom::from_read(Arc::new(move |_ctx: &Context<T>| Ok(constant.clone())))
}

/// Pure derivation over other atoms.
pub fn readable<T: AtomValue>(
    read: impl Fn(&Context<T>) -> Result<T> + Send + Sync + 'static,
) -> Atom<T> {
    Atom::from_read(Arc::new(read))
}

pub fn readable_with_refresh<T: AtomValue>(
    read: impl Fn(&Context<T>) -> Result<T> + Send + Sync + 'static,
    refresh: impl Fn(&Registry) -> Result<()> + Send + Sync + 'static,
) -> Atom<T> {
    readable(read).with_refresh(refresh)
}

/// Derivation with custom write logic.
pub fn writable<T: AtomValue, W: Send + Sync + 'static>(
    read: impl Fn(&Context<T>) -> Result<T> + Send + Sync + 'static,
    write: impl Fn(&WriteContext<T>, W) -> Result<()> + Send + Sync + 'static,
) -> WritableAtom<T, W> {
    WritableAtom {
        atom: readable(read),
        write: Arc::new(write),
    }
}

pub fn writable_with_refresh<T: AtomValue, W: Send + Sync + 'static>(
    read: impl Fn(&Context<T>) -> Result<T> + Send + Sync + 'static,
    write: impl Fn(&WriteContext<T>, W) -> Result<()> + Send + Sync + 'static,
    refresh: impl Fn(&Registry) -> Result<()> + Send + Sync + 'static,
) -> WritableAtom<T, W> {
    WritableAtom {
        atom: readable(read).with_refresh(refresh),
        write: Arc::new(write),
    }
}

/// Atom backed by an effect future. Each evaluation forks the effect; the
/// node transitions through waiting into success or failure.
pub fn effect<A, E, F>(factory: F) -> Atom<AsyncResult<A, E>>
where
    A: AtomValue,
    E: AtomValue,
    F: Fn(&Context<AsyncResult<A, E>>) -> BoxFuture<'static, std::result::Result<A, E>>
        + Send
        + Sync
        + 'static,
{
    Atom::from_read(Arc::new(move |ctx: &Context<AsyncResult<A, E>>| {
        let future = factory(ctx);
        let (current, _handle) =
            launch_result_effect(ctx.registry(), ctx.node_arc(), ctx.lifetime_arc(), future)?;
        Ok(current)
    }))
}

/// Effect atom whose pre-completion value is a success with
/// `initial_value` instead of `Initial`.
pub fn effect_with<A, E, F>(factory: F, initial_value: A) -> Atom<AsyncResult<A, E>>
where
    A: AtomValue,
    E: AtomValue,
    F: Fn(&Context<AsyncResult<A, E>>) -> BoxFuture<'static, std::result::Result<A, E>>
        + Send
        + Sync
        + 'static,
{
    Atom::from_read(Arc::new(move |ctx: &Context<AsyncResult<A, E>>| {
        if ctx.self_value().is_none() {
            let now = ctx.registry().clock().now();
            ctx.node_arc()
                .seed(AsyncResult::success(initial_value.clone(), now));
        }
        let future = factory(ctx);
        let (current, _handle) =
            launch_result_effect(ctx.registry(), ctx.node_arc(), ctx.lifetime_arc(), future)?;
        Ok(current)
    }))
}

/// Atom driven by a stream: every chunk is a waiting success, closure
/// settles the last value, an empty stream fails with `NoElement`.
pub fn stream<A, E, F>(factory: F) -> Atom<AsyncResult<A, E>>
where
    A: AtomValue,
    E: AtomValue,
    F: Fn(&Context<AsyncResult<A, E>>) -> BoxStream<'static, std::result::Result<A, E>>
        + Send
        + Sync
        + 'static,
{
    Atom::from_read(Arc::new(move |ctx: &Context<AsyncResult<A, E>>| {
        let source = factory(ctx);
        launch_result_stream(ctx.registry(), ctx.node_arc(), ctx.lifetime_arc(), source)
    }))
}

pub fn stream_with<A, E, F>(factory: F, initial_value: A) -> Atom<AsyncResult<A, E>>
where
    A: AtomValue,
    E: AtomValue,
    F: Fn(&Context<AsyncResult<A, E>>) -> BoxStream<'static, std::result::Result<A, E>>
        + Send
        + Sync
        + 'static,
{
    Atom::from_read(Arc::new(move |ctx: &Context<AsyncResult<A, E>>| {
        if ctx.self_value().is_none() {
            let now = ctx.registry().clock().now();
            ctx.node_arc()
                .seed(AsyncResult::success(initial_value.clone(), now));
        }
        let source = factory(ctx);
        launch_result_stream(ctx.registry(), ctx.node_arc(), ctx.lifetime_arc(), source)
    }))
}

/// Atom mirroring an external ref: seeded with its current value, then
/// driven by its change stream.
pub fn subscription_ref<A, E, F>(initial: A, changes: F) -> Atom<AsyncResult<A, E>>
where
    A: AtomValue,
    E: AtomValue,
    F: Fn() -> BoxStream<'static, std::result::Result<A, E>> + Send + Sync + 'static,
{
    stream_with(move |_ctx| changes(), initial)
}

// ----------------------------------------------------------------------
// Function atoms
// ----------------------------------------------------------------------

/// Write values recognized by function-backed atoms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FnCall<Arg> {
    /// Invoke the function with an argument.
    Arg(Arg),
    /// Reset the atom to `Initial`, silently cancelling any run.
    Reset,
    /// Interrupt the running invocation; the atom reports an interrupted
    /// failure carrying the previous success.
    Interrupt,
}

/// Options for [`fn_atom_with`].
#[derive(Clone, Default)]
pub struct FnOptions {
    /// Run overlapping invocations side by side instead of interrupting
    /// the previous one.
    pub concurrent: bool,
    /// Reactivity keys that refresh this atom.
    pub reactivity_keys: Vec<Key>,
}

#[derive(Default)]
struct FnSlot {
    fibers: Vec<FiberHandle>,
}

/// Imperatively-driven effect atom: reading reports the latest result,
/// writing [`FnCall::Arg`] forks the function.
pub fn fn_atom<Arg, A, E, F>(f: F) -> WritableAtom<AsyncResult<A, E>, FnCall<Arg>>
where
    Arg: Send + Sync + 'static,
    A: AtomValue,
    E: AtomValue,
    F: Fn(Arg) -> BoxFuture<'static, std::result::Result<A, E>> + Send + Sync + 'static,
{
    fn_atom_with(f, FnOptions::default())
}

pub fn fn_atom_with<Arg, A, E, F>(
    f: F,
    options: FnOptions,
) -> WritableAtom<AsyncResult<A, E>, FnCall<Arg>>
where
    Arg: Send + Sync + 'static,
    A: AtomValue,
    E: AtomValue,
    F: Fn(Arg) -> BoxFuture<'static, std::result::Result<A, E>> + Send + Sync + 'static,
{
    let read: ReadFn<AsyncResult<A, E>> = Arc::new(|ctx: &Context<AsyncResult<A, E>>| {
        Ok(ctx.self_value().unwrap_or_else(AsyncResult::initial))
    });
    let run = Arc::new(f);
    let concurrent = options.concurrent;
    let write: WriteFn<AsyncResult<A, E>, FnCall<Arg>> = Arc::new(
        move |wctx: &WriteContext<AsyncResult<A, E>>, call: FnCall<Arg>| {
            let node = wctx.node_arc();
            match call {
                FnCall::Arg(arg) => {
                    if !concurrent {
                        // Replace the previous invocation without surfacing
                        // its interrupt; the new waiting value follows.
                        node.dispose_lifetime();
                        node.with_slot(FnSlot::default, |slot| slot.fibers.clear());
                    }
                    let future = (run)(arg);
                    let lifetime = node.current_lifetime();
                    let (_, handle) =
                        launch_result_effect(wctx.registry(), node, &lifetime, future)?;
                    node.with_slot(FnSlot::default, |slot| {
                        slot.fibers.retain(|fiber| !fiber.is_done());
                        slot.fibers.push(handle);
                    });
                    Ok(())
                }
                FnCall::Reset => {
                    node.dispose_lifetime();
                    node.with_slot(FnSlot::default, |slot| slot.fibers.clear());
                    wctx.set_self(AsyncResult::initial())
                }
                FnCall::Interrupt => {
                    let fibers = node.with_slot(FnSlot::default, |slot| {
                        std::mem::take(&mut slot.fibers)
                    });
                    for fiber in fibers {
                        fiber.interrupt();
                    }
                    Ok(())
                }
            }
        },
    );
    let writable = WritableAtom {
        atom: Atom::from_read(read),
        write,
    };
    if options.reactivity_keys.is_empty() {
        writable
    } else {
        writable.with_reactivity(options.reactivity_keys)
    }
}

/// Synchronous function atom: each write stores `f(arg)`.
pub fn fn_sync<Arg, A, F>(f: F) -> WritableAtom<Option<A>, Arg>
where
    Arg: Send + Sync + 'static,
    A: AtomValue,
    F: Fn(Arg) -> A + Send + Sync + 'static,
{
    let read: ReadFn<Option<A>> =
        Arc::new(|ctx: &Context<Option<A>>| Ok(ctx.self_value().unwrap_or(None)));
    let write: WriteFn<Option<A>, Arg> =
        Arc::new(move |wctx: &WriteContext<Option<A>>, arg: Arg| wctx.set_self(Some(f(arg))));
    WritableAtom {
        atom: Atom::from_read(read),
        write,
    }
}

pub fn fn_sync_with<Arg, A, F>(f: F, initial_value: A) -> WritableAtom<A, Arg>
where
    Arg: Send + Sync + 'static,
    A: AtomValue,
    F: Fn(Arg) -> A + Send + Sync + 'static,
{
    let seed = initial_value;
    let read: ReadFn<A> = Arc::new(move |ctx: &Context<A>| {
        Ok(ctx.self_value().unwrap_or_else(|| seed.clone()))
    });
    let write: WriteFn<A, Arg> =
        Arc::new(move |wctx: &WriteContext<A>, arg: Arg| wctx.set_self(f(arg)));
    WritableAtom {
        atom: Atom::from_read(read),
        write,
    }
}

// ----------------------------------------------------------------------
// Pull atoms
// ----------------------------------------------------------------------

/// One step of a pull atom: the items seen so far and whether the source
/// is exhausted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullChunk<A> {
    pub done: bool,
    pub items: Vec<A>,
}

#[derive(Clone, Copy, Default)]
pub struct PullOptions {
    /// Keep only the latest element instead of accumulating.
    pub disable_accumulation: bool,
}

/// Atom that pulls one element from a stream per demand. The first read
/// pulls the first element; each write of `()` pulls the next.
pub fn pull<A, E, F>(factory: F) -> WritableAtom<AsyncResult<PullChunk<A>, E>, ()>
where
    A: AtomValue,
    E: AtomValue,
    F: Fn() -> BoxStream<'static, std::result::Result<A, E>> + Send + Sync + 'static,
{
    pull_with(factory, PullOptions::default())
}

pub fn pull_with<A, E, F>(
    factory: F,
    options: PullOptions,
) -> WritableAtom<AsyncResult<PullChunk<A>, E>, ()>
where
    A: AtomValue,
    E: AtomValue,
    F: Fn() -> BoxStream<'static, std::result::Result<A, E>> + Send + Sync + 'static,
{
    let factory: Arc<dyn Fn() -> BoxStream<'static, std::result::Result<A, E>> + Send + Sync> =
        Arc::new(factory);
    let accumulate = !options.disable_accumulation;
    let read_factory = factory.clone();
    let read: ReadFn<AsyncResult<PullChunk<A>, E>> = Arc::new(
        move |ctx: &Context<AsyncResult<PullChunk<A>, E>>| match ctx.self_value() {
            Some(current) => Ok(current),
            None => launch_pull_step(
                ctx.registry(),
                ctx.node_arc(),
                ctx.lifetime_arc(),
                &read_factory,
                accumulate,
            ),
        },
    );
    let write_factory = factory;
    let write: WriteFn<AsyncResult<PullChunk<A>, E>, ()> = Arc::new(
        move |wctx: &WriteContext<AsyncResult<PullChunk<A>, E>>, _trigger: ()| {
            let lifetime = wctx.node_arc().current_lifetime();
            launch_pull_step(
                wctx.registry(),
                wctx.node_arc(),
                &lifetime,
                &write_factory,
                accumulate,
            )
            .map(|_| ())
        },
    );
    WritableAtom {
        atom: Atom::from_read(read),
        write,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_ids_are_unique() {
        let a = state(1);
        let b = state(1);
        let c = value(1);
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
    }

    #[test]
    fn test_combinators_produce_fresh_identities() {
        let base = value(0);
        let kept = base.keep_alive();
        assert_ne!(base.id(), kept.id());
        assert!(kept.is_keep_alive());
        assert!(!base.is_keep_alive());
        assert_ne!(base.node_key(), kept.node_key());
    }

    #[test]
    fn test_with_label() {
        let counter = state(0).with_label("counter");
        assert_eq!(counter.label(), Some("counter"));
        assert_eq!(counter.as_atom().label(), Some("counter"));
    }

    #[test]
    fn test_set_idle_ttl_controls_keep_alive() {
        let base = value(0).keep_alive();
        let timed = base.set_idle_ttl(Duration::from_millis(300));
        assert!(!timed.is_keep_alive());
        assert_eq!(timed.idle_ttl(), Some(Duration::from_millis(300)));

        let forever = base.set_idle_ttl(Duration::MAX);
        assert!(forever.is_keep_alive());
        assert_eq!(forever.idle_ttl(), None);
    }

    #[test]
    fn test_serializable_atoms_share_node_key() {
        let a = state(0i64).serializable("counter").as_atom().clone();
        let b = value(5i64).serializable("counter");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.node_key(), b.node_key());
        assert_eq!(a.node_key(), NodeKey::Serial(Arc::from("counter")));
    }

    #[test]
    fn test_display_uses_label() {
        let plain = value(1);
        assert!(plain.to_string().starts_with("atom"));
        let labeled = value(1).with_label("answer");
        assert!(labeled.to_string().ends_with(":answer"));
    }
}
