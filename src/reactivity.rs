//! Keyed pub-sub for external invalidation.
//!
//! The reactivity service maps hashed keys to handler sets. External
//! events (a mutation landing on the server, a cache purge, a window
//! regaining focus) invalidate keys; atoms opt in through
//! [`crate::Atom::with_reactivity`] and refresh when their keys fire.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;

use std::future::Future;

use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;

/// A reactivity key.
///
/// Strings, integers and booleans reduce to their text/decimal form
/// before hashing, so `Key::int(1)` and `Key::text("1")` address the same
/// handler set. Domain records address one handler set per id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Text(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Record { domain: String, id: String },
}

impl Key {
    pub fn text(text: impl Into<String>) -> Key {
        Key::Text(text.into())
    }

    pub fn int(value: i64) -> Key {
        Key::Int(value)
    }

    pub fn uint(value: u64) -> Key {
        Key::UInt(value)
    }

    pub fn record(domain: impl Into<String>, id: impl ToString) -> Key {
        Key::Record {
            domain: domain.into(),
            id: id.to_string(),
        }
    }

    /// Expand a `{ domain: [ids…] }` record into one key per id.
    pub fn domain(domain: impl Into<String>, ids: impl IntoIterator<Item = impl ToString>) -> Vec<Key> {
        let domain = domain.into();
        ids.into_iter()
            .map(|id| Key::Record {
                domain: domain.clone(),
                id: id.to_string(),
            })
            .collect()
    }

    fn canonical(&self) -> String {
        match self {
            Key::Text(text) => text.clone(),
            Key::Int(value) => value.to_string(),
            Key::UInt(value) => value.to_string(),
            Key::Bool(value) => value.to_string(),
            Key::Record { domain, id } => format!("{domain}::{id}"),
        }
    }

    pub(crate) fn hash_value(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.canonical().hash(&mut hasher);
        hasher.finish()
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Self {
        Key::text(text)
    }
}

impl From<String> for Key {
    fn from(text: String) -> Self {
        Key::Text(text)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Key::Bool(value)
    }
}

type Handler = Arc<dyn Fn() + Send + Sync>;

struct ReactivityInner {
    handlers: Mutex<HashMap<u64, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

/// The keyed pub-sub service. One instance per registry; handlers are
/// invoked synchronously, without locking held, in registration order.
#[derive(Clone)]
pub struct Reactivity {
    inner: Arc<ReactivityInner>,
}

impl Reactivity {
    pub(crate) fn new() -> Self {
        Reactivity {
            inner: Arc::new(ReactivityInner {
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a handler under every key. The returned guard unregisters
    /// on drop.
    pub fn register_unsafe(&self, keys: &[Key], handler: Handler) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut hashes = Vec::with_capacity(keys.len());
        {
            let mut handlers = self.inner.handlers.lock();
            for key in keys {
                let hash = key.hash_value();
                handlers.entry(hash).or_default().push((id, handler.clone()));
                hashes.push(hash);
            }
        }
        Registration {
            inner: Arc::downgrade(&self.inner),
            id,
            hashes,
            active: AtomicBool::new(true),
        }
    }

    /// Invoke every handler registered under any of `keys`, immediately.
    pub fn invalidate_unsafe(&self, keys: &[Key]) {
        let hashes: Vec<u64> = keys.iter().map(Key::hash_value).collect();
        self.invoke_hashes(&hashes);
    }

    /// Effectful invalidation. Inside [`with_batch`](Self::with_batch) the
    /// keys are collected and flushed when the wrapped effect completes;
    /// otherwise this behaves like [`invalidate_unsafe`](Self::invalidate_unsafe).
    pub async fn invalidate(&self, keys: Vec<Key>) {
        let hashes: Vec<u64> = keys.iter().map(Key::hash_value).collect();
        if add_to_ambient(&hashes) {
            return;
        }
        self.invoke_hashes(&hashes);
    }

    /// Run an effect; on success, invalidate `keys`.
    pub async fn mutation<A, E, Fut>(
        &self,
        keys: Vec<Key>,
        effect: Fut,
    ) -> std::result::Result<A, E>
    where
        Fut: Future<Output = std::result::Result<A, E>>,
    {
        let result = effect.await;
        if result.is_ok() {
            self.invalidate(keys).await;
        }
        result
    }

    /// Run an effect and re-run it whenever one of `keys` invalidates,
    /// yielding each run's output. Invalidations arriving mid-run coalesce
    /// into a single re-run.
    pub fn query<A, F, Fut>(&self, keys: Vec<Key>, effect: F) -> BoxStream<'static, A>
    where
        A: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = A> + Send + 'static,
    {
        let (tx, rx) = futures::channel::mpsc::unbounded::<()>();
        let registration = self.register_unsafe(
            &keys,
            Arc::new(move || {
                let _ = tx.unbounded_send(());
            }),
        );
        struct State<F> {
            rx: futures::channel::mpsc::UnboundedReceiver<()>,
            _registration: Registration,
            effect: F,
            first: bool,
        }
        let state = State {
            rx,
            _registration: registration,
            effect,
            first: true,
        };
        futures::stream::unfold(state, |mut state| async move {
            if !state.first {
                state.rx.next().await?;
                // Coalesce triggers that piled up during the last run.
                while let Ok(Some(())) = state.rx.try_next() {}
            }
            state.first = false;
            let value = (state.effect)().await;
            Some((value, state))
        })
        .boxed()
    }

    /// Stream variant of [`query`](Self::query): run the inner stream to
    /// completion, then restart it on the next invalidation.
    pub fn stream<A, F, S>(&self, keys: Vec<Key>, factory: F) -> BoxStream<'static, A>
    where
        A: Send + 'static,
        F: Fn() -> S + Send + 'static,
        S: Stream<Item = A> + Send + 'static,
    {
        let (tx, rx) = futures::channel::mpsc::unbounded::<()>();
        let registration = self.register_unsafe(
            &keys,
            Arc::new(move || {
                let _ = tx.unbounded_send(());
            }),
        );
        struct State<F, S> {
            rx: futures::channel::mpsc::UnboundedReceiver<()>,
            _registration: Registration,
            factory: F,
            current: Option<Pin<Box<S>>>,
        }
        let state = State {
            rx,
            _registration: registration,
            current: Some(Box::pin(factory())),
            factory,
        };
        futures::stream::unfold(state, |mut state| async move {
            loop {
                match &mut state.current {
                    Some(stream) => match stream.next().await {
                        Some(item) => return Some((item, state)),
                        None => state.current = None,
                    },
                    None => {
                        state.rx.next().await?;
                        while let Ok(Some(())) = state.rx.try_next() {}
                        state.current = Some(Box::pin((state.factory)()));
                    }
                }
            }
        })
        .boxed()
    }

    /// Wrap an effect so that [`invalidate`](Self::invalidate) calls made
    /// while it runs are deferred until it completes.
    pub fn with_batch<F: Future>(&self, effect: F) -> WithBatch<F> {
        WithBatch {
            reactivity: self.clone(),
            pending: Arc::new(Mutex::new(HashSet::new())),
            inner: Box::pin(effect),
            flushed: false,
        }
    }

    fn invoke_hashes(&self, hashes: &[u64]) {
        for hash in hashes {
            let handlers: Vec<Handler> = self
                .inner
                .handlers
                .lock()
                .get(hash)
                .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
                .unwrap_or_default();
            for handler in handlers {
                handler();
            }
        }
    }
}

impl std::fmt::Debug for Reactivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactivity")
            .field("keys", &self.inner.handlers.lock().len())
            .finish()
    }
}

/// Guard for a registered handler set; unregisters on drop.
pub struct Registration {
    inner: Weak<ReactivityInner>,
    id: u64,
    hashes: Vec<u64>,
    active: AtomicBool,
}

impl Registration {
    pub fn unregister(self) {
        drop(self);
    }

    fn release(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut handlers = inner.handlers.lock();
        for hash in &self.hashes {
            if let Some(entries) = handlers.get_mut(hash) {
                entries.retain(|(id, _)| *id != self.id);
                if entries.is_empty() {
                    handlers.remove(hash);
                }
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------
// Ambient pending-invalidation stack
// ----------------------------------------------------------------------

thread_local! {
    static AMBIENT: RefCell<Vec<Arc<Mutex<HashSet<u64>>>>> = RefCell::new(Vec::new());
}

fn add_to_ambient(hashes: &[u64]) -> bool {
    AMBIENT.with(|stack| match stack.borrow().last() {
        Some(pending) => {
            pending.lock().extend(hashes.iter().copied());
            true
        }
        None => false,
    })
}

/// Future returned by [`Reactivity::with_batch`].
pub struct WithBatch<F: Future> {
    reactivity: Reactivity,
    pending: Arc<Mutex<HashSet<u64>>>,
    inner: Pin<Box<F>>,
    flushed: bool,
}

impl<F: Future> Future for WithBatch<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        AMBIENT.with(|stack| stack.borrow_mut().push(this.pending.clone()));
        let polled = this.inner.as_mut().poll(cx);
        AMBIENT.with(|stack| {
            stack.borrow_mut().pop();
        });
        if polled.is_ready() && !this.flushed {
            this.flushed = true;
            let hashes: Vec<u64> = this.pending.lock().drain().collect();
            this.reactivity.invoke_hashes(&hashes);
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    fn counter_handler() -> (Arc<AtomicUsize>, Handler) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (
            count,
            Arc::new(move || {
                inner.fetch_add(1, Ordering::Relaxed);
            }),
        )
    }

    #[test]
    fn test_key_reduction() {
        assert_eq!(Key::int(1).hash_value(), Key::text("1").hash_value());
        assert_eq!(Key::uint(7).hash_value(), Key::text("7").hash_value());
        assert_ne!(Key::text("users").hash_value(), Key::record("users", 1).hash_value());
        assert_eq!(
            Key::record("users", 1).hash_value(),
            Key::domain("users", [1])[0].hash_value()
        );
    }

    #[test]
    fn test_register_and_invalidate_intersection() {
        let reactivity = Reactivity::new();
        let (count, handler) = counter_handler();
        let _registration =
            reactivity.register_unsafe(&[Key::text("users"), Key::record("users", 1)], handler);

        reactivity.invalidate_unsafe(&[Key::text("users")]);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        // No registered key intersects.
        reactivity.invalidate_unsafe(&[Key::record("posts", 1)]);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        reactivity.invalidate_unsafe(&[Key::record("users", 1)]);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let reactivity = Reactivity::new();
        let (count, handler) = counter_handler();
        let registration = reactivity.register_unsafe(&[Key::text("k")], handler);
        registration.unregister();
        reactivity.invalidate_unsafe(&[Key::text("k")]);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_mutation_invalidates_on_success_only() {
        let reactivity = Reactivity::new();
        let (count, handler) = counter_handler();
        let _registration = reactivity.register_unsafe(&[Key::text("cart")], handler);

        let ok: std::result::Result<i32, String> =
            block_on(reactivity.mutation(vec![Key::text("cart")], async { Ok(1) }));
        assert_eq!(ok, Ok(1));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        let err: std::result::Result<i32, String> =
            block_on(reactivity.mutation(vec![Key::text("cart")], async { Err("no".into()) }));
        assert!(err.is_err());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_with_batch_defers_invalidation() {
        let reactivity = Reactivity::new();
        let (count, handler) = counter_handler();
        let _registration = reactivity.register_unsafe(&[Key::text("a")], handler);

        let outer = reactivity.clone();
        let probe = count.clone();
        block_on(reactivity.with_batch(async move {
            outer.invalidate(vec![Key::text("a")]).await;
            outer.invalidate(vec![Key::text("a")]).await;
            // Still deferred while the effect runs.
            assert_eq!(probe.load(Ordering::Relaxed), 0);
        }));
        // Duplicate keys coalesced into one flush.
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_query_reruns_on_invalidation() {
        let reactivity = Reactivity::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let run_counter = runs.clone();
        let mut results = reactivity.query(vec![Key::text("q")], move || {
            let runs = run_counter.clone();
            async move { runs.fetch_add(1, Ordering::Relaxed) }
        });

        assert_eq!(block_on(results.next()), Some(0));
        reactivity.invalidate_unsafe(&[Key::text("q")]);
        reactivity.invalidate_unsafe(&[Key::text("q")]);
        // Coalesced: the two triggers cause one re-run.
        assert_eq!(block_on(results.next()), Some(1));
    }

    #[test]
    fn test_stream_restarts_on_invalidation() {
        let reactivity = Reactivity::new();
        let mut items = reactivity.stream(vec![Key::text("s")], || {
            futures::stream::iter(vec![1, 2])
        });
        assert_eq!(block_on(items.next()), Some(1));
        assert_eq!(block_on(items.next()), Some(2));
        reactivity.invalidate_unsafe(&[Key::text("s")]);
        assert_eq!(block_on(items.next()), Some(1));
    }
}
