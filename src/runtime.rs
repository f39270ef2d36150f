//! Cooperative execution machinery: task scheduling, timers, the
//! injectable clock, and the fiber bridge that runs effect futures.
//!
//! The model is strictly single-threaded and cooperative. Synchronous work
//! runs through the [`Scheduler`] (flushed immediately after a fiber is
//! forked so synchronously-ready effects complete before the forking read
//! returns). Everything else lands on the deferred queue or the timer
//! wheel and is driven by [`crate::Registry::tick`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use futures::task::ArcWake;
use parking_lot::Mutex;

use crate::registry::RegistryInner;
use crate::result::{Cause, Exit};
use crate::types::{Task, Timestamp};

/// Cooperative yield threshold: how many queued tasks one scheduler flush
/// runs before leaving the remainder for the next flush.
pub const DEFAULT_MAX_OPS_BEFORE_YIELD: usize = 2048;

// ----------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------

/// Injectable time source, in milliseconds.
///
/// Production registries use [`Clock::system`]; tests drive a
/// [`ManualClock`] so TTL eviction and debouncing run without sleeping.
#[derive(Clone)]
pub struct Clock {
    now_fn: Arc<dyn Fn() -> Timestamp + Send + Sync>,
}

impl Clock {
    /// Wall-clock time since the Unix epoch.
    pub fn system() -> Self {
        Clock {
            now_fn: Arc::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as Timestamp)
                    .unwrap_or(0)
            }),
        }
    }

    /// A clock frozen at a single instant.
    pub fn fixed(at: Timestamp) -> Self {
        Clock {
            now_fn: Arc::new(move || at),
        }
    }

    pub(crate) fn from_fn(f: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        Clock { now_fn: Arc::new(f) }
    }

    pub fn now(&self) -> Timestamp {
        (self.now_fn)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}

/// Hand-advanced clock for tests.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ms: Timestamp) -> Self {
        let clock = Self::new();
        clock.set(ms);
        clock
    }

    pub fn now(&self) -> Timestamp {
        self.now.load(Ordering::Acquire)
    }

    pub fn set(&self, ms: Timestamp) {
        self.now.store(ms, Ordering::Release);
    }

    pub fn advance(&self, ms: Timestamp) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    /// A [`Clock`] view over this manual source.
    pub fn clock(&self) -> Clock {
        let now = self.now.clone();
        Clock::from_fn(move || now.load(Ordering::Acquire))
    }
}

// ----------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------

/// Priority task queue for synchronous work.
///
/// Lower priority numbers run first. A flush stops after the yield budget
/// is spent; leftovers run on the next flush or tick.
pub(crate) struct Scheduler {
    queues: Mutex<BTreeMap<u8, VecDeque<Task>>>,
    max_ops: usize,
}

impl Scheduler {
    pub fn new(max_ops: usize) -> Self {
        Scheduler {
            queues: Mutex::new(BTreeMap::new()),
            max_ops: max_ops.max(1),
        }
    }

    pub fn schedule(&self, task: Task) {
        self.schedule_with_priority(0, task);
    }

    pub fn schedule_with_priority(&self, priority: u8, task: Task) {
        self.queues
            .lock()
            .entry(priority)
            .or_default()
            .push_back(task);
    }

    fn pop(&self) -> Option<Task> {
        let mut queues = self.queues.lock();
        let priority = *queues.keys().next()?;
        let queue = queues.get_mut(&priority)?;
        let task = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&priority);
        }
        task
    }

    /// Run queued tasks in priority order until the queue drains or the
    /// yield budget is spent.
    pub fn flush(&self) {
        let mut ops = 0;
        while let Some(task) = self.pop() {
            task();
            ops += 1;
            if ops >= self.max_ops {
                break;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}

// ----------------------------------------------------------------------
// Deferred queue
// ----------------------------------------------------------------------

/// Queue of work that must run on a later turn: removal re-checks and
/// fiber re-polls. A host can take ownership of deferral by supplying
/// `schedule_task` in the registry options; otherwise tasks wait for the
/// next [`crate::Registry::tick`].
pub(crate) struct DeferredQueue {
    tasks: Mutex<VecDeque<Task>>,
    external: Option<Arc<dyn Fn(Task) + Send + Sync>>,
}

impl DeferredQueue {
    pub fn new(external: Option<Arc<dyn Fn(Task) + Send + Sync>>) -> Self {
        DeferredQueue {
            tasks: Mutex::new(VecDeque::new()),
            external,
        }
    }

    pub fn push(&self, task: Task) {
        match &self.external {
            Some(schedule) => schedule(task),
            None => self.tasks.lock().push_back(task),
        }
    }

    pub fn drain(&self) -> Vec<Task> {
        self.tasks.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

// ----------------------------------------------------------------------
// Timer wheel
// ----------------------------------------------------------------------

/// Handle to a scheduled timer, used for cancellation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct TimerKey(u64);

#[derive(Default)]
struct TimerState {
    entries: BTreeMap<(Timestamp, u64), Task>,
    deadlines: HashMap<u64, Timestamp>,
}

/// Deadline-ordered task storage, fired by the registry tick against the
/// injectable clock.
pub(crate) struct Timers {
    state: Mutex<TimerState>,
    seq: AtomicU64,
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            state: Mutex::new(TimerState::default()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn schedule_at(&self, deadline: Timestamp, task: Task) -> TimerKey {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.entries.insert((deadline, seq), task);
        state.deadlines.insert(seq, deadline);
        TimerKey(seq)
    }

    pub fn cancel(&self, key: TimerKey) {
        let mut state = self.state.lock();
        if let Some(deadline) = state.deadlines.remove(&key.0) {
            state.entries.remove(&(deadline, key.0));
        }
    }

    /// Pop every timer whose deadline has passed. The caller runs them
    /// outside the lock.
    pub fn fire_due(&self, now: Timestamp) -> Vec<Task> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        loop {
            let next = state.entries.keys().next().copied();
            let Some((deadline, seq)) = next else {
                break;
            };
            if deadline > now {
                break;
            }
            if let Some(task) = state.entries.remove(&(deadline, seq)) {
                state.deadlines.remove(&seq);
                due.push(task);
            }
        }
        due
    }

    pub fn has_due(&self, now: Timestamp) -> bool {
        self.state
            .lock()
            .entries
            .keys()
            .next()
            .is_some_and(|(deadline, _)| *deadline <= now)
    }
}

// ----------------------------------------------------------------------
// Fibers
// ----------------------------------------------------------------------

/// A running effect future bound to a node lifetime.
///
/// The first poll happens synchronously on the scheduler flush inside
/// [`spawn`]; later polls are driven by the future's waker through the
/// deferred queue. Interruption drops the future and reports
/// [`Cause::Interrupt`] to the observer, never overwriting a completed
/// exit.
struct Fiber<A, E> {
    host: Weak<RegistryInner>,
    future: Mutex<Option<BoxFuture<'static, Result<A, E>>>>,
    observer: Mutex<Option<Box<dyn FnOnce(Exit<A, E>) + Send>>>,
    done: AtomicBool,
}

impl<A: Send + 'static, E: Send + 'static> Fiber<A, E> {
    fn poll_once(this: &Arc<Self>) {
        if this.done.load(Ordering::Acquire) {
            return;
        }
        let Some(mut future) = this.future.lock().take() else {
            return;
        };
        let waker = futures::task::waker(Arc::new(FiberWaker {
            fiber: this.clone(),
        }));
        let mut cx = std::task::Context::from_waker(&waker);
        let polled =
            std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        match polled {
            Ok(Poll::Ready(Ok(value))) => this.finish(Exit::Success(value)),
            Ok(Poll::Ready(Err(error))) => this.finish(Exit::Failure(Cause::Fail(error))),
            Ok(Poll::Pending) => {
                // The fiber may have been interrupted from inside its own
                // poll; only park the future if it is still live.
                if !this.done.load(Ordering::Acquire) {
                    *this.future.lock() = Some(future);
                }
            }
            Err(panic) => this.finish(Exit::Failure(Cause::Die(panic_message(panic)))),
        }
    }

    fn finish(&self, exit: Exit<A, E>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.future.lock() = None;
        let observer = self.observer.lock().take();
        if let Some(observer) = observer {
            observer(exit);
        }
    }
}

/// Type-erased fiber operations for handles and lifetimes.
pub(crate) trait AnyFiber: Send + Sync {
    fn interrupt(&self);
    fn is_done(&self) -> bool;
}

impl<A: Send + 'static, E: Send + 'static> AnyFiber for Fiber<A, E> {
    fn interrupt(&self) {
        self.finish(Exit::Failure(Cause::Interrupt));
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Cloneable handle used to observe completion and to cancel.
#[derive(Clone)]
pub(crate) struct FiberHandle {
    inner: Arc<dyn AnyFiber>,
}

impl FiberHandle {
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }
}

struct FiberWaker<A, E> {
    fiber: Arc<Fiber<A, E>>,
}

impl<A: Send + 'static, E: Send + 'static> ArcWake for FiberWaker<A, E> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let fiber = arc_self.fiber.clone();
        if fiber.is_done() {
            return;
        }
        if let Some(host) = fiber.host.upgrade() {
            host.defer_task(Box::new(move || Fiber::poll_once(&fiber)));
        }
    }
}

/// Fork an effect future. The observer receives exactly one exit:
/// success, failure, defect (panic), or interrupt.
pub(crate) fn spawn<A, E>(
    host: &Arc<RegistryInner>,
    future: BoxFuture<'static, Result<A, E>>,
    on_exit: impl FnOnce(Exit<A, E>) + Send + 'static,
) -> FiberHandle
where
    A: Send + 'static,
    E: Send + 'static,
{
    let fiber = Arc::new(Fiber {
        host: Arc::downgrade(host),
        future: Mutex::new(Some(future)),
        observer: Mutex::new(Some(Box::new(on_exit))),
        done: AtomicBool::new(false),
    });
    let scheduled = fiber.clone();
    host.scheduler()
        .schedule(Box::new(move || Fiber::poll_once(&scheduled)));
    host.scheduler().flush();
    FiberHandle { inner: fiber }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "fiber panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scheduler_runs_in_priority_order() {
        let scheduler = Scheduler::new(DEFAULT_MAX_OPS_BEFORE_YIELD);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [(1u8, "low"), (0, "high"), (1, "low2")] {
            let order = order.clone();
            scheduler
                .schedule_with_priority(priority, Box::new(move || order.lock().push(tag)));
        }
        scheduler.flush();
        assert_eq!(*order.lock(), vec!["high", "low", "low2"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_scheduler_yields_after_budget() {
        let scheduler = Scheduler::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let count = count.clone();
            scheduler.schedule(Box::new(move || {
                count.fetch_add(1, Ordering::Relaxed);
            }));
        }
        scheduler.flush();
        assert_eq!(count.load(Ordering::Relaxed), 2);
        scheduler.flush();
        scheduler.flush();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let timers = Timers::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (deadline, tag) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let order = order.clone();
            timers.schedule_at(deadline, Box::new(move || order.lock().push(tag)));
        }
        assert!(!timers.has_due(5));
        for task in timers.fire_due(25) {
            task();
        }
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert!(timers.has_due(30));
    }

    #[test]
    fn test_timer_cancel() {
        let timers = Timers::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let key = timers.schedule_at(10, Box::new(move || flag.store(true, Ordering::Relaxed)));
        timers.cancel(key);
        for task in timers.fire_due(100) {
            task();
        }
        assert!(!fired.load(Ordering::Relaxed));
    }

    #[test]
    fn test_manual_clock() {
        let manual = ManualClock::new();
        let clock = manual.clock();
        assert_eq!(clock.now(), 0);
        manual.advance(150);
        assert_eq!(clock.now(), 150);
        manual.set(42);
        assert_eq!(clock.now(), 42);
    }
}
