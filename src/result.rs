//! Tri-state result values for effect-backed atoms.
//!
//! An [`AsyncResult`] is what subscribers of an effectful atom observe: it
//! starts [`Initial`](AsyncResult::Initial), transitions through waiting
//! markers while a computation is in flight, and lands on
//! [`Success`](AsyncResult::Success) or [`Failure`](AsyncResult::Failure).
//! A failure carries the most recent success forward so consumers can keep
//! rendering the last good value.

use crate::types::Timestamp;

/// Why a computation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cause<E> {
    /// The computation failed with its declared error type.
    Fail(E),
    /// The computation panicked or died outside its error channel.
    Die(String),
    /// The computation was interrupted before completing.
    Interrupt,
    /// A stream closed without producing any element.
    NoElement,
}

impl<E> Cause<E> {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Cause::Interrupt)
    }

    /// The declared error, if this cause carries one.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Cause::Fail(e) => Some(e),
            _ => None,
        }
    }

    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Cause<F> {
        match self {
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(msg) => Cause::Die(msg),
            Cause::Interrupt => Cause::Interrupt,
            Cause::NoElement => Cause::NoElement,
        }
    }
}

/// Exit of a completed computation: the value or the cause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exit<A, E> {
    Success(A),
    Failure(Cause<E>),
}

/// A success snapshot carried forward into later failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Succeeded<A> {
    pub value: A,
    pub timestamp: Timestamp,
}

/// Tri-state value of an effect-backed atom.
///
/// The `waiting` flag on every variant signals that a new computation is in
/// flight while the last observed value is still current. Transitioning
/// back to `Initial` means logical reset.
#[derive(Clone, Debug, PartialEq)]
pub enum AsyncResult<A, E> {
    Initial {
        waiting: bool,
    },
    Success {
        value: A,
        waiting: bool,
        timestamp: Timestamp,
    },
    Failure {
        cause: Cause<E>,
        previous: Option<Succeeded<A>>,
        waiting: bool,
    },
}

impl<A, E> AsyncResult<A, E> {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn initial() -> Self {
        AsyncResult::Initial { waiting: false }
    }

    pub fn initial_waiting() -> Self {
        AsyncResult::Initial { waiting: true }
    }

    pub fn success(value: A, timestamp: Timestamp) -> Self {
        AsyncResult::Success {
            value,
            waiting: false,
            timestamp,
        }
    }

    pub fn success_waiting(value: A, timestamp: Timestamp) -> Self {
        AsyncResult::Success {
            value,
            waiting: true,
            timestamp,
        }
    }

    pub fn failure(cause: Cause<E>) -> Self {
        AsyncResult::Failure {
            cause,
            previous: None,
            waiting: false,
        }
    }

    pub fn failure_with(cause: Cause<E>, previous: Option<Succeeded<A>>) -> Self {
        AsyncResult::Failure {
            cause,
            previous,
            waiting: false,
        }
    }

    /// Shorthand for a failure with a plain error.
    pub fn fail(error: E) -> Self {
        Self::failure(Cause::Fail(error))
    }

    pub fn interrupted(previous: Option<Succeeded<A>>) -> Self {
        Self::failure_with(Cause::Interrupt, previous)
    }

    /// Convert a completed exit into a result.
    pub fn from_exit(exit: Exit<A, E>, timestamp: Timestamp) -> Self {
        Self::from_exit_with_previous(exit, None, timestamp)
    }

    /// Convert an exit, carrying a prior success into any failure.
    pub fn from_exit_with_previous(
        exit: Exit<A, E>,
        previous: Option<Succeeded<A>>,
        timestamp: Timestamp,
    ) -> Self {
        match exit {
            Exit::Success(value) => Self::success(value, timestamp),
            Exit::Failure(cause) => Self::failure_with(cause, previous),
        }
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    // ------------------------------------------------------------------
    // Waiting transitions
    // ------------------------------------------------------------------

    /// Mark this result as waiting, keeping its shape.
    pub fn into_waiting(self) -> Self {
        match self {
            AsyncResult::Initial { .. } => AsyncResult::Initial { waiting: true },
            AsyncResult::Success {
                value, timestamp, ..
            } => AsyncResult::Success {
                value,
                waiting: true,
                timestamp,
            },
            AsyncResult::Failure {
                cause, previous, ..
            } => AsyncResult::Failure {
                cause,
                previous,
                waiting: true,
            },
        }
    }

    /// The waiting form of a possibly-absent prior result. Used when a new
    /// computation starts: no prior result means a waiting `Initial`.
    pub fn waiting_from(previous: Option<Self>) -> Self {
        match previous {
            Some(r) => r.into_waiting(),
            None => Self::initial_waiting(),
        }
    }

    /// Refresh the timestamp of a success, leaving other shapes alone.
    pub fn touch(self, timestamp: Timestamp) -> Self {
        match self {
            AsyncResult::Success { value, waiting, .. } => AsyncResult::Success {
                value,
                waiting,
                timestamp,
            },
            other => other,
        }
    }

    /// Replace the carried previous-success of a failure.
    pub fn replace_previous(self, previous: Option<Succeeded<A>>) -> Self {
        match self {
            AsyncResult::Failure { cause, waiting, .. } => AsyncResult::Failure {
                cause,
                previous,
                waiting,
            },
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    pub fn is_initial(&self) -> bool {
        matches!(self, AsyncResult::Initial { .. })
    }

    pub fn is_not_initial(&self) -> bool {
        !self.is_initial()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AsyncResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, AsyncResult::Failure { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            AsyncResult::Failure {
                cause: Cause::Interrupt,
                ..
            }
        )
    }

    pub fn is_waiting(&self) -> bool {
        match self {
            AsyncResult::Initial { waiting }
            | AsyncResult::Success { waiting, .. }
            | AsyncResult::Failure { waiting, .. } => *waiting,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The last observed success value: the current one for `Success`, the
    /// carried-forward one for `Failure`, nothing for `Initial`.
    pub fn value(&self) -> Option<&A> {
        match self {
            AsyncResult::Success { value, .. } => Some(value),
            AsyncResult::Failure { previous, .. } => previous.as_ref().map(|s| &s.value),
            AsyncResult::Initial { .. } => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            AsyncResult::Failure { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// The declared error of a failure, ignoring interrupts and defects.
    pub fn error(&self) -> Option<&E> {
        self.cause().and_then(Cause::failure)
    }

    /// Latest success snapshot reachable from this result.
    pub fn latest_success(&self) -> Option<Succeeded<A>>
    where
        A: Clone,
    {
        match self {
            AsyncResult::Success {
                value, timestamp, ..
            } => Some(Succeeded {
                value: value.clone(),
                timestamp: *timestamp,
            }),
            AsyncResult::Failure { previous, .. } => previous.clone(),
            AsyncResult::Initial { .. } => None,
        }
    }

    pub fn get_or_else(&self, fallback: impl FnOnce() -> A) -> A
    where
        A: Clone,
    {
        self.value().cloned().unwrap_or_else(fallback)
    }

    /// The success value, or the cause that stands in its way. `Initial`
    /// maps to an interrupt-free "not yet" via [`Cause::NoElement`].
    pub fn get_or_err(&self) -> std::result::Result<A, Cause<E>>
    where
        A: Clone,
        E: Clone,
    {
        match self {
            AsyncResult::Success { value, .. } => Ok(value.clone()),
            AsyncResult::Failure { cause, .. } => Err(cause.clone()),
            AsyncResult::Initial { .. } => Err(Cause::NoElement),
        }
    }

    /// The completed exit, if any. `Initial` has not exited.
    pub fn to_exit(&self) -> Option<Exit<A, E>>
    where
        A: Clone,
        E: Clone,
    {
        match self {
            AsyncResult::Success { value, .. } => Some(Exit::Success(value.clone())),
            AsyncResult::Failure { cause, .. } => Some(Exit::Failure(cause.clone())),
            AsyncResult::Initial { .. } => None,
        }
    }

    // ------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> AsyncResult<B, E> {
        match self {
            AsyncResult::Initial { waiting } => AsyncResult::Initial { waiting },
            AsyncResult::Success {
                value,
                waiting,
                timestamp,
            } => AsyncResult::Success {
                value: f(value),
                waiting,
                timestamp,
            },
            AsyncResult::Failure {
                cause,
                previous,
                waiting,
            } => AsyncResult::Failure {
                cause,
                previous: previous.map(|s| Succeeded {
                    value: f(s.value),
                    timestamp: s.timestamp,
                }),
                waiting,
            },
        }
    }

    pub fn map_error<F>(self, f: impl FnOnce(E) -> F) -> AsyncResult<A, F> {
        match self {
            AsyncResult::Initial { waiting } => AsyncResult::Initial { waiting },
            AsyncResult::Success {
                value,
                waiting,
                timestamp,
            } => AsyncResult::Success {
                value,
                waiting,
                timestamp,
            },
            AsyncResult::Failure {
                cause,
                previous,
                waiting,
            } => AsyncResult::Failure {
                cause: cause.map(f),
                previous,
                waiting,
            },
        }
    }

    /// Chain on success; `Initial` and `Failure` pass through unchanged.
    pub fn and_then<B>(self, f: impl FnOnce(A) -> AsyncResult<B, E>) -> AsyncResult<B, E> {
        match self {
            AsyncResult::Initial { waiting } => AsyncResult::Initial { waiting },
            AsyncResult::Success { value, .. } => f(value),
            AsyncResult::Failure {
                cause, waiting, ..
            } => AsyncResult::Failure {
                cause,
                previous: None,
                waiting,
            },
        }
    }

    /// Collapse the three shapes into one output.
    pub fn fold<R>(
        &self,
        on_initial: impl FnOnce(bool) -> R,
        on_success: impl FnOnce(&A, bool) -> R,
        on_failure: impl FnOnce(&Cause<E>, Option<&Succeeded<A>>, bool) -> R,
    ) -> R {
        match self {
            AsyncResult::Initial { waiting } => on_initial(*waiting),
            AsyncResult::Success { value, waiting, .. } => on_success(value, *waiting),
            AsyncResult::Failure {
                cause,
                previous,
                waiting,
            } => on_failure(cause, previous.as_ref(), *waiting),
        }
    }

    /// Like [`fold`](Self::fold) but failures without a declared error
    /// (defects, interrupts) fall into the initial branch.
    pub fn fold_with_error<R>(
        &self,
        on_other: impl FnOnce() -> R,
        on_success: impl FnOnce(&A) -> R,
        on_error: impl FnOnce(&E) -> R,
    ) -> R {
        match self {
            AsyncResult::Success { value, .. } => on_success(value),
            AsyncResult::Failure {
                cause: Cause::Fail(e),
                ..
            } => on_error(e),
            _ => on_other(),
        }
    }

    /// Collapse while treating waiting states uniformly: a waiting result
    /// of any shape goes to `on_waiting` with its last known value.
    pub fn fold_with_waiting<R>(
        &self,
        on_waiting: impl FnOnce(Option<&A>) -> R,
        on_initial: impl FnOnce() -> R,
        on_success: impl FnOnce(&A) -> R,
        on_failure: impl FnOnce(&Cause<E>) -> R,
    ) -> R {
        if self.is_waiting() {
            return on_waiting(self.value());
        }
        match self {
            AsyncResult::Initial { .. } => on_initial(),
            AsyncResult::Success { value, .. } => on_success(value),
            AsyncResult::Failure { cause, .. } => on_failure(cause),
        }
    }

    /// Combine many results: the first failure wins, any `Initial` makes
    /// the whole `Initial`, and the combined result waits if any part does.
    pub fn all(results: impl IntoIterator<Item = AsyncResult<A, E>>) -> AsyncResult<Vec<A>, E> {
        let mut values = Vec::new();
        let mut waiting = false;
        let mut timestamp = 0;
        let mut initial = false;
        for result in results {
            waiting |= result.is_waiting();
            match result {
                AsyncResult::Failure { cause, .. } => {
                    return AsyncResult::Failure {
                        cause,
                        previous: None,
                        waiting,
                    }
                }
                AsyncResult::Initial { .. } => initial = true,
                AsyncResult::Success {
                    value,
                    timestamp: ts,
                    ..
                } => {
                    values.push(value);
                    timestamp = timestamp.max(ts);
                }
            }
        }
        if initial {
            AsyncResult::Initial { waiting }
        } else {
            AsyncResult::Success {
                value: values,
                waiting,
                timestamp,
            }
        }
    }
}

/// Step-by-step construction of an [`AsyncResult`] with explicit waiting
/// and timestamp settings.
#[derive(Default, Clone, Debug)]
pub struct Builder {
    waiting: bool,
    timestamp: Timestamp,
}

impl Builder {
    pub fn waiting(mut self, waiting: bool) -> Self {
        self.waiting = waiting;
        self
    }

    pub fn timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn success<A, E>(self, value: A) -> AsyncResult<A, E> {
        AsyncResult::Success {
            value,
            waiting: self.waiting,
            timestamp: self.timestamp,
        }
    }

    pub fn failure<A, E>(self, cause: Cause<E>) -> AsyncResult<A, E> {
        AsyncResult::Failure {
            cause,
            previous: None,
            waiting: self.waiting,
        }
    }

    pub fn initial<A, E>(self) -> AsyncResult<A, E> {
        AsyncResult::Initial {
            waiting: self.waiting,
        }
    }
}
