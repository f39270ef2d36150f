//! # atomflow: a fine-grained reactive computation graph
//!
//! This library manages a registry of **atoms**: reactive nodes whose
//! values are computed lazily, cached, invalidated transitively, and
//! removed once nothing observes them.
//!
//! ## Core Concepts
//!
//! - **Atoms**: immutable descriptions of how to compute (and optionally
//!   write) a value
//! - **Registry**: runtime container holding node state, dependency
//!   edges, and subscriptions
//! - **AsyncResult**: tri-state value (Initial / Success / Failure)
//!   observed from effect- and stream-backed atoms
//! - **Batching**: scoped regions that collect invalidations and notify
//!   once at commit
//! - **Idle TTL**: time-bucketed eviction of unobserved nodes
//! - **Reactivity**: keyed pub-sub that connects external events to atoms
//!
//! The execution model is strictly cooperative and single-threaded:
//! synchronous reads never suspend, effectful atoms run as fibers driven
//! through [`Registry::tick`] or a host-provided task scheduler.
//!
//! ## Example Usage
//!
//! ```rust
//! use atomflow::{state, Registry};
//!
//! let registry = Registry::new();
//!
//! // A primitive cell and a derivation over it.
//! let count = state(2);
//! let doubled = count.as_atom().map(|n| n * 2);
//!
//! assert_eq!(registry.get(&doubled).unwrap(), 4);
//!
//! registry.set(&count, 5).unwrap();
//! assert_eq!(registry.get(&doubled).unwrap(), 10);
//!
//! // Subscribe to changes.
//! let subscription = registry
//!     .subscribe(&doubled, || println!("doubled changed"), false)
//!     .unwrap();
//! subscription.unsubscribe();
//! ```

// Public modules
pub mod atom;
pub mod error;
pub mod reactivity;
pub mod registry;
pub mod result;
pub mod runtime;
pub mod types;
pub mod utils;

// Internal implementation (not public API)
mod internals;

// Re-export commonly used types
pub use atom::{
    effect, effect_with, fn_atom, fn_atom_with, fn_sync, fn_sync_with, pull, pull_with, readable,
    readable_with_refresh, state, stream, stream_with, subscription_ref, value, writable,
    writable_with_refresh, Atom, FnCall, FnOptions, PullChunk, PullOptions, Serializable,
    WritableAtom,
};
pub use error::{AtomError, Result};
pub use internals::{Context, Lifetime, WriteContext};
pub use reactivity::{Key, Reactivity, Registration, WithBatch};
pub use registry::{
    DehydratedAtom, InitialValue, NodeSnapshot, NodeStatus, PendingValue, Registry,
    RegistryOptions, Subscription,
};
pub use result::{AsyncResult, Cause, Exit, Succeeded};
pub use runtime::{Clock, ManualClock, DEFAULT_MAX_OPS_BEFORE_YIELD};
pub use types::{AtomId, AtomValue, Listener, NodeKey, Timestamp};

// Re-export utility functions
pub use utils::{
    atom_family::{family, AtomFamily},
    optimistic::{optimistic, optimistic_fn},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_import() {
        let _registry = Registry::new();
    }
}
