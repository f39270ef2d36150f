//! Core type definitions shared across the crate.
//!
//! Identifiers, node keys, and the callback aliases that describe how atoms
//! read, write, and observe state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::internals::{Context, WriteContext};
use crate::registry::Registry;

/// Unique identifier for each atom description.
///
/// Every constructed atom (including every combinator result) gets a fresh
/// id from a global counter. Identity, not structure, keys non-serializable
/// atoms in a registry.
pub type AtomId = u64;

/// Milliseconds since the registry clock's epoch.
///
/// Timestamps on [`crate::AsyncResult::Success`] values come from the
/// registry's injectable [`crate::runtime::Clock`], so tests can pin them.
pub type Timestamp = u64;

static ATOM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate the next unique atom id.
pub(crate) fn next_atom_id() -> AtomId {
    ATOM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Identity of a live node in a registry.
///
/// Plain atoms key their node by atom identity. Atoms carrying a
/// serializable facet key by the facet's string key instead, so two
/// descriptions sharing a key share one node.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum NodeKey {
    /// Keyed by atom identity.
    Id(AtomId),
    /// Keyed by serializable string key.
    Serial(Arc<str>),
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKey::Id(id) => write!(f, "atom{id}"),
            NodeKey::Serial(key) => write!(f, "serial:{key}"),
        }
    }
}

/// Bound required of every atom value.
///
/// `Clone` because reads hand out owned values, `PartialEq` because the
/// registry suppresses writes of an equal value (no invalidation, no
/// notification), and `Send + Sync + 'static` because descriptions and
/// nodes are shared behind `Arc`.
pub trait AtomValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> AtomValue for T {}

/// Listener callback for subscriptions.
///
/// Listeners take no arguments; they read whatever they need back out of
/// the registry. Notification order is listener registration order.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// A unit of deferred work on the registry's task queues.
pub type Task = Box<dyn FnOnce() + Send>;

/// Read function of an atom: computes the value against an evaluation
/// [`Context`] that records dependencies and owns the finalizer bag.
pub type ReadFn<T> = Arc<dyn Fn(&Context<T>) -> Result<T> + Send + Sync>;

/// Write function of a writable atom.
pub type WriteFn<T, W> = Arc<dyn Fn(&WriteContext<T>, W) -> Result<()> + Send + Sync>;

/// Optional refresh override. Receives the registry so it can widen
/// invalidation to related atoms; the default refresh just invalidates the
/// atom itself.
pub type RefreshFn = Arc<dyn Fn(&Registry) -> Result<()> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_ids_increase() {
        let a = next_atom_id();
        let b = next_atom_id();
        assert!(b > a);
    }

    #[test]
    fn test_node_key_equality() {
        let a: Arc<str> = Arc::from("user");
        let b: Arc<str> = Arc::from("user");
        assert_eq!(NodeKey::Serial(a), NodeKey::Serial(b));
        assert_ne!(NodeKey::Id(1), NodeKey::Id(2));
        assert_ne!(NodeKey::Id(1), NodeKey::Serial(Arc::from("1")));
    }

    #[test]
    fn test_node_key_display() {
        assert_eq!(NodeKey::Id(7).to_string(), "atom7");
        assert_eq!(NodeKey::Serial(Arc::from("cart")).to_string(), "serial:cart");
    }
}
