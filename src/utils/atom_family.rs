//! Keyed atom memoization.
//!
//! An atom family is a factory that creates and caches atom descriptions
//! per parameter, so every caller asking for the same parameter gets the
//! same description and therefore the same live node. The cache holds
//! weak handles: once every strong reference to a member atom is dropped,
//! its cache entry is reclaimed on the next access.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::atom::{Atom, WeakAtom};
use crate::types::AtomValue;

/// Factory with a weak per-parameter cache of created atoms.
pub struct AtomFamily<P, T>
where
    P: Clone + Eq + Hash + Send + Sync + 'static,
    T: AtomValue,
{
    make: Arc<dyn Fn(P) -> Atom<T> + Send + Sync>,
    cache: Mutex<HashMap<P, WeakAtom<T>>>,
}

impl<P, T> AtomFamily<P, T>
where
    P: Clone + Eq + Hash + Send + Sync + 'static,
    T: AtomValue,
{
    /// Get or create the member atom for `param`.
    pub fn get(&self, param: P) -> Atom<T> {
        let mut cache = self.cache.lock();
        if let Some(weak) = cache.get(&param) {
            if let Some(atom) = weak.upgrade() {
                return atom;
            }
        }
        let atom = (self.make)(param.clone());
        cache.insert(param, atom.downgrade());
        // Dead entries are reclaimed opportunistically on insertion.
        cache.retain(|_, weak| weak.upgrade().is_some());
        atom
    }

    /// Parameters whose member atoms are still alive.
    pub fn get_params(&self) -> Vec<P> {
        self.cache
            .lock()
            .iter()
            .filter(|(_, weak)| weak.upgrade().is_some())
            .map(|(param, _)| param.clone())
            .collect()
    }

    /// Drop the cache entry for `param`. Live references elsewhere keep
    /// working; the family just stops handing them out.
    pub fn remove(&self, param: &P) {
        self.cache.lock().remove(param);
    }

    /// Keep only the members whose parameter satisfies `predicate`.
    pub fn retain_where(&self, predicate: impl Fn(&P) -> bool) {
        self.cache
            .lock()
            .retain(|param, weak| predicate(param) && weak.upgrade().is_some());
    }

    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Create an atom family from a keyed factory.
pub fn family<P, T, F>(make: F) -> AtomFamily<P, T>
where
    P: Clone + Eq + Hash + Send + Sync + 'static,
    T: AtomValue,
    F: Fn(P) -> Atom<T> + Send + Sync + 'static,
{
    AtomFamily {
        make: Arc::new(make),
        cache: Mutex::new(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::value;

    #[test]
    fn test_same_param_returns_same_atom() {
        let counters = family(|id: i32| value(id * 10));
        let a = counters.get(1);
        let b = counters.get(1);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_different_params_return_different_atoms() {
        let counters = family(|id: i32| value(id));
        let a = counters.get(1);
        let b = counters.get(2);
        assert_ne!(a.id(), b.id());
        assert_eq!(counters.len(), 2);
    }

    #[test]
    fn test_dropped_members_are_recreated() {
        let counters = family(|id: i32| value(id));
        let first_id = counters.get(7).id();
        // No strong references remain; the weak entry is dead.
        assert!(counters.get_params().is_empty());
        let second_id = counters.get(7).id();
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn test_remove_and_retain() {
        let counters = family(|id: i32| value(id));
        let keep = counters.get(1);
        let _drop_me = counters.get(2);
        counters.remove(&2);
        assert_eq!(counters.get_params(), vec![1]);
        counters.retain_where(|param| *param != 1);
        assert!(counters.is_empty());
        drop(keep);
    }
}
