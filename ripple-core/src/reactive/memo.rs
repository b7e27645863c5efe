//! Memoized Subscribers
//!
//! A [`MemoCache`] shares one [`Subscriber`] between every caller that asks
//! for the same key, so identical derivations are computed once.
//!
//! # How the Cache Works
//!
//! 1. `acquire(key, make)` returns the cached subscriber for `key`, calling
//!    `make` only if there is none.
//!
//! 2. Each returned [`MemoHandle`] counts as one reference. Cloning a handle
//!    adds a reference.
//!
//! 3. When the last handle for a key drops, the subscriber is destroyed and
//!    evicted, so its dependencies stop notifying it.
//!
//! Keys are explicit: callers name what a derivation depends on (for example
//! `(table_id, search_id)`) instead of relying on closure identity.

use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::subscriber::Subscriber;

struct MemoEntry<T>
where
    T: Clone + Send + Sync + 'static,
{
    unit: Subscriber<T>,
    refs: usize,
}

type Entries<K, T> = DashMap<K, MemoEntry<T>>;

/// A keyed, reference-counted cache of subscribers.
pub struct MemoCache<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    entries: Arc<Entries<K, T>>,
}

impl<K, T> MemoCache<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Get the subscriber for `key`, creating it with `make` if needed.
    pub fn acquire<F>(&self, key: K, make: F) -> MemoHandle<K, T>
    where
        F: FnOnce() -> Subscriber<T>,
    {
        let unit = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| MemoEntry {
                    unit: make(),
                    refs: 0,
                });
            entry.refs += 1;
            entry.unit.clone()
        };
        MemoHandle {
            key,
            unit,
            entries: Arc::downgrade(&self.entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Live handles for `key`.
    pub fn ref_count(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.refs)
    }
}

impl<K, T> Default for MemoCache<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A counted reference to a cached subscriber.
pub struct MemoHandle<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    key: K,
    unit: Subscriber<T>,
    entries: Weak<Entries<K, T>>,
}

impl<K, T> MemoHandle<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn subscriber(&self) -> &Subscriber<T> {
        &self.unit
    }
}

impl<K, T> Deref for MemoHandle<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    type Target = Subscriber<T>;

    fn deref(&self) -> &Self::Target {
        &self.unit
    }
}

impl<K, T> Clone for MemoHandle<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        if let Some(entries) = self.entries.upgrade() {
            if let Some(mut entry) = entries.get_mut(&self.key) {
                entry.refs += 1;
            }
        }
        Self {
            key: self.key.clone(),
            unit: self.unit.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<K, T> Drop for MemoHandle<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        if let Some(mut entry) = entries.get_mut(&self.key) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        if let Some((_, evicted)) = entries.remove_if(&self.key, |_, entry| entry.refs == 0) {
            evicted.unit.destroy();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::State;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_key_shares_one_subscriber() {
        let input = State::new(3);
        let cache: MemoCache<&'static str, i32> = MemoCache::new();
        let made = Arc::new(AtomicUsize::new(0));

        let make = || {
            made.fetch_add(1, Ordering::SeqCst);
            let source = input.clone();
            Subscriber::new(move || Ok(source.read()? * 2))
        };

        let a = cache.acquire("double", make);
        let b = cache.acquire("double", || unreachable!("cached"));

        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert_eq!(a.id(), b.id());
        assert_eq!(b.get().unwrap(), 6);
        assert_eq!(cache.ref_count(&"double"), 2);
    }

    #[test]
    fn last_handle_destroys_and_evicts() {
        let input = State::new(1);
        let cache: MemoCache<u32, i32> = MemoCache::new();
        let source = input.clone();
        let first = cache.acquire(1, move || Subscriber::new(move || source.read()));
        first.get().unwrap();
        assert_eq!(input.listener_count(), 1);

        let second = first.clone();
        assert_eq!(cache.ref_count(&1), 2);

        drop(first);
        assert!(cache.contains(&1));

        let unit = second.subscriber().clone();
        drop(second);
        assert!(cache.is_empty());
        assert!(unit.is_destroyed());
        assert_eq!(input.listener_count(), 0);
    }
}
