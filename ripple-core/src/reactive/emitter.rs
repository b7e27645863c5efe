//! Emitter
//!
//! A minimal listener registry. Every state unit and subscriber owns one;
//! `emit` notifies all current listeners synchronously, in registration order.
//!
//! Listeners are plain `Fn()` callbacks. They learn *that* something changed
//! and read the new value themselves, which keeps the emitter free of the
//! value type and lets [`Observable::snapshot`] be the single source of truth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::value::Snapshot;

/// A change listener.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Identifies one registration on one emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

struct Shared {
    listeners: Mutex<IndexMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

/// A synchronous listener registry.
#[derive(Clone)]
pub struct Emitter {
    shared: Arc<Shared>,
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: Mutex::new(IndexMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `listener` and return a handle that removes it on drop.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.add(Arc::new(listener));
        Subscription {
            emitter: Arc::downgrade(&self.shared),
            id: Some(id),
        }
    }

    /// Register a shared listener without a handle.
    ///
    /// Adding the same `Arc` twice returns the existing registration.
    pub fn add(&self, listener: Listener) -> ListenerId {
        let mut listeners = self.shared.listeners.lock();
        if let Some((id, _)) = listeners
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, &listener))
        {
            return *id;
        }
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        listeners.insert(id, listener);
        id
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.shared.listeners.lock().shift_remove(&id).is_some()
    }

    /// Call every listener registered at the time of the call.
    ///
    /// The set is copied first: listeners may subscribe or unsubscribe while
    /// being notified without affecting this round.
    pub fn emit(&self) {
        let listeners: SmallVec<[Listener; 4]> =
            self.shared.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }

    pub fn size(&self) -> usize {
        self.shared.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.shared.listeners.lock().clear();
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a listener registration.
///
/// Dropping the handle unsubscribes. Use [`Subscription::detach`] to keep the
/// listener for the lifetime of the emitter.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    emitter: Weak<Shared>,
    id: Option<ListenerId>,
}

impl Subscription {
    /// A subscription that is not attached to anything.
    pub fn inert() -> Self {
        Self {
            emitter: Weak::new(),
            id: None,
        }
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        match (self.emitter.upgrade(), self.id) {
            (Some(shared), Some(id)) => shared.listeners.lock().contains_key(&id),
            _ => false,
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Leave the listener registered forever.
    pub fn detach(mut self) {
        self.id = None;
    }

    fn release(&mut self) {
        if let (Some(shared), Some(id)) = (self.emitter.upgrade(), self.id.take()) {
            shared.listeners.lock().shift_remove(&id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// The external subscribe/snapshot contract consumed by rendering layers.
///
/// `snapshot` is never older than the most recent emission: a listener that
/// calls it from inside its callback sees the value it was notified about.
pub trait Observable<T> {
    fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static;

    fn snapshot(&self) -> Snapshot<T>;

    /// The value a renderer can show before any subscription exists.
    fn initial_snapshot(&self) -> Option<Snapshot<T>> {
        None
    }

    fn listener_count(&self) -> usize;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn emits_in_registration_order() {
        let emitter = Emitter::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let log = Arc::clone(&log);
                emitter.subscribe(move || log.lock().unwrap().push(i))
            })
            .collect();

        emitter.emit();
        emitter.emit();

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(emitter.size(), 3);
        drop(subs);
        assert_eq!(emitter.size(), 0);
    }

    #[test]
    fn unsubscribe_and_detach() {
        let emitter = Emitter::new();

        let first = emitter.subscribe(|| {});
        let second = emitter.subscribe(|| {});
        assert!(first.is_active());

        first.unsubscribe();
        second.detach();
        assert_eq!(emitter.size(), 1);

        emitter.clear();
        assert!(emitter.is_empty());
    }

    #[test]
    fn shared_listener_is_registered_once() {
        let emitter = Emitter::new();
        let listener: Listener = Arc::new(|| {});

        let a = emitter.add(Arc::clone(&listener));
        let b = emitter.add(Arc::clone(&listener));
        assert_eq!(a, b);
        assert_eq!(emitter.size(), 1);

        assert!(emitter.remove(a));
        assert!(!emitter.remove(a));
    }

    #[test]
    fn listeners_added_during_emit_wait_for_next_round() {
        let emitter = Emitter::new();
        let calls = Arc::new(StdMutex::new(0));
        let late = Arc::new(StdMutex::new(Vec::new()));

        let inner = emitter.clone();
        let calls_outer = Arc::clone(&calls);
        let late_outer = Arc::clone(&late);
        let _sub = emitter.subscribe(move || {
            *calls_outer.lock().unwrap() += 1;
            let calls = Arc::clone(&calls_outer);
            late_outer
                .lock()
                .unwrap()
                .push(inner.subscribe(move || *calls.lock().unwrap() += 100));
        });

        emitter.emit();
        assert_eq!(*calls.lock().unwrap(), 1);

        emitter.emit();
        assert_eq!(*calls.lock().unwrap(), 102);
    }

    #[test]
    fn subscription_outliving_emitter_is_harmless() {
        let emitter = Emitter::new();
        let sub = emitter.subscribe(|| {});
        drop(emitter);
        assert!(!sub.is_active());
        drop(sub);
        assert!(!Subscription::inert().is_active());
    }
}
