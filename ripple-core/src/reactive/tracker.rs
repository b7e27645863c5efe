//! Dependency Tracking
//!
//! While a subscriber evaluates, a [`Tracker`] is ambient on the
//! [`tracking`] context. Every tracked read (`State::read`,
//! `Subscriber::read`, ...) records itself on the innermost tracker, which
//! attaches the enclosing subscriber as a dependent of the unit that was
//! read. Recording is deduplicated per evaluation, so reading the same unit
//! twice registers one dependency.
//!
//! Because the tracker lives on a [`Context`], it survives await points of
//! asynchronous bodies when the body future is wrapped with
//! [`Context::scope`].

use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexSet;
use parking_lot::Mutex;

use super::context::Context;
use super::emitter::{Listener, ListenerId};
use super::id::UnitId;

/// A unit that can be depended upon.
pub trait Dependency: Send + Sync {
    fn id(&self) -> UnitId;

    /// Version of the unit's current value.
    ///
    /// Derived units bring themselves up to date before answering, so the
    /// version never describes a value that is already stale.
    fn current_version(&self) -> u64;

    /// Register a change listener on the unit's emitter.
    fn listen(&self, listener: Listener) -> ListenerId;

    fn unlisten(&self, id: ListenerId);
}

/// Receives the dependencies recorded by a [`Tracker`].
pub(crate) trait DependencySink: Send + Sync {
    fn attach(&self, generation: u64, source: Arc<dyn Dependency>, version: u64);
}

/// Records the reads made by one evaluation of one subscriber.
pub struct Tracker {
    owner: UnitId,
    generation: u64,
    sink: Weak<dyn DependencySink>,
    reads: Mutex<IndexSet<UnitId>>,
}

impl Tracker {
    pub(crate) fn new(owner: UnitId, generation: u64, sink: Weak<dyn DependencySink>) -> Self {
        Self {
            owner,
            generation,
            sink,
            reads: Mutex::new(IndexSet::new()),
        }
    }

    /// The subscriber this tracker evaluates for.
    pub fn owner(&self) -> UnitId {
        self.owner
    }

    /// Record a read of `source` at `version`.
    ///
    /// Only the first read of a given unit reaches the sink.
    pub fn record(&self, source: Arc<dyn Dependency>, version: u64) {
        if !self.reads.lock().insert(source.id()) {
            return;
        }
        if let Some(sink) = self.sink.upgrade() {
            sink.attach(self.generation, source, version);
        }
    }

    /// Whether `id` was read during this evaluation.
    pub fn has_read(&self, id: UnitId) -> bool {
        self.reads.lock().contains(&id)
    }

    /// Units read so far, in first-read order.
    pub fn reads(&self) -> Vec<UnitId> {
        self.reads.lock().iter().copied().collect()
    }
}

/// The tracking context shared by all units.
///
/// Holds `None` outside of any evaluation.
pub fn tracking() -> &'static Context<Option<Arc<Tracker>>> {
    static TRACKING: OnceLock<Context<Option<Arc<Tracker>>>> = OnceLock::new();
    TRACKING.get_or_init(|| Context::new(None))
}

/// The innermost active tracker, if any.
pub fn current_tracker() -> Option<Arc<Tracker>> {
    tracking().try_current().flatten()
}

/// True while `id` is evaluating anywhere on the current stack.
pub(crate) fn is_evaluating(id: UnitId) -> bool {
    tracking().any(|tracker| tracker.as_ref().is_some_and(|t| t.owner == id))
}

/// Run `f` with tracking suspended: reads inside do not register dependencies.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    tracking().run(None, f)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
