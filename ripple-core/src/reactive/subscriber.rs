//! Subscriber Implementation
//!
//! A [`Subscriber`] is a derived unit: it wraps a body that reads other units
//! and caches the result. Which units the body reads is discovered at run
//! time by the tracker, and re-discovered on every evaluation.
//!
//! # How Subscribers Work
//!
//! 1. On first access, the body runs under a fresh tracker. Every tracked
//!    read attaches this subscriber as a listener of the unit that was read,
//!    remembering the version it saw.
//!
//! 2. When accessed again, the cached value is returned unless a dependency's
//!    current version differs from the one recorded.
//!
//! 3. When a dependency emits, the subscriber is marked "maybe dirty" and
//!    scheduled. On flush it re-checks versions and recomputes only if an
//!    input actually changed.
//!
//! 4. After an evaluation settles, dependencies that were not read this time
//!    are unsubscribed.
//!
//! 5. If the new value equals the cached one (per the configured equality),
//!    nothing is emitted and the version stays the same, so dependents do not
//!    recompute either.
//!
//! # Async Bodies
//!
//! An async body caches a pending snapshot while it runs. The tracker stays
//! ambient across its await points. A dependency change while the body is in
//! flight aborts it and starts a new evaluation; the aborted result is never
//! observed.
//!
//! # Thread Safety
//!
//! Internal state sits behind a `parking_lot` mutex that is never held while
//! the body or a listener runs.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::cancel::Cancellable;
use super::emitter::{Emitter, Listener, ListenerId, Observable, Subscription};
use super::id::UnitId;
use super::runtime::{Node, Runtime};
use super::tracker::{current_tracker, is_evaluating, tracking, Dependency, DependencySink, Tracker};
use super::value::{Settlement, Snapshot};
use crate::error::{ReactiveError, Result};

type SyncBody<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;
type AsyncBody<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
type Equals<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

enum Body<T> {
    Sync(SyncBody<T>),
    Async(AsyncBody<T>),
}

/// Evaluation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    /// A synchronous body is running.
    Evaluating,
    /// An asynchronous body is in flight, or a dependency is pending.
    Pending,
}

/// Dirty state for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// No dependency has emitted since the last evaluation.
    Clean,

    /// A dependency emitted. Need to check versions.
    MaybeDirty,

    /// The subscriber must recompute.
    Dirty,
}

struct DepEntry {
    source: Arc<dyn Dependency>,
    version: u64,
    listener: ListenerId,
}

struct SubscriberCell<T> {
    status: Status,
    dirty: DirtyState,
    value: Option<Snapshot<T>>,
    deps: IndexMap<UnitId, DepEntry>,
    /// Bumped per evaluation; results of older evaluations are dropped.
    generation: u64,
    settlement: Settlement<T>,
    /// The value changed since listeners were last notified.
    pending_emit: bool,
    destroyed: bool,
}

struct SubscriberInner<T> {
    id: UnitId,
    name: Option<Arc<str>>,
    body: Body<T>,
    equals: Option<Equals<T>>,
    cell: Mutex<SubscriberCell<T>>,
    /// Only written while `cell` is locked.
    version: AtomicU64,
    evaluations: AtomicU64,
    emitter: Emitter,
    cancel: Cancellable,
    runtime: Runtime,
    weak: Weak<SubscriberInner<T>>,
    /// Registered on every dependency's emitter.
    dep_listener: Listener,
}

/// A cached derived value that recomputes only when dependencies change.
///
/// Cloning a `Subscriber` yields another handle to the same unit.
pub struct Subscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<SubscriberInner<T>>,
}

impl<T> Clone for Subscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Configures a [`Subscriber`] before construction.
pub struct SubscriberBuilder<T> {
    name: Option<Arc<str>>,
    equals: Option<Equals<T>>,
}

impl<T> SubscriberBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Suppress emissions when `equals(old, new)` holds.
    pub fn equals<E>(mut self, equals: E) -> Self
    where
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.equals = Some(Arc::new(equals));
        self
    }

    /// Suppress emissions of values equal to the cached one.
    pub fn dedupe(self) -> Self
    where
        T: PartialEq,
    {
        self.equals(|old, new| old == new)
    }

    pub fn build<F>(self, body: F) -> Subscriber<T>
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Subscriber::from_parts(self, Body::Sync(Arc::new(body)))
    }

    pub fn build_async<F, Fut>(self, body: F) -> Subscriber<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Subscriber::from_parts(self, Body::Async(Arc::new(move || body().boxed())))
    }
}

impl<T> Subscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a subscriber over a synchronous body.
    ///
    /// The body is not run until the subscriber is first read or subscribed.
    pub fn new<F>(body: F) -> Self
    where
        T: PartialEq,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::builder().dedupe().build(body)
    }

    /// Create a subscriber over an asynchronous body.
    pub fn new_async<F, Fut>(body: F) -> Self
    where
        T: PartialEq,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::builder().dedupe().build_async(body)
    }

    pub fn builder() -> SubscriberBuilder<T> {
        SubscriberBuilder {
            name: None,
            equals: None,
        }
    }

    fn from_parts(builder: SubscriberBuilder<T>, body: Body<T>) -> Self {
        let id = UnitId::new();
        let runtime = Runtime::current();
        let inner = Arc::new_cyclic(|weak: &Weak<SubscriberInner<T>>| {
            let target = weak.clone();
            let dep_listener: Listener = Arc::new(move || {
                if let Some(inner) = target.upgrade() {
                    inner.on_dependency_changed();
                }
            });
            SubscriberInner {
                id,
                name: builder.name,
                body,
                equals: builder.equals,
                cell: Mutex::new(SubscriberCell {
                    status: Status::Idle,
                    dirty: DirtyState::Dirty,
                    value: None,
                    deps: IndexMap::new(),
                    generation: 0,
                    settlement: Settlement::new(id),
                    pending_emit: false,
                    destroyed: false,
                }),
                version: AtomicU64::new(0),
                evaluations: AtomicU64::new(0),
                emitter: Emitter::new(),
                cancel: Cancellable::new(),
                runtime: runtime.clone(),
                weak: weak.clone(),
                dep_listener,
            }
        });
        let node = Arc::downgrade(&inner);
        runtime.register(node, id);
        Self { inner }
    }

    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Version of the cached value. Unchanged by evaluations that produced
    /// an equal value.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// How many times the body has been started.
    pub fn evaluations(&self) -> u64 {
        self.inner.evaluations.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> Status {
        self.inner.cell.lock().status
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.inner.cell.lock().dirty
    }

    /// Units read by the latest settled evaluation.
    pub fn dependencies(&self) -> Vec<UnitId> {
        self.inner.cell.lock().deps.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read the value and register the evaluating subscriber as a dependent.
    ///
    /// Fails with `Untracked` outside of an evaluation and with `Cycle` if
    /// this subscriber is itself evaluating further up the stack.
    pub fn read(&self) -> Result<T> {
        self.track()?.into_result()
    }

    /// Tracked read of the raw snapshot.
    pub fn track(&self) -> Result<Snapshot<T>> {
        let tracker = current_tracker().ok_or(ReactiveError::Untracked(self.inner.id))?;
        if is_evaluating(self.inner.id) {
            return Err(ReactiveError::Cycle(self.inner.id));
        }
        let (snapshot, version) = self.inner.observe();
        tracker.record(Arc::clone(&self.inner) as Arc<dyn Dependency>, version);
        Ok(snapshot)
    }

    /// Tracked read that waits for a pending value.
    pub async fn read_async(&self) -> Result<T> {
        self.track()?.resolve().await
    }

    /// The current value without registering a dependency.
    pub fn get(&self) -> Result<T> {
        self.snapshot().into_result()
    }

    /// The current value, waiting for a pending one.
    pub async fn get_async(&self) -> Result<T> {
        self.snapshot().resolve().await
    }

    /// Bring the value up to date and return it.
    pub fn snapshot(&self) -> Snapshot<T> {
        self.inner.observe().0
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register a change listener. See [`Observable::subscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        Observable::subscribe(self, listener)
    }

    /// Get notified with the value after each change.
    ///
    /// Pending snapshots are never delivered. A notification that finds no
    /// computed value delivers `Err(NoValue)`.
    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Result<T>) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.subscribe(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let value = inner.cell.lock().value.clone();
            match value {
                Some(Snapshot::Ready(value)) => callback(Ok(value)),
                Some(Snapshot::Failed(error)) => callback(Err(error)),
                Some(Snapshot::Pending(_)) => {}
                None => callback(Err(ReactiveError::NoValue)),
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.emitter.size()
    }

    // ------------------------------------------------------------------
    // Derivation and lifecycle
    // ------------------------------------------------------------------

    /// A derived unit that emits only when the selected part changes.
    pub fn select<U, F>(&self, selector: F) -> Subscriber<U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        Subscriber::new(move || source.read().map(|value| selector(&value)))
    }

    /// Force a recomputation on the next flush.
    pub fn invalidate(&self) {
        {
            let mut cell = self.inner.cell.lock();
            if cell.destroyed {
                return;
            }
            cell.dirty = DirtyState::Dirty;
        }
        self.inner.runtime.schedule(self.inner.id);
    }

    /// Unsubscribe from every dependency, drop all listeners and abort any
    /// in-flight evaluation. Waiters on a pending value get `Destroyed`.
    pub fn destroy(&self) {
        let inner = &self.inner;
        let deps = {
            let mut cell = inner.cell.lock();
            if cell.destroyed {
                return;
            }
            cell.destroyed = true;
            cell.generation += 1;
            cell.status = Status::Idle;
            cell.pending_emit = false;
            cell.value = None;
            cell.settlement
                .settle(Err(ReactiveError::Destroyed(inner.id)));
            std::mem::take(&mut cell.deps)
        };
        for entry in deps.into_values() {
            entry.source.unlisten(entry.listener);
        }
        inner.emitter.clear();
        inner.cancel.cancel();
        inner.runtime.unregister(inner.id);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.cell.lock().destroyed
    }
}

impl<T> SubscriberInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Refresh, then return the cached snapshot and its version.
    fn observe(&self) -> (Snapshot<T>, u64) {
        self.pull();
        let cell = self.cell.lock();
        let snapshot = match &cell.value {
            Some(value) => value.clone(),
            None if cell.destroyed => Snapshot::Failed(ReactiveError::Destroyed(self.id)),
            None => Snapshot::Failed(ReactiveError::NoValue),
        };
        (snapshot, self.version.load(Ordering::Acquire))
    }

    /// Refresh on demand. An emission owed to listeners goes through the
    /// runtime so it happens on flush, not inside the reader's call.
    fn pull(&self) {
        self.refresh();
        if self.cell.lock().pending_emit {
            self.runtime.schedule(self.id);
        }
    }

    fn refresh(&self) {
        // Evaluating further up the stack: the caller gets the cached value.
        if is_evaluating(self.id) {
            return;
        }
        if self.is_stale() {
            self.evaluate();
        } else {
            let mut cell = self.cell.lock();
            if cell.dirty == DirtyState::MaybeDirty {
                cell.dirty = DirtyState::Clean;
            }
        }
    }

    fn is_stale(&self) -> bool {
        let deps: SmallVec<[(Arc<dyn Dependency>, u64); 8]> = {
            let cell = self.cell.lock();
            if cell.destroyed {
                return false;
            }
            if cell.value.is_none() || cell.dirty == DirtyState::Dirty {
                return true;
            }
            cell.deps
                .values()
                .map(|entry| (Arc::clone(&entry.source), entry.version))
                .collect()
        };
        // Versions are checked even when clean: a write is visible before its
        // emission is flushed.
        deps.into_iter()
            .any(|(source, seen)| source.current_version() != seen)
    }

    fn evaluate(&self) {
        let generation = {
            let mut cell = self.cell.lock();
            if cell.destroyed {
                return;
            }
            cell.generation += 1;
            cell.status = Status::Evaluating;
            cell.dirty = DirtyState::Clean;
            cell.generation
        };
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let sink: Weak<dyn DependencySink> = self.weak.clone();
        let tracker = Arc::new(Tracker::new(self.id, generation, sink));

        match &self.body {
            Body::Sync(body) => {
                let result = tracking().run(Some(Arc::clone(&tracker)), || body());
                self.settle(generation, &tracker, result);
            }
            Body::Async(body) => {
                let body = Arc::clone(body);
                self.evaluate_async(body, generation, tracker);
            }
        }
    }

    fn evaluate_async(&self, body: AsyncBody<T>, generation: u64, tracker: Arc<Tracker>) {
        // Reads made while the future is created count, as do reads made in
        // any later poll.
        let fut = tracking().run(Some(Arc::clone(&tracker)), || body());
        let scoped = tracking().scope(Some(Arc::clone(&tracker)), fut);
        let (ticket, guarded) = self.cancel.supersede(scoped);

        {
            let mut cell = self.cell.lock();
            if cell.generation != generation {
                return;
            }
            cell.status = Status::Pending;
            if !matches!(cell.value, Some(Snapshot::Pending(_))) {
                let had_value = cell.value.is_some();
                let pending = cell.settlement.pending();
                cell.value = Some(Snapshot::Pending(pending));
                self.version.fetch_add(1, Ordering::AcqRel);
                if had_value {
                    cell.pending_emit = true;
                }
            }
        }

        let weak = self.weak.clone();
        let task_tracker = Arc::clone(&tracker);
        let task = async move {
            let outcome = guarded.await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(result) if inner.cancel.finish(ticket) => {
                    inner.settle(generation, &task_tracker, result);
                    if inner.cell.lock().pending_emit {
                        inner.runtime.schedule(inner.id);
                    }
                }
                Ok(_) => {}
                Err(_) => tracing::trace!(unit = %inner.id, generation, "evaluation superseded"),
            }
        };

        if let Err(error) = self.runtime.spawn(task) {
            self.cancel.cancel();
            self.settle(generation, &tracker, Err(error));
        }
    }

    /// Apply the result of evaluation `generation`.
    fn settle(&self, generation: u64, tracker: &Tracker, result: Result<T>) {
        let mut stale: SmallVec<[(Arc<dyn Dependency>, ListenerId); 4]> = SmallVec::new();
        {
            let mut guard = self.cell.lock();
            let cell = &mut *guard;
            if cell.generation != generation || cell.destroyed {
                return;
            }

            cell.deps.retain(|id, entry| {
                let keep = tracker.has_read(*id);
                if !keep {
                    stale.push((Arc::clone(&entry.source), entry.listener));
                }
                keep
            });

            cell.status = Status::Idle;
            let had_value = cell.value.is_some();
            let changed = match result {
                Ok(value) => {
                    let unchanged = match (&cell.value, &self.equals) {
                        (Some(Snapshot::Ready(old)), Some(equals)) => equals(old, &value),
                        _ => false,
                    };
                    cell.settlement.settle(Ok(value.clone()));
                    if !unchanged {
                        cell.value = Some(Snapshot::Ready(value));
                    }
                    !unchanged
                }
                Err(ReactiveError::Pending) => {
                    // A dependency is pending; its emission re-runs us.
                    cell.status = Status::Pending;
                    if matches!(cell.value, Some(Snapshot::Pending(_))) {
                        false
                    } else {
                        cell.value = Some(Snapshot::Pending(cell.settlement.pending()));
                        true
                    }
                }
                Err(ReactiveError::Aborted) => false,
                Err(error) => {
                    cell.settlement.settle(Err(error.clone()));
                    cell.value = Some(Snapshot::Failed(error));
                    true
                }
            };

            if changed {
                self.version.fetch_add(1, Ordering::AcqRel);
                if had_value {
                    cell.pending_emit = true;
                }
            }
        }

        if !stale.is_empty() {
            tracing::trace!(unit = %self.id, pruned = stale.len(), "dropping unused dependencies");
        }
        for (source, listener) in stale {
            source.unlisten(listener);
        }
    }

    fn on_dependency_changed(&self) {
        {
            let mut cell = self.cell.lock();
            if cell.destroyed {
                return;
            }
            if cell.dirty == DirtyState::Clean {
                cell.dirty = DirtyState::MaybeDirty;
            }
        }
        self.runtime.schedule(self.id);
    }
}

impl<T> DependencySink for SubscriberInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn attach(&self, generation: u64, source: Arc<dyn Dependency>, version: u64) {
        let mut cell = self.cell.lock();
        if cell.generation != generation || cell.destroyed {
            return;
        }
        let id = source.id();
        if let Some(entry) = cell.deps.get_mut(&id) {
            entry.version = version;
            return;
        }
        let listener = source.listen(Arc::clone(&self.dep_listener));
        cell.deps.insert(
            id,
            DepEntry {
                source,
                version,
                listener,
            },
        );
    }
}

impl<T> Dependency for SubscriberInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> UnitId {
        self.id
    }

    fn current_version(&self) -> u64 {
        self.pull();
        self.version.load(Ordering::Acquire)
    }

    fn listen(&self, listener: Listener) -> ListenerId {
        self.emitter.add(listener)
    }

    fn unlisten(&self, id: ListenerId) {
        self.emitter.remove(id);
    }
}

impl<T> Node for SubscriberInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> UnitId {
        self.id
    }

    fn process(&self) {
        if self.cell.lock().destroyed {
            return;
        }
        // Nobody is listening: stay lazy, the next read re-checks versions.
        // An in-flight evaluation still restarts, its waiters must not see
        // a result computed from stale inputs.
        if self.emitter.is_empty() {
            let in_flight = {
                let mut cell = self.cell.lock();
                cell.pending_emit = false;
                cell.status == Status::Pending || cell.settlement.is_waiting()
            };
            if in_flight {
                self.refresh();
                self.cell.lock().pending_emit = false;
            }
            return;
        }
        self.refresh();
        let emit = std::mem::take(&mut self.cell.lock().pending_emit);
        if emit {
            self.emitter.emit();
        }
    }
}

impl<T> Drop for SubscriberInner<T> {
    fn drop(&mut self) {
        for entry in self.cell.get_mut().deps.values() {
            entry.source.unlisten(entry.listener);
        }
        self.cancel.cancel();
        self.runtime.unregister(self.id);
    }
}

impl<T> Observable<T> for Subscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return Subscription::inert();
        }
        // Evaluate first so dependencies are attached before anyone listens.
        self.inner.pull();
        self.inner.emitter.subscribe(listener)
    }

    fn snapshot(&self) -> Snapshot<T> {
        Subscriber::snapshot(self)
    }

    fn listener_count(&self) -> usize {
        self.inner.emitter.size()
    }
}

impl<T> std::fmt::Debug for Subscriber<T>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.inner.cell.lock();
        f.debug_struct("Subscriber")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &cell.status)
            .field("value", &cell.value)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::State;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;
    use std::time::Duration;

    fn counted<T, F>(body: F) -> (Arc<AtomicUsize>, impl Fn() -> Result<T> + Send + Sync + 'static)
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        (runs, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            body()
        })
    }

    #[test]
    fn computes_lazily_and_caches() {
        let count = State::new(2);
        let source = count.clone();
        let (runs, body) = counted(move || Ok(source.read()? * 10));
        let derived = Subscriber::new(body);

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(derived.get().unwrap(), 20);
        assert_eq!(derived.get().unwrap(), 20);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(derived.dependencies(), vec![count.id()]);
    }

    #[test]
    fn recomputes_after_write_without_flush() {
        let count = State::new(1);
        let source = count.clone();
        let derived = Subscriber::new(move || Ok(source.read()? + 1));
        assert_eq!(derived.get().unwrap(), 2);

        let _hold = Runtime::current().hold();
        count.set(5);
        // Not flushed yet, but the read is already consistent.
        assert_eq!(derived.get().unwrap(), 6);
    }

    #[test]
    fn equal_values_do_not_emit() {
        let count = State::new(1);
        let source = count.clone();
        let parity = Subscriber::new(move || Ok(source.read()? % 2));
        let emissions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&emissions);
        let _sub = parity.subscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        count.set(3);
        assert_eq!(emissions.load(Ordering::SeqCst), 0);
        let version = parity.version();

        count.set(4);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
        assert_eq!(parity.version(), version + 1);
    }

    #[test]
    fn dependencies_follow_branches() {
        let use_left = State::new(true);
        let left = State::new("left");
        let right = State::new("right");

        let (flag, l, r) = (use_left.clone(), left.clone(), right.clone());
        let picked = Subscriber::new(move || if flag.read()? { l.read() } else { r.read() });
        let _sub = picked.subscribe(|| {});

        assert_eq!(picked.get().unwrap(), "left");
        assert_eq!(left.listener_count(), 1);
        assert_eq!(right.listener_count(), 0);

        use_left.set(false);
        assert_eq!(picked.get().unwrap(), "right");
        assert_eq!(left.listener_count(), 0);
        assert_eq!(right.listener_count(), 1);

        // Writes to the dropped branch no longer trigger work.
        let before = picked.evaluations();
        left.set("ignored");
        assert_eq!(picked.evaluations(), before);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let slot: Arc<OnceLock<Subscriber<i32>>> = Arc::new(OnceLock::new());
        let me = Arc::clone(&slot);
        let looping = Subscriber::new(move || match me.get() {
            Some(this) => this.read().map(|v| v + 1),
            None => Ok(0),
        });
        let _ = slot.set(looping.clone());

        assert!(matches!(looping.get(), Err(ReactiveError::Cycle(id)) if id == looping.id()));
    }

    #[test]
    fn errors_are_cached_until_inputs_change() {
        let input = State::new(-1);
        let source = input.clone();
        let (runs, body) = counted(move || {
            let value = source.read()?;
            if value < 0 {
                Err(ReactiveError::msg("negative"))
            } else {
                Ok(value)
            }
        });
        let checked = Subscriber::new(body);

        assert_eq!(checked.get().unwrap_err().to_string(), "negative");
        assert_eq!(checked.get().unwrap_err().to_string(), "negative");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        input.set(3);
        assert_eq!(checked.get().unwrap(), 3);
    }

    #[test]
    fn listen_skips_pending_and_reports_values() {
        let input = State::new(1);
        let source = input.clone();
        let derived = Subscriber::new(move || source.read());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = derived.listen(move |value| sink.lock().unwrap().push(value.ok()));

        input.set(2);
        input.fail(ReactiveError::msg("bad"));
        assert_eq!(*seen.lock().unwrap(), vec![Some(2), None]);
    }

    #[test]
    fn destroy_detaches_everything() {
        let input = State::new(1);
        let source = input.clone();
        let derived = Subscriber::new(move || source.read());
        let _sub = derived.subscribe(|| {});
        assert_eq!(input.listener_count(), 1);

        derived.destroy();
        assert_eq!(input.listener_count(), 0);
        assert_eq!(derived.listener_count(), 0);
        assert!(matches!(derived.get(), Err(ReactiveError::Destroyed(_))));
        assert!(!derived.subscribe(|| {}).is_active());
    }

    #[test]
    fn dropping_the_last_handle_detaches_from_inputs() {
        let input = State::new(1);
        let source = input.clone();
        let derived = Subscriber::new(move || source.read());
        derived.get().unwrap();
        assert_eq!(input.listener_count(), 1);

        drop(derived);
        assert_eq!(input.listener_count(), 0);
    }

    #[tokio::test]
    async fn async_body_tracks_across_await() {
        let input = State::new(2);
        let source = input.clone();
        let derived = Subscriber::new_async(move || {
            let source = source.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(source.read()? * 3)
            }
        });

        assert!(derived.snapshot().is_pending());
        assert_eq!(derived.get_async().await.unwrap(), 6);
        assert_eq!(derived.dependencies(), vec![input.id()]);

        input.set(5);
        assert_eq!(derived.get_async().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn dependency_change_supersedes_in_flight_evaluation() {
        let input = State::new(1u64);
        let source = input.clone();
        let derived = Subscriber::new_async(move || {
            let value = source.read();
            async move {
                let value = value?;
                tokio::time::sleep(Duration::from_millis(20 / value)).await;
                Ok(value)
            }
        });
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = derived.listen(move |value| sink.lock().unwrap().push(value.unwrap()));

        input.set(2);
        Runtime::current().settled().await;

        // The slow first evaluation never surfaces.
        assert_eq!(*seen.lock().unwrap(), vec![2]);
        assert_eq!(derived.get().unwrap(), 2);
    }

    #[tokio::test]
    async fn unobserved_waiters_get_the_superseding_result() {
        let input = State::new(1);
        let source = input.clone();
        let derived = Subscriber::new_async(move || {
            let value = source.read();
            async move {
                let value = value?;
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(value * 10)
            }
        });

        let waiting = derived.snapshot();
        assert!(waiting.is_pending());
        assert_eq!(derived.listener_count(), 0);

        input.set(2);
        assert_eq!(waiting.resolve().await.unwrap(), 20);
        assert_eq!(derived.get().unwrap(), 20);
        assert_eq!(derived.evaluations(), 2);
    }

    #[tokio::test]
    async fn pending_dependency_makes_reader_pending() {
        let input = State::new(0);
        let source = input.clone();
        let derived = Subscriber::new(move || Ok(source.read()? + 1));
        let _sub = derived.subscribe(|| {});

        input.set_future(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(10)
        });
        assert!(derived.snapshot().is_pending());

        assert_eq!(derived.get_async().await.unwrap(), 11);
    }
}
