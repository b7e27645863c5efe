//! State Implementation
//!
//! A [`State`] is the writable reactive primitive. It holds a value and an
//! emitter; subscribers that read it while evaluating become its dependents.
//!
//! # How State Works
//!
//! 1. A tracked read (`read`, `read_with`, `track`) records the state on the
//!    innermost tracker, which attaches the evaluating subscriber as a
//!    listener.
//!
//! 2. A write stores the new value, bumps the version and schedules the state
//!    on its runtime. Writes are visible immediately to readers.
//!
//! 3. On flush, the state emits once no matter how many writes happened, and
//!    dependents re-evaluate.
//!
//! # Async Values
//!
//! `set_future` caches a pending snapshot until the future resolves. A newer
//! write supersedes the future: it is aborted and its result discarded, while
//! waiters on the pending value receive whatever is written next.
//!
//! # Memory Layout
//!
//! Each state consists of:
//! - A unique id and an optional debug name
//! - The cached snapshot, plus the initializer until it has run
//! - A version counter, bumped on every change
//! - An emitter and a handle to the runtime it was created on

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use super::cancel::Cancellable;
use super::emitter::{Emitter, Listener, ListenerId, Observable, Subscription};
use super::id::UnitId;
use super::runtime::{Node, Runtime};
use super::subscriber::Subscriber;
use super::tracker::{current_tracker, Dependency};
use super::value::{Settlement, Snapshot};
use crate::error::{ReactiveError, Result};

enum Init<T> {
    Lazy(Box<dyn FnOnce() -> T + Send>),
    Future(BoxFuture<'static, Result<T>>),
}

struct StateCell<T> {
    value: Option<Snapshot<T>>,
    init: Option<Init<T>>,
    settlement: Settlement<T>,
}

struct StateInner<T> {
    id: UnitId,
    name: Option<Arc<str>>,
    cell: Mutex<StateCell<T>>,
    /// Only written while `cell` is locked.
    version: AtomicU64,
    initial: Option<T>,
    emitter: Emitter,
    cancel: Cancellable,
    runtime: Runtime,
    destroyed: AtomicBool,
}

/// A reactive state unit holding a value of type `T`.
///
/// Cloning a `State` yields another handle to the same unit.
///
/// # Example
///
/// ```rust,ignore
/// let count = State::new(0);
/// let doubled = count.select(|n| n * 2);
///
/// count.set(5);
/// assert_eq!(doubled.get()?, 10);
/// ```
pub struct State<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<StateInner<T>>,
}

impl<T> Clone for State<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> State<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a state with a ready value.
    pub fn new(value: T) -> Self {
        Self::build(None, Some(Snapshot::Ready(value.clone())), None, Some(value))
    }

    /// Create a state with a debug name.
    pub fn named(name: impl Into<Arc<str>>, value: T) -> Self {
        Self::build(
            Some(name.into()),
            Some(Snapshot::Ready(value.clone())),
            None,
            Some(value),
        )
    }

    /// Create a state whose value is computed on first access.
    pub fn lazy<F>(init: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::build(None, None, Some(Init::Lazy(Box::new(init))), None)
    }

    /// Create a state whose value comes from a future, started on first access.
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::build(None, None, Some(Init::Future(fut.boxed())), None)
    }

    fn build(
        name: Option<Arc<str>>,
        value: Option<Snapshot<T>>,
        init: Option<Init<T>>,
        initial: Option<T>,
    ) -> Self {
        let id = UnitId::new();
        let runtime = Runtime::current();
        let inner = Arc::new(StateInner {
            id,
            name,
            cell: Mutex::new(StateCell {
                value,
                init,
                settlement: Settlement::new(id),
            }),
            version: AtomicU64::new(0),
            initial,
            emitter: Emitter::new(),
            cancel: Cancellable::new(),
            runtime: runtime.clone(),
            destroyed: AtomicBool::new(false),
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

    /// Incremented on every change of the cached snapshot.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Tracked reads
    // ------------------------------------------------------------------

    /// Read the value and register the evaluating subscriber as a dependent.
    ///
    /// Fails with `Untracked` outside of an evaluation; use [`State::get`]
    /// for plain reads. A pending value fails with `Pending`.
    pub fn read(&self) -> Result<T> {
        self.track()?.into_result()
    }

    /// Tracked read of the raw snapshot.
    pub fn track(&self) -> Result<Snapshot<T>> {
        let tracker = current_tracker().ok_or(ReactiveError::Untracked(self.inner.id))?;
        let (snapshot, version) = self.inner.observe();
        tracker.record(self.dependency(), version);
        Ok(snapshot)
    }

    /// Tracked read that projects the value without cloning it.
    ///
    /// `f` runs while the value is borrowed and must not access this state.
    pub fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let tracker = current_tracker().ok_or(ReactiveError::Untracked(self.inner.id))?;
        self.inner.observe();
        let (result, version) = {
            let cell = self.inner.cell.lock();
            let result = match &cell.value {
                Some(Snapshot::Ready(value)) => Ok(f(value)),
                Some(Snapshot::Pending(_)) => Err(ReactiveError::Pending),
                Some(Snapshot::Failed(error)) => Err(error.clone()),
                None => Err(ReactiveError::NoValue),
            };
            (result, self.inner.version.load(Ordering::Acquire))
        };
        tracker.record(self.dependency(), version);
        result
    }

    /// Tracked read that waits for a pending value.
    pub async fn read_async(&self) -> Result<T> {
        self.track()?.resolve().await
    }

    // ------------------------------------------------------------------
    // Untracked reads
    // ------------------------------------------------------------------

    /// The current value without registering a dependency.
    pub fn get(&self) -> Result<T> {
        self.snapshot().into_result()
    }

    /// The current value, waiting for a pending one.
    pub async fn get_async(&self) -> Result<T> {
        self.snapshot().resolve().await
    }

    /// The cached snapshot, running the initializer on first access.
    pub fn snapshot(&self) -> Snapshot<T> {
        self.inner.observe().0
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Store `value`, superseding any pending future.
    pub fn set(&self, value: T) {
        if self.is_destroyed() {
            tracing::trace!(unit = %self.inner.id, "ignoring write to destroyed state");
            return;
        }
        self.inner.cancel.cancel();
        self.inner.commit(Ok(value));
    }

    /// Store the result of `f` applied to the current value.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        let current = self.get()?;
        self.set(f(&current));
        Ok(())
    }

    /// Store a failure. Readers get `error` until the next successful write.
    pub fn fail(&self, error: ReactiveError) {
        if self.is_destroyed() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.commit(Err(error));
    }

    /// Replace the value with the eventual output of `fut`.
    ///
    /// The state turns pending immediately. If another write happens before
    /// `fut` resolves, `fut` is aborted and its output discarded.
    pub fn set_future<F>(&self, fut: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if self.is_destroyed() {
            return;
        }
        StateInner::start(&self.inner, fut.boxed(), true);
    }

    // ------------------------------------------------------------------
    // Derivation and lifecycle
    // ------------------------------------------------------------------

    /// A read-only derived unit that emits only when the selected part changes.
    pub fn select<U, F>(&self, selector: F) -> Subscriber<U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        Subscriber::new(move || source.read_with(|value| selector(value)))
    }

    /// Like [`State::select`] with a custom equality.
    pub fn select_with<U, F, E>(&self, selector: F, equals: E) -> Subscriber<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
        E: Fn(&U, &U) -> bool + Send + Sync + 'static,
    {
        let source = self.clone();
        Subscriber::builder()
            .equals(equals)
            .build(move || source.read_with(|value| selector(value)))
    }

    /// Get notified with the value after each change.
    ///
    /// Pending values are skipped; the callback fires once they resolve.
    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Result<T>) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.subscribe(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match inner.observe().0 {
                Snapshot::Ready(value) => callback(Ok(value)),
                Snapshot::Failed(error) => callback(Err(error)),
                Snapshot::Pending(_) => {}
            }
        })
    }

    /// Drop all listeners and abort pending work.
    ///
    /// Later writes are ignored and later subscriptions are inert.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner
            .cell
            .lock()
            .settlement
            .settle(Err(ReactiveError::Destroyed(self.inner.id)));
        self.inner.emitter.clear();
        self.inner.runtime.unregister(self.inner.id);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn dependency(&self) -> Arc<dyn Dependency> {
        Arc::clone(&self.inner) as Arc<dyn Dependency>
    }
}

impl<T> StateInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Current snapshot and the version it belongs to.
    fn observe(self: &Arc<Self>) -> (Snapshot<T>, u64) {
        let init = {
            let mut cell = self.cell.lock();
            if let Some(value) = &cell.value {
                return (value.clone(), self.version.load(Ordering::Acquire));
            }
            cell.init.take()
        };

        match init {
            Some(Init::Lazy(f)) => {
                let value = f();
                let mut cell = self.cell.lock();
                if cell.value.is_none() {
                    cell.value = Some(Snapshot::Ready(value));
                    self.version.fetch_add(1, Ordering::AcqRel);
                }
                let snapshot = cell
                    .value
                    .clone()
                    .unwrap_or(Snapshot::Failed(ReactiveError::NoValue));
                (snapshot, self.version.load(Ordering::Acquire))
            }
            Some(Init::Future(fut)) => {
                let snapshot = Self::start(self, fut, false);
                (snapshot, self.version.load(Ordering::Acquire))
            }
            None => {
                let error = if self.destroyed.load(Ordering::Acquire) {
                    ReactiveError::Destroyed(self.id)
                } else {
                    ReactiveError::NoValue
                };
                (Snapshot::Failed(error), self.version.load(Ordering::Acquire))
            }
        }
    }

    /// Make `fut` the in-flight value and return the pending snapshot.
    fn start(this: &Arc<Self>, fut: BoxFuture<'static, Result<T>>, announce: bool) -> Snapshot<T> {
        let (ticket, guarded) = this.cancel.supersede(fut);

        let snapshot = {
            let mut cell = this.cell.lock();
            cell.init = None;
            let snapshot = Snapshot::Pending(cell.settlement.pending());
            cell.value = Some(snapshot.clone());
            this.version.fetch_add(1, Ordering::AcqRel);
            snapshot
        };
        if announce {
            this.runtime.schedule(this.id);
        }

        let weak = Arc::downgrade(this);
        let task = async move {
            let outcome = guarded.await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(result) if inner.cancel.finish(ticket) => inner.commit(result),
                Ok(_) => {}
                Err(_) => tracing::trace!(unit = %inner.id, "pending value superseded"),
            }
        };

        if let Err(error) = this.runtime.spawn(task) {
            this.cancel.cancel();
            this.commit(Err(error));
            return this
                .cell
                .lock()
                .value
                .clone()
                .unwrap_or(Snapshot::Failed(ReactiveError::NoRuntime));
        }
        snapshot
    }

    /// Store a settled result, wake waiters and schedule an emission.
    fn commit(&self, result: Result<T>) {
        {
            let mut cell = self.cell.lock();
            cell.init = None;
            cell.value = Some(match &result {
                Ok(value) => Snapshot::Ready(value.clone()),
                Err(error) => Snapshot::Failed(error.clone()),
            });
            cell.settlement.settle(result);
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        self.runtime.schedule(self.id);
    }
}

impl<T> Dependency for StateInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> UnitId {
        self.id
    }

    fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn listen(&self, listener: Listener) -> ListenerId {
        self.emitter.add(listener)
    }

    fn unlisten(&self, id: ListenerId) {
        self.emitter.remove(id);
    }
}

impl<T> Node for StateInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> UnitId {
        self.id
    }

    fn process(&self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.emitter.emit();
        }
    }
}

impl<T> Drop for StateInner<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.runtime.unregister(self.id);
    }
}

impl<T> Observable<T> for State<T>
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
        self.inner.emitter.subscribe(listener)
    }

    fn snapshot(&self) -> Snapshot<T> {
        State::snapshot(self)
    }

    fn initial_snapshot(&self) -> Option<Snapshot<T>> {
        self.inner.initial.clone().map(Snapshot::Ready)
    }

    fn listener_count(&self) -> usize {
        self.inner.emitter.size()
    }
}

impl<T> State<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Register a change listener. See [`Observable::subscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        Observable::subscribe(self, listener)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.emitter.size()
    }
}

impl<T> std::fmt::Debug for State<T>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("value", &self.snapshot())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
