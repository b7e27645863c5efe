//! Reactive Runtime
//!
//! The runtime connects units to the scheduler. Every state unit and
//! subscriber registers with the runtime of the thread it was created on and
//! keeps a handle to it.
//!
//! # How It Works
//!
//! 1. When a state changes, it asks its runtime to schedule its id.
//!
//! 2. Ids are queued on a [`Batcher`]. Scheduling the same id several times
//!    before the flush collapses into one entry.
//!
//! 3. On flush, the runtime looks each id up in its registry and calls
//!    [`Node::process`]:
//!    a. A state emits to its listeners
//!    b. A subscriber re-evaluates if an input changed, then emits if its
//!       own value changed
//!    c. Listeners of a subscriber's inputs schedule the subscriber, so the
//!       cascade continues in the next pass
//!
//! Items scheduled during a pass run in follow-up passes of the same flush,
//! so a chain of derived units settles within one tick.
//!
//! # Flush Strategy
//!
//! The thread's default runtime defers every flush to the next tick. Writes
//! made in a burst from async code then cost one propagation, and nothing
//! runs inside the writer's call. [`Runtime::with_strategy`] builds a runtime
//! with another [`FlushStrategy`]; `Adaptive` flushes a lone write right
//! away when the runtime has been quiet, which suits code that reads back
//! immediately after writing. [`Runtime::enter`] makes such a runtime the
//! current one while units are created, and those units keep it.
//!
//! # Thread Safety
//!
//! The runtime is per thread, but a unit keeps using the runtime it was
//! created on. Units and the registry are `Send + Sync`, so a flush may run
//! on whichever tokio worker picked up the deferred flush task.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::id::UnitId;
use crate::error::{ReactiveError, Result};
use crate::schedule::{Batcher, BatcherOptions, FlushStrategy, HoldGuard, KeyHandlers};

/// Follow-up passes a single flush may run for cascading updates.
const CASCADE_PASSES: usize = 64;

/// A unit the runtime can process on flush.
pub trait Node: Send + Sync {
    fn id(&self) -> UnitId;

    /// Bring the unit up to date and emit if its value changed.
    fn process(&self);
}

type Registry = RwLock<HashMap<UnitId, Weak<dyn Node>>>;

struct RuntimeInner {
    batcher: Batcher<UnitId, ()>,
    registry: Arc<Registry>,
    tasks: Arc<AtomicUsize>,
}

/// Handle to a reactive runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

thread_local! {
    static CURRENT: RefCell<Runtime> = RefCell::new(Runtime::new());
}

impl Runtime {
    /// The default options: next-tick flushes that settle cascades inline.
    pub fn default_options() -> BatcherOptions {
        BatcherOptions {
            strategy: FlushStrategy::Deferred,
            reschedule_count: CASCADE_PASSES,
        }
    }

    pub fn new() -> Self {
        Self::with_options(Self::default_options())
    }

    /// A standalone runtime flushing with `strategy`, cascades still inline.
    pub fn with_strategy(strategy: FlushStrategy) -> Self {
        Self::with_options(BatcherOptions {
            strategy,
            ..Self::default_options()
        })
    }

    /// A standalone runtime with custom flush behavior.
    pub fn with_options(options: BatcherOptions) -> Self {
        let registry: Arc<Registry> = Arc::new(RwLock::new(HashMap::new()));

        let lookup = Arc::clone(&registry);
        let batcher = Batcher::new(options).with_fallback(KeyHandlers::on_finish(
            move |id: &UnitId| {
                let node = lookup.read().get(id).and_then(Weak::upgrade);
                match node {
                    Some(node) => node.process(),
                    None => tracing::trace!(unit = %id, "skipping dropped unit"),
                }
            },
        ));

        Self {
            inner: Arc::new(RuntimeInner {
                batcher,
                registry,
                tasks: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// The runtime of the current thread.
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Run `f` with this runtime as the current one. Units created inside
    /// `f` belong to it for their whole life.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT.with(|current| current.replace(self.clone()));
        let _restore = Restore(Some(previous));
        f()
    }

    pub fn strategy(&self) -> FlushStrategy {
        self.inner.batcher.options().strategy
    }

    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a unit so scheduled ids can be resolved to it.
    pub fn register(&self, node: Weak<dyn Node>, id: UnitId) {
        self.inner.registry.write().insert(id, node);
    }

    pub fn unregister(&self, id: UnitId) {
        self.inner.registry.write().remove(&id);
    }

    pub fn is_registered(&self, id: UnitId) -> bool {
        self.inner.registry.read().contains_key(&id)
    }

    /// Queue `id` for processing on the next flush.
    pub fn schedule(&self, id: UnitId) {
        self.inner.batcher.schedule(id, ());
    }

    /// Run `f` with automatic flushing suspended, then flush synchronously.
    ///
    /// Any number of writes inside `f` produce at most one emission per unit.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _hold = self.hold();
        f()
    }

    /// Suspend automatic flushing until the guard drops.
    pub fn hold(&self) -> HoldGuard<UnitId, ()> {
        self.inner.batcher.hold()
    }

    /// Flush everything queued right now.
    pub fn flush(&self) {
        self.inner.batcher.flush();
    }

    /// No queued work and no pending flush.
    pub fn is_idle(&self) -> bool {
        self.inner.batcher.is_idle()
    }

    /// Number of spawned tasks that have not completed yet.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.load(Ordering::SeqCst)
    }

    /// Spawn reactive work on the ambient tokio runtime.
    pub fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| ReactiveError::NoRuntime)?;
        self.inner.tasks.fetch_add(1, Ordering::SeqCst);
        let task = TaskGuard(Arc::clone(&self.inner.tasks));
        Ok(handle.spawn(async move {
            let _task = task;
            fut.await
        }))
    }

    /// Wait until every flush and every spawned task of this runtime is done.
    pub async fn settled(&self) {
        loop {
            if self.pending_tasks() > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
            // Let pending deferred flushes run before checking.
            tokio::task::yield_now().await;
            if self.pending_tasks() == 0 && self.is_idle() {
                return;
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Reinstates the previous current runtime, also on unwind.
struct Restore(Option<Runtime>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            let _ = CURRENT.try_with(|current| current.replace(previous));
        }
    }
}

/// Decrements the task counter when a spawned task finishes or is dropped.
struct TaskGuard(Arc<AtomicUsize>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Batch writes on the current thread's runtime.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Runtime::current().batch(f)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::State;

    struct MockNode {
        id: UnitId,
        processed: AtomicUsize,
    }

    impl MockNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: UnitId::new(),
                processed: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.processed.load(Ordering::SeqCst)
        }
    }

    impl Node for MockNode {
        fn id(&self) -> UnitId {
            self.id
        }

        fn process(&self) {
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register(runtime: &Runtime, node: &Arc<MockNode>) {
        let weak: Weak<dyn Node> = Arc::downgrade(node) as Weak<dyn Node>;
        runtime.register(weak, node.id);
    }

    #[test]
    fn runtime_registers_and_unregisters() {
        let runtime = Runtime::new();
        let node = MockNode::new();

        register(&runtime, &node);
        assert!(runtime.is_registered(node.id));

        runtime.unregister(node.id);
        assert!(!runtime.is_registered(node.id));
    }

    #[test]
    fn batch_collapses_schedules() {
        let runtime = Runtime::new();
        let node = MockNode::new();
        register(&runtime, &node);

        runtime.batch(|| {
            runtime.schedule(node.id);
            runtime.schedule(node.id);
            runtime.schedule(node.id);
            assert_eq!(node.count(), 0);
        });

        assert_eq!(node.count(), 1);
        assert!(runtime.is_idle());
    }

    #[tokio::test]
    async fn schedule_flushes_on_next_tick() {
        let runtime = Runtime::new();
        let node = MockNode::new();
        register(&runtime, &node);

        runtime.schedule(node.id);
        runtime.schedule(node.id);
        assert_eq!(node.count(), 0);

        runtime.settled().await;
        assert_eq!(node.count(), 1);
    }

    #[test]
    fn dropped_nodes_are_skipped() {
        let runtime = Runtime::new();
        let node = MockNode::new();
        let id = node.id;
        register(&runtime, &node);
        drop(node);

        runtime.schedule(id);
        assert!(runtime.is_idle());
    }

    #[tokio::test]
    async fn spawned_tasks_are_counted() {
        let runtime = Runtime::new();
        let handle = runtime
            .spawn(async { tokio::time::sleep(Duration::from_millis(5)).await })
            .unwrap();
        assert_eq!(runtime.pending_tasks(), 1);

        handle.await.unwrap();
        assert_eq!(runtime.pending_tasks(), 0);
    }

    #[test]
    fn spawn_without_tokio_fails() {
        let runtime = Runtime::new();
        assert!(matches!(
            runtime.spawn(async {}),
            Err(ReactiveError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn entered_runtime_owns_units_created_inside() {
        let adaptive = Runtime::with_strategy(FlushStrategy::adaptive());
        let quick = adaptive.enter(|| {
            assert!(Runtime::current().ptr_eq(&adaptive));
            State::new(1)
        });
        assert!(!Runtime::current().ptr_eq(&adaptive));
        assert_eq!(Runtime::current().strategy(), FlushStrategy::Deferred);
        let deferred = State::new(1);

        let quick_hits = Arc::new(AtomicUsize::new(0));
        let deferred_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&quick_hits);
        let _a = quick.subscribe(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let hits = Arc::clone(&deferred_hits);
        let _b = deferred.subscribe(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        // An idle adaptive runtime delivers inside `set`; the default waits a tick.
        quick.set(2);
        deferred.set(2);
        assert_eq!(quick_hits.load(Ordering::SeqCst), 1);
        assert_eq!(deferred_hits.load(Ordering::SeqCst), 0);

        Runtime::current().settled().await;
        assert_eq!(deferred_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enter_restores_on_panic() {
        let other = Runtime::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            other.enter(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!Runtime::current().ptr_eq(&other));
    }

    #[test]
    fn current_is_stable_per_thread() {
        let a = Runtime::current();
        let b = Runtime::current();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        let other = std::thread::spawn(|| Runtime::current().inner.registry.read().len())
            .join()
            .unwrap();
        assert_eq!(other, 0);
    }
}
