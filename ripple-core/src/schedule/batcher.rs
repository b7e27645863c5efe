//! Keyed Micro-Batcher
//!
//! The batcher collects updates between flushes and delivers them grouped by
//! a correlation key. Scheduling the same key many times within one tick
//! produces one `on_finish` call for that key.
//!
//! # Algorithm
//!
//! 1. `schedule(key, item)` appends the item to the key's queue entry.
//! 2. If no flush is pending, the strategy decides when to flush:
//!    - `Immediate`: now, synchronously.
//!    - `Deferred`: on the next tick, via a spawned tokio task (the task
//!      only runs once the scheduling task yields).
//!    - `Adaptive`: now if the batcher has been idle for a while and the batch
//!      is small, otherwise deferred like `Deferred`.
//! 3. A flush pass takes the whole queue and, per key, calls
//!    `on_resolve_item` for every item and then `on_finish` once.
//! 4. Items scheduled *during* a pass are not part of it. Up to
//!    `reschedule_count` extra passes run inline; anything left after that is
//!    deferred to the next tick.
//!
//! Without a tokio runtime there is no next tick, so deferral degrades to a
//! synchronous flush.

use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;

/// Upper bound on passes of one draining flush.
const MAX_DRAIN_PASSES: usize = 10_000;

/// Called once per scheduled item.
pub type ResolveItem<K, V> = Arc<dyn Fn(&K, V) + Send + Sync>;

/// Called once per key and pass, after the key's items.
pub type Finish<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// When a batch gets flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    /// Flush on the next tick.
    Deferred,
    /// Flush synchronously when the batcher has been idle for at least
    /// `idle_threshold` and the batch holds at most `max_batch` items;
    /// otherwise behave like `Deferred`.
    Adaptive {
        idle_threshold: Duration,
        max_batch: usize,
    },
    /// Flush synchronously on every schedule.
    Immediate,
}

impl FlushStrategy {
    /// `Adaptive` with the default thresholds (400µs, 10 items).
    pub fn adaptive() -> Self {
        Self::Adaptive {
            idle_threshold: Duration::from_micros(400),
            max_batch: 10,
        }
    }
}

impl Default for FlushStrategy {
    fn default() -> Self {
        Self::Deferred
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatcherOptions {
    pub strategy: FlushStrategy,
    /// Extra passes run inline for items scheduled during a pass.
    pub reschedule_count: usize,
}

/// Callbacks registered for one key.
pub struct KeyHandlers<K, V> {
    pub on_resolve_item: Option<ResolveItem<K, V>>,
    pub on_finish: Finish<K>,
}

impl<K, V> KeyHandlers<K, V> {
    pub fn on_finish(f: impl Fn(&K) + Send + Sync + 'static) -> Self {
        Self {
            on_resolve_item: None,
            on_finish: Arc::new(f),
        }
    }

    pub fn with_resolve_item(mut self, f: impl Fn(&K, V) + Send + Sync + 'static) -> Self {
        self.on_resolve_item = Some(Arc::new(f));
        self
    }
}

impl<K, V> Clone for KeyHandlers<K, V> {
    fn clone(&self) -> Self {
        Self {
            on_resolve_item: self.on_resolve_item.clone(),
            on_finish: Arc::clone(&self.on_finish),
        }
    }
}

struct BatchState<K, V> {
    queue: IndexMap<K, Vec<V>>,
    handlers: IndexMap<K, (u64, KeyHandlers<K, V>)>,
    fallback: Option<KeyHandlers<K, V>>,
    next_registration: u64,
    last_flush: Option<Instant>,
    /// A deferred flush task is pending.
    scheduled: bool,
    /// A pass is running.
    flushing: bool,
    /// Active hold guards.
    held: usize,
}

struct Shared<K, V> {
    options: BatcherOptions,
    state: Mutex<BatchState<K, V>>,
}

/// A keyed micro-batcher.
pub struct Batcher<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Batcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// One pass plus the configured inline extra passes.
    Pass,
    /// Loop until the queue is empty.
    Drain,
}

enum Decision {
    Now,
    Defer,
    Nothing,
}

impl<K, V> Batcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new(options: BatcherOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(BatchState {
                    queue: IndexMap::new(),
                    handlers: IndexMap::new(),
                    fallback: None,
                    next_registration: 1,
                    last_flush: None,
                    scheduled: false,
                    flushing: false,
                    held: 0,
                }),
            }),
        }
    }

    /// Handlers used for keys without a registration of their own.
    pub fn with_fallback(self, handlers: KeyHandlers<K, V>) -> Self {
        self.shared.state.lock().fallback = Some(handlers);
        self
    }

    pub fn options(&self) -> BatcherOptions {
        self.shared.options
    }

    /// Install handlers for `key`, replacing any previous registration.
    ///
    /// The handlers stay installed until the returned registration drops.
    pub fn register(&self, key: K, handlers: KeyHandlers<K, V>) -> Registration<K, V> {
        let mut state = self.shared.state.lock();
        let id = state.next_registration;
        state.next_registration += 1;
        state.handlers.insert(key.clone(), (id, handlers));
        Registration {
            shared: Arc::downgrade(&self.shared),
            key,
            id,
        }
    }

    /// Queue `item` under `key` and arrange a flush.
    pub fn schedule(&self, key: K, item: V) {
        let decision = {
            let mut state = self.shared.state.lock();
            state.queue.entry(key).or_default().push(item);
            if state.held > 0 || state.flushing || state.scheduled {
                Decision::Nothing
            } else {
                match self.shared.options.strategy {
                    FlushStrategy::Immediate => Decision::Now,
                    FlushStrategy::Deferred => {
                        state.scheduled = true;
                        Decision::Defer
                    }
                    FlushStrategy::Adaptive {
                        idle_threshold,
                        max_batch,
                    } => {
                        let idle = state
                            .last_flush
                            .map_or(true, |at| at.elapsed() >= idle_threshold);
                        let size: usize = state.queue.values().map(Vec::len).sum();
                        if idle && size <= max_batch {
                            Decision::Now
                        } else {
                            state.scheduled = true;
                            Decision::Defer
                        }
                    }
                }
            }
        };

        match decision {
            Decision::Now => self.run(Mode::Pass),
            Decision::Defer => self.defer(),
            Decision::Nothing => {}
        }
    }

    /// Flush everything queued, including items scheduled while flushing.
    ///
    /// A no-op when called from inside a pass; the running pass picks the
    /// items up.
    pub fn flush(&self) {
        self.run(Mode::Drain);
    }

    /// Suppress automatic flushing until every returned guard is dropped.
    ///
    /// The last guard drains the queue synchronously.
    pub fn hold(&self) -> HoldGuard<K, V> {
        self.shared.state.lock().held += 1;
        HoldGuard {
            batcher: self.clone(),
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued, nothing running, no flush pending.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.queue.is_empty() && !state.flushing && !state.scheduled
    }

    fn defer(&self) {
        match Handle::try_current() {
            Ok(handle) => {
                let flush = DeferredFlush {
                    batcher: self.clone(),
                    armed: true,
                };
                handle.spawn(async move { flush.run() });
            }
            Err(_) => {
                self.shared.state.lock().scheduled = false;
                self.run(Mode::Pass);
            }
        }
    }

    fn run(&self, mode: Mode) {
        let mut passes = 0usize;
        let mut inline_extra = 0usize;

        loop {
            let batch = {
                let mut state = self.shared.state.lock();
                if state.flushing || state.queue.is_empty() {
                    return;
                }
                state.flushing = true;
                std::mem::take(&mut state.queue)
            };

            tracing::trace!(keys = batch.len(), pass = passes, "flushing batch");
            {
                let _flushing = FlushingGuard {
                    shared: &self.shared,
                };
                self.dispatch(batch);
            }
            passes += 1;

            let leftover = {
                let state = self.shared.state.lock();
                !state.queue.is_empty() && state.held == 0
            };
            if !leftover {
                return;
            }

            match mode {
                Mode::Drain => {}
                Mode::Pass if inline_extra < self.shared.options.reschedule_count => {
                    inline_extra += 1;
                    continue;
                }
                Mode::Pass => {
                    if Handle::try_current().is_ok() {
                        let defer = {
                            let mut state = self.shared.state.lock();
                            !std::mem::replace(&mut state.scheduled, true)
                        };
                        if defer {
                            self.defer();
                        }
                        return;
                    }
                }
            }

            if passes >= MAX_DRAIN_PASSES {
                tracing::error!(
                    passes,
                    queued = self.len(),
                    "batch did not settle; items keep rescheduling each other"
                );
                return;
            }
        }
    }

    fn dispatch(&self, batch: IndexMap<K, Vec<V>>) {
        for (key, items) in batch {
            let handlers = {
                let state = self.shared.state.lock();
                state
                    .handlers
                    .get(&key)
                    .map(|(_, handlers)| handlers.clone())
                    .or_else(|| state.fallback.clone())
            };
            let Some(handlers) = handlers else {
                tracing::trace!(items = items.len(), "dropping items for unregistered key");
                continue;
            };

            if let Some(resolve) = &handlers.on_resolve_item {
                for item in items {
                    resolve(&key, item);
                }
            }
            (handlers.on_finish)(&key);
        }
    }
}

/// Keeps per-key handlers installed. Dropping it unregisters them.
pub struct Registration<K, V>
where
    K: Eq + Hash,
{
    shared: Weak<Shared<K, V>>,
    key: K,
    id: u64,
}

impl<K, V> Registration<K, V>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, V> Drop for Registration<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        // Only remove our own registration, not a later replacement.
        if matches!(state.handlers.get(&self.key), Some((id, _)) if *id == self.id) {
            state.handlers.shift_remove(&self.key);
        }
    }
}

/// Resets the flushing flag even if a handler panics.
struct FlushingGuard<'a, K, V> {
    shared: &'a Shared<K, V>,
}

impl<K, V> Drop for FlushingGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.flushing = false;
        state.last_flush = Some(Instant::now());
    }
}

/// A pending next-tick flush.
///
/// If the tokio runtime drops the task before it runs, the scheduled flag is
/// released so a later `schedule` can arrange a new flush.
struct DeferredFlush<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    batcher: Batcher<K, V>,
    armed: bool,
}

impl<K, V> DeferredFlush<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn run(mut self) {
        self.armed = false;
        self.batcher.shared.state.lock().scheduled = false;
        self.batcher.run(Mode::Pass);
    }
}

impl<K, V> Drop for DeferredFlush<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.batcher.shared.state.lock().scheduled = false;
        }
    }
}

/// Returned by [`Batcher::hold`].
pub struct HoldGuard<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    batcher: Batcher<K, V>,
}

impl<K, V> Drop for HoldGuard<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    fn drop(&mut self) {
        let released = {
            let mut state = self.batcher.shared.state.lock();
            state.held = state.held.saturating_sub(1);
            state.held == 0
        };
        if released {
            self.batcher.run(Mode::Drain);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<String>>>;

    fn recording(log: &Log) -> KeyHandlers<&'static str, i32> {
        let items = Arc::clone(log);
        let finish = Arc::clone(log);
        KeyHandlers::on_finish(move |key: &&'static str| {
            finish.lock().unwrap().push(format!("finish {key}"))
        })
        .with_resolve_item(move |key: &&'static str, item: i32| {
            items.lock().unwrap().push(format!("{key}={item}"))
        })
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn immediate_flushes_synchronously() {
        let log = Log::default();
        let batcher = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::Immediate,
            ..Default::default()
        });
        let _reg = batcher.register("a", recording(&log));

        batcher.schedule("a", 1);
        assert_eq!(entries(&log), vec!["a=1", "finish a"]);
        assert!(batcher.is_idle());
    }

    #[test]
    fn deferred_without_runtime_flushes_synchronously() {
        let log = Log::default();
        let batcher = Batcher::new(BatcherOptions::default());
        let _reg = batcher.register("a", recording(&log));

        batcher.schedule("a", 1);
        assert_eq!(entries(&log), vec!["a=1", "finish a"]);
    }

    #[tokio::test]
    async fn deferred_coalesces_one_tick() {
        let log = Log::default();
        let batcher = Batcher::new(BatcherOptions::default());
        let _a = batcher.register("a", recording(&log));
        let _b = batcher.register("b", recording(&log));

        batcher.schedule("a", 1);
        batcher.schedule("b", 10);
        batcher.schedule("a", 2);
        assert!(entries(&log).is_empty());
        assert_eq!(batcher.len(), 3);

        tokio::task::yield_now().await;

        assert_eq!(
            entries(&log),
            vec!["a=1", "a=2", "finish a", "b=10", "finish b"]
        );
        assert!(batcher.is_idle());
    }

    #[tokio::test]
    async fn keys_do_not_see_each_other() {
        let log_a = Log::default();
        let log_b = Log::default();
        let batcher = Batcher::new(BatcherOptions::default());
        let _a = batcher.register("a", recording(&log_a));
        let _b = batcher.register("b", recording(&log_b));

        batcher.schedule("a", 1);
        tokio::task::yield_now().await;

        assert_eq!(entries(&log_a), vec!["a=1", "finish a"]);
        assert!(entries(&log_b).is_empty());
    }

    #[test]
    fn hold_drains_on_release() {
        let log = Log::default();
        let batcher = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::Immediate,
            ..Default::default()
        });
        let _reg = batcher.register("a", recording(&log));

        {
            let _outer = batcher.hold();
            {
                let _inner = batcher.hold();
                batcher.schedule("a", 1);
            }
            batcher.schedule("a", 2);
            assert!(entries(&log).is_empty());
        }

        assert_eq!(entries(&log), vec!["a=1", "a=2", "finish a"]);
    }

    #[test]
    fn reentrant_schedules_run_in_a_later_pass() {
        let passes = Arc::new(StdMutex::new(Vec::new()));
        let batcher: Batcher<u32, ()> = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::Immediate,
            reschedule_count: 0,
        });

        let inner = batcher.clone();
        let seen = Arc::clone(&passes);
        let _reg = batcher.register(
            1,
            KeyHandlers::on_finish(move |key: &u32| {
                seen.lock().unwrap().push(*key);
                if seen.lock().unwrap().len() < 3 {
                    inner.schedule(1, ());
                }
            }),
        );

        // No runtime: leftovers keep flushing synchronously.
        batcher.schedule(1, ());
        assert_eq!(*passes.lock().unwrap(), vec![1, 1, 1]);
        assert!(batcher.is_idle());
    }

    #[tokio::test]
    async fn reschedule_count_bounds_inline_passes() {
        let calls = Arc::new(StdMutex::new(0));
        let batcher: Batcher<u32, ()> = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::Immediate,
            reschedule_count: 1,
        });

        let inner = batcher.clone();
        let counter = Arc::clone(&calls);
        let _reg = batcher.register(
            7,
            KeyHandlers::on_finish(move |_: &u32| {
                let mut calls = counter.lock().unwrap();
                *calls += 1;
                if *calls < 4 {
                    inner.schedule(7, ());
                }
            }),
        );

        batcher.schedule(7, ());
        // First pass plus one inline extra; the rest is deferred.
        assert_eq!(*calls.lock().unwrap(), 2);

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[test]
    fn adaptive_flushes_when_idle() {
        let log = Log::default();
        let batcher = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::adaptive(),
            ..Default::default()
        });
        let _reg = batcher.register("a", recording(&log));

        // Never flushed before, so the batcher counts as idle.
        batcher.schedule("a", 1);
        assert_eq!(entries(&log), vec!["a=1", "finish a"]);
    }

    #[test]
    fn dropped_registration_stops_delivery() {
        let log = Log::default();
        let batcher = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::Immediate,
            ..Default::default()
        });

        let first = batcher.register("a", recording(&log));
        let replacement = batcher.register("a", recording(&log));
        // Dropping the replaced registration must not remove the new one.
        drop(first);
        batcher.schedule("a", 1);
        assert_eq!(entries(&log).len(), 2);

        drop(replacement);
        batcher.schedule("a", 2);
        assert_eq!(entries(&log).len(), 2);
    }

    #[test]
    fn fallback_handles_unregistered_keys() {
        let log = Log::default();
        let batcher = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::Immediate,
            ..Default::default()
        })
        .with_fallback(recording(&log));

        batcher.schedule("z", 5);
        assert_eq!(entries(&log), vec!["z=5", "finish z"]);
    }

    #[test]
    fn panicking_handler_resets_state() {
        let batcher: Batcher<u8, ()> = Batcher::new(BatcherOptions {
            strategy: FlushStrategy::Immediate,
            ..Default::default()
        });
        let _reg = batcher.register(0, KeyHandlers::on_finish(|_: &u8| panic!("handler")));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batcher.schedule(0, ());
        }));
        assert!(result.is_err());
        assert!(batcher.is_idle());
    }
}
