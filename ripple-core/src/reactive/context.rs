//! Ambient Context
//!
//! A [`Context`] carries an ambient value down the call stack without
//! threading it through every function signature. The dependency tracker is
//! built on it, but contexts are generic and usable on their own.
//!
//! # Implementation
//!
//! Every thread keeps one stack per context instance. [`Context::run`] pushes
//! a value, runs the closure and pops it again through a guard, so the stack
//! stays balanced even if the closure panics. This design supports nesting:
//! an inner `run` restores the outer value on exit.
//!
//! A call stack does not survive an `.await`. [`Context::scope`] therefore
//! wraps a future and re-installs the value around *each poll*, popping it
//! before the poll returns. Interleaved tasks never observe each other's
//! values, and the ambient value is "restored" only once the future settles.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context as TaskContext, Poll};

thread_local! {
    /// Per-thread stacks, keyed by context instance id.
    static STACKS: RefCell<HashMap<u64, Vec<Box<dyn Any>>>> = RefCell::new(HashMap::new());
}

fn next_context_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A stack-disciplined ambient value with a default.
///
/// Clones share the same stack (same instance id).
#[derive(Clone)]
pub struct Context<T> {
    id: u64,
    default: T,
}

impl<T> Context<T>
where
    T: Clone + 'static,
{
    /// Create a context whose value is `default` whenever no `run` is active.
    pub fn new(default: T) -> Self {
        Self {
            id: next_context_id(),
            default,
        }
    }

    /// Run `f` with `value` as the ambient value.
    pub fn run<R>(&self, value: T, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter(value);
        f()
    }

    /// The asynchronous `run`: `value` is ambient during every poll of `fut`.
    pub fn scope<F: Future>(&self, value: T, fut: F) -> Scoped<T, F> {
        Scoped {
            context_id: self.id,
            value,
            inner: Box::pin(fut),
        }
    }

    /// The current ambient value, or the default outside any `run`.
    pub fn current(&self) -> T {
        self.try_current().unwrap_or_else(|| self.default.clone())
    }

    /// The current ambient value, or `None` outside any `run`.
    pub fn try_current(&self) -> Option<T> {
        STACKS.with(|stacks| {
            stacks
                .borrow()
                .get(&self.id)
                .and_then(|stack| stack.last())
                .and_then(|value| value.downcast_ref::<T>())
                .cloned()
        })
    }

    /// Check if a `run`/`scope` of this context is active on this thread.
    pub fn is_active(&self) -> bool {
        STACKS.with(|stacks| {
            stacks
                .borrow()
                .get(&self.id)
                .is_some_and(|stack| !stack.is_empty())
        })
    }

    /// Nesting depth of this context on the current thread.
    pub fn depth(&self) -> usize {
        STACKS.with(|stacks| stacks.borrow().get(&self.id).map_or(0, Vec::len))
    }

    /// True if any active value on the stack (not just the innermost) matches.
    pub fn any(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        STACKS.with(|stacks| {
            stacks.borrow().get(&self.id).is_some_and(|stack| {
                stack
                    .iter()
                    .filter_map(|value| value.downcast_ref::<T>())
                    .any(&mut predicate)
            })
        })
    }

    /// Capture the ambient value now and reinstate it on every later call.
    ///
    /// Use this for callbacks that will run from a timer, a spawned task or
    /// any other place the current call stack does not reach.
    pub fn wrap<R>(&self, f: impl Fn() -> R) -> impl Fn() -> R {
        let captured = self.current();
        let context = self.clone();
        move || context.run(captured.clone(), &f)
    }

    /// Capture the ambient value now and make it ambient for `fut`.
    pub fn wrap_future<F: Future>(&self, fut: F) -> Scoped<T, F> {
        self.scope(self.current(), fut)
    }

    fn enter(&self, value: T) -> ContextGuard {
        let depth = STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let stack = stacks.entry(self.id).or_default();
            stack.push(Box::new(value));
            stack.len()
        });
        ContextGuard {
            context_id: self.id,
            depth,
        }
    }
}

/// Pops the value pushed by `enter` when dropped.
struct ContextGuard {
    context_id: u64,
    depth: usize,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            if let Some(stack) = stacks.get_mut(&self.context_id) {
                // Guards are dropped in reverse order of creation; a mismatch
                // means a guard escaped its scope.
                debug_assert_eq!(
                    stack.len(),
                    self.depth,
                    "context stack mismatch for context {}",
                    self.context_id
                );
                stack.pop();
                if stack.is_empty() {
                    stacks.remove(&self.context_id);
                }
            }
        });
    }
}

/// Future returned by [`Context::scope`] and [`Context::wrap_future`].
pub struct Scoped<T, F> {
    context_id: u64,
    value: T,
    inner: Pin<Box<F>>,
}

// `inner` is boxed and `value` is never pinned, so moving a `Scoped` is fine.
impl<T, F> Unpin for Scoped<T, F> {}

impl<T, F> Future for Scoped<T, F>
where
    T: Clone + 'static,
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let context = Context {
            id: this.context_id,
            default: this.value.clone(),
        };
        let _guard = context.enter(this.value.clone());
        this.inner.as_mut().poll(cx)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
