//! Cancellation of Superseded Futures
//!
//! A unit that starts asynchronous work (a state's `set_future`, an async
//! subscriber evaluation, a live query re-run) owns a [`Cancellable`]. Each
//! new piece of work supersedes the previous one: the previous future is
//! aborted and its result, should it still arrive, is discarded.
//!
//! Cancellation is cooperative. Aborting stops polling the future; I/O that
//! the future already handed off elsewhere still completes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{AbortHandle, Abortable, Aborted, FutureExt};
use parking_lot::Mutex;

use crate::error::{ReactiveError, Result};

/// Identifies one piece of work started through a [`Cancellable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// Tracks the single in-flight future of one owner.
#[derive(Default)]
pub struct Cancellable {
    current: Mutex<Option<(Ticket, AbortHandle)>>,
    counter: AtomicU64,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fut` the in-flight work, aborting whatever was in flight before.
    ///
    /// The returned future yields `Err(ReactiveError::Aborted)` if it is
    /// superseded or cancelled before completing.
    pub fn supersede<F>(&self, fut: F) -> (Ticket, impl Future<Output = Result<F::Output>>)
    where
        F: Future,
    {
        let (handle, registration) = AbortHandle::new_pair();
        let ticket = Ticket(self.counter.fetch_add(1, Ordering::Relaxed) + 1);

        let previous = self.current.lock().replace((ticket, handle));
        if let Some((old, handle)) = previous {
            tracing::trace!(ticket = old.0, "superseding in-flight future");
            handle.abort();
        }

        let guarded = Abortable::new(fut, registration)
            .map(|outcome| outcome.map_err(|Aborted| ReactiveError::Aborted));
        (ticket, guarded)
    }

    /// Abort the in-flight work, if any. Returns whether anything was aborted.
    pub fn cancel(&self) -> bool {
        match self.current.lock().take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether `ticket` is still the in-flight work.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        matches!(&*self.current.lock(), Some((current, _)) if *current == ticket)
    }

    /// Retire `ticket` after it completed.
    ///
    /// Returns false if the work was superseded meanwhile, in which case its
    /// result must be discarded.
    pub fn finish(&self, ticket: Ticket) -> bool {
        let mut current = self.current.lock();
        match &*current {
            Some((active, _)) if *active == ticket => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.current.lock().is_some()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
