//! Snapshots and Pending Values
//!
//! A unit's cached value is always one of three things: ready, pending on a
//! future, or failed. [`Snapshot`] is that cache entry as handed to readers.
//!
//! A pending snapshot carries a [`PendingValue`], a cloneable shared future
//! that resolves with the *next settled value* of the unit. If a pending
//! computation is superseded, waiters are not woken with an abort; they keep
//! waiting and receive the result of whichever computation settles last.

use std::fmt;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

use super::id::UnitId;
use crate::error::{ReactiveError, Result};

/// Shared future resolving with the next settled value of a unit.
pub type PendingValue<T> = Shared<BoxFuture<'static, Result<T>>>;

/// A unit's cached value as seen by a reader.
#[derive(Clone)]
pub enum Snapshot<T> {
    Ready(T),
    Pending(PendingValue<T>),
    Failed(ReactiveError),
}

impl<T> Snapshot<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The ready value, if any.
    pub fn ready(&self) -> Option<&T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Synchronous view: a pending snapshot becomes `Err(Pending)`.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(_) => Err(ReactiveError::Pending),
            Self::Failed(error) => Err(error),
        }
    }

    /// Wait for the value, resolving a pending snapshot.
    pub async fn resolve(self) -> Result<T> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(pending) => pending.await,
            Self::Failed(error) => Err(error),
        }
    }

    /// Project a ready value; pending and failed snapshots pass through.
    pub fn map<U, F>(self, f: F) -> Snapshot<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Self::Ready(value) => Snapshot::Ready(f(value)),
            Self::Pending(pending) => {
                let mapped: BoxFuture<'static, Result<U>> =
                    async move { pending.await.map(f) }.boxed();
                Snapshot::Pending(mapped.shared())
            }
            Self::Failed(error) => Snapshot::Failed(error),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Pending(_) => f.write_str("Pending"),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// The producing side of a unit's [`PendingValue`].
///
/// One settlement spans any number of superseding computations: `pending`
/// hands out the same shared future until `settle` is called.
pub(crate) struct Settlement<T> {
    owner: UnitId,
    sender: Option<oneshot::Sender<Result<T>>>,
    pending: Option<PendingValue<T>>,
}

impl<T> Settlement<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(owner: UnitId) -> Self {
        Self {
            owner,
            sender: None,
            pending: None,
        }
    }

    /// The shared future for the next settlement, created on first use.
    pub(crate) fn pending(&mut self) -> PendingValue<T> {
        if let Some(pending) = &self.pending {
            return pending.clone();
        }
        let (tx, rx) = oneshot::channel();
        let owner = self.owner;
        let future: BoxFuture<'static, Result<T>> = rx
            .map(move |received| match received {
                Ok(result) => result,
                Err(_) => Err(ReactiveError::Destroyed(owner)),
            })
            .boxed();
        let shared = future.shared();
        self.sender = Some(tx);
        self.pending = Some(shared.clone());
        shared
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.sender.is_some()
    }

    /// Wake every waiter with `result`. A no-op if nobody asked for a future.
    pub(crate) fn settle(&mut self, result: Result<T>) {
        self.pending = None;
        if let Some(tx) = self.sender.take() {
            // The receiver is gone only if every waiter was dropped.
            let _ = tx.send(result);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
