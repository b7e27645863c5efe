//! Live Queries
//!
//! A [`LiveQuery`] keeps the result of a search current as the table
//! changes. Its rows live in a [`State`], so it can be read from subscribers
//! and listened to like any other unit.
//!
//! # Invalidation
//!
//! Every mutation is reported to the table as a [`Mutation`]:
//!
//! - An insert can match any query, so every live query is marked dirty.
//! - An update or delete only dirties the queries whose current result
//!   contains the affected key.
//!
//! Dirty queries are scheduled on the table's [`Batcher`] under their
//! [`ScheduleId`]. However many mutations land in one tick, each dirty query
//! re-runs once. A re-run that is still in flight when the next one starts
//! is superseded and its result discarded.
//!
//! [`Batcher`]: crate::schedule::Batcher

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::document::{Document, RowKey};
use super::search::SearchOptions;
use super::table::TableInner;
use crate::error::{ReactiveError, Result as ReactiveResult, TableResult};
use crate::reactive::{Cancellable, Runtime, Snapshot, State, Subscription};
use crate::schedule::Registration;

/// A change to one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Insert(RowKey),
    Update(RowKey),
    Delete(RowKey),
}

impl Mutation {
    pub fn key(&self) -> &RowKey {
        match self {
            Self::Insert(key) | Self::Update(key) | Self::Delete(key) => key,
        }
    }
}

/// Scheduler key of one live query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduleId {
    pub table: u64,
    pub search: Arc<str>,
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.search)
    }
}

pub(crate) struct LiveShared<T: Document> {
    pub id: ScheduleId,
    pub options: SearchOptions,
    pub keys: Mutex<HashSet<RowKey>>,
    pub state: State<Vec<T>>,
    pub cancel: Cancellable,
    pub runs: AtomicU64,
    pub runtime: Runtime,
    pub registration: Mutex<Option<Registration<ScheduleId, Mutation>>>,
}

impl<T: Document> LiveShared<T> {
    pub fn new(id: ScheduleId, options: SearchOptions, rows: Vec<(RowKey, T)>) -> Self {
        let (keys, values) = split(rows);
        Self {
            state: State::named(format!("live:{id}"), values),
            id,
            options,
            keys: Mutex::new(keys),
            cancel: Cancellable::new(),
            runs: AtomicU64::new(0),
            runtime: Runtime::current(),
            registration: Mutex::new(None),
        }
    }

    /// Whether `mutation` can change this query's result.
    pub fn is_affected_by(&self, mutation: &Mutation) -> bool {
        match mutation {
            Mutation::Insert(_) => true,
            Mutation::Update(key) | Mutation::Delete(key) => self.keys.lock().contains(key),
        }
    }

    fn apply(&self, rows: Vec<(RowKey, T)>) {
        let (keys, values) = split(rows);
        *self.keys.lock() = keys;
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.state.set(values);
    }

    /// Re-run the query in the background, superseding any run in flight.
    pub fn rerun(table: Arc<TableInner<T>>, live: Arc<Self>) {
        let options = live.options.clone();
        let query = async move { table.collect_keyed(&options).await };
        let (ticket, guarded) = live.cancel.supersede(query);

        let task = {
            let live = Arc::clone(&live);
            async move {
                let result = match guarded.await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::trace!(query = %live.id, "live query re-run superseded");
                        return;
                    }
                };
                if !live.cancel.finish(ticket) {
                    return;
                }
                match result {
                    Ok(rows) => {
                        tracing::debug!(query = %live.id, rows = rows.len(), "live query re-ran");
                        live.apply(rows);
                    }
                    Err(error) => {
                        tracing::warn!(query = %live.id, %error, "live query re-run failed");
                        live.runs.fetch_add(1, Ordering::SeqCst);
                        live.state.fail(ReactiveError::from(error));
                    }
                }
            }
        };

        if let Err(error) = live.runtime.spawn(task) {
            live.cancel.cancel();
            tracing::warn!(query = %live.id, %error, "cannot re-run live query");
        }
    }
}

fn split<T>(rows: Vec<(RowKey, T)>) -> (HashSet<RowKey>, Vec<T>) {
    let mut keys = HashSet::with_capacity(rows.len());
    let mut values = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        keys.insert(key);
        values.push(value);
    }
    (keys, values)
}

/// A search whose result follows the table.
///
/// Dropping the handle stops the query from re-running.
pub struct LiveQuery<T: Document> {
    pub(crate) shared: Arc<LiveShared<T>>,
    pub(crate) table: Weak<TableInner<T>>,
}

impl<T: Document> LiveQuery<T> {
    pub fn search_id(&self) -> &str {
        &self.shared.id.search
    }

    pub fn schedule_id(&self) -> &ScheduleId {
        &self.shared.id
    }

    pub fn options(&self) -> &SearchOptions {
        &self.shared.options
    }

    /// The unit holding the rows. Read it inside a subscriber to derive from
    /// the query.
    pub fn state(&self) -> &State<Vec<T>> {
        &self.shared.state
    }

    /// Current rows, or the error of the last failed re-run.
    pub fn rows(&self) -> ReactiveResult<Vec<T>> {
        self.shared.state.get()
    }

    pub fn snapshot(&self) -> Snapshot<Vec<T>> {
        self.shared.state.snapshot()
    }

    /// Keys of the rows currently in the result.
    pub fn keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<_> = self.shared.keys.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.shared.keys.lock().contains(key)
    }

    /// Completed re-runs since the query was created.
    pub fn run_count(&self) -> u64 {
        self.shared.runs.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.state.subscribe(listener)
    }

    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ReactiveResult<Vec<T>>) + Send + Sync + 'static,
    {
        self.shared.state.listen(callback)
    }

    /// Re-run now and wait for the result.
    pub async fn refresh(&self) -> TableResult<()> {
        let Some(table) = self.table.upgrade() else {
            return Ok(());
        };
        let options = self.shared.options.clone();
        let (ticket, guarded) = self
            .shared
            .cancel
            .supersede(async move { table.collect_keyed(&options).await });
        let Ok(result) = guarded.await else {
            // A newer run owns the result.
            return Ok(());
        };
        let current = self.shared.cancel.finish(ticket);
        let rows = result?;
        if current {
            self.shared.apply(rows);
        }
        Ok(())
    }
}

impl<T: Document> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        if let Some(table) = self.table.upgrade() {
            table.forget_live(&self.shared);
        }
    }
}

impl<T: Document + fmt::Debug> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.shared.id)
            .field("runs", &self.run_count())
            .field("rows", &self.snapshot())
            .finish()
    }
}
