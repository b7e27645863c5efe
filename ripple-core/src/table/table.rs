//! Reactive Table
//!
//! A [`Table`] stores serde documents in one SQL table through an injected
//! [`Backend`] and keeps [`LiveQuery`] results in sync with every write made
//! through it.
//!
//! # Writes
//!
//! - `set` inserts, falling back to an update when the key already exists.
//! - `batch_set` upserts many documents in one transaction.
//! - `delete_by` deletes in a single `DELETE … RETURNING` pass, or falls back
//!   to selecting the keys and deleting them in chunks inside a transaction
//!   when the backend cannot return rows from a delete.
//!
//! Each write reports its [`Mutation`]s to the live query scheduler.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::backend::{Backend, Row, Statement};
use super::config::{json_extract, validate_path, TableConfig};
use super::document::{extract_key, Document, RowKey};
use super::live::{LiveQuery, LiveShared, Mutation, ScheduleId};
use super::schema::Schema;
use super::search::{decode_data, SearchOptions};
use super::where_clause::{where_sql, Scope, Where};
use crate::error::{BackendError, TableResult};
use crate::reactive::Runtime;
use crate::schedule::{Batcher, BatcherOptions, KeyHandlers};

/// Keys bound per `IN (...)` list, e.g. in the chunked `delete_by` fallback.
pub const KEY_CHUNK_SIZE: usize = 500;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Whether `set` created a row or replaced one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted(RowKey),
    Updated(RowKey),
}

impl SetOutcome {
    pub fn key(&self) -> &RowKey {
        match self {
            Self::Inserted(key) | Self::Updated(key) => key,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Keys written by `batch_set`, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: Vec<RowKey>,
    pub updated: Vec<RowKey>,
}

/// One bucket of `group_by`. Documents without the field share the `null`
/// bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub value: Value,
    pub count: u64,
}

pub(crate) struct TableInner<T: Document> {
    pub id: u64,
    pub config: TableConfig,
    pub schema: Schema,
    pub backend: Arc<dyn Backend>,
    batcher: Batcher<ScheduleId, Mutation>,
    live: Mutex<IndexMap<Arc<str>, Arc<LiveShared<T>>>>,
    /// Bumped by every reported write, whether or not a live query is attached.
    writes: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Document> TableInner<T> {
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            table: &self.schema.table,
            fts: &self.schema.fts,
        }
    }

    fn key_of(&self, doc: &Value) -> TableResult<Option<RowKey>> {
        match &self.config.key {
            Some(path) => extract_key(doc, path, self.config.key_type).map(Some),
            None => Ok(None),
        }
    }

    /// Queue every live query a mutation can affect.
    fn notify(&self, mutations: impl IntoIterator<Item = Mutation>) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let live: Vec<_> = self.live.lock().values().cloned().collect();
        if live.is_empty() {
            return;
        }
        for mutation in mutations {
            for query in &live {
                if query.is_affected_by(&mutation) {
                    self.batcher.schedule(query.id.clone(), mutation.clone());
                }
            }
        }
    }

    pub fn forget_live(&self, shared: &Arc<LiveShared<T>>) {
        let mut live = self.live.lock();
        if live
            .get(&shared.id.search)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            live.shift_remove(&shared.id.search);
        }
    }
}

/// A document table with live queries.
pub struct Table<T: Document> {
    inner: Arc<TableInner<T>>,
}

impl<T: Document> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Document> Table<T> {
    /// Validate `config`, create the table and its indexes, and return a
    /// handle to it.
    pub async fn create(backend: Arc<dyn Backend>, config: TableConfig) -> TableResult<Self> {
        config.validate()?;
        let schema = Schema::new(&config);
        for sql in schema.statements(&config) {
            tracing::debug!(table = %config.table_name, %sql, "creating schema");
            backend.execute(&sql, &[]).await?;
        }

        Ok(Self {
            inner: Arc::new(TableInner {
                id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
                config,
                schema,
                backend,
                // Always deferred: the writes of one tick coalesce into one
                // re-run per live query whatever runtime the caller uses.
                batcher: Batcher::new(BatcherOptions::default()),
                live: Mutex::new(IndexMap::new()),
                writes: AtomicU64::new(0),
                _marker: PhantomData,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.table_name
    }

    pub fn config(&self) -> &TableConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert `doc`, or update it if a row with its key exists.
    pub async fn set(&self, doc: &T) -> TableResult<SetOutcome> {
        let data = serde_json::to_value(doc)?;
        let key = self.inner.key_of(&data)?;
        let text = Value::String(data.to_string());
        let table = &self.inner.schema.table;
        let backend = &self.inner.backend;

        let outcome = match key {
            None => {
                let sql = format!("INSERT INTO {table} (data) VALUES (?)");
                let result = backend.execute(&sql, &[text]).await?;
                let id = result
                    .last_insert_id
                    .ok_or_else(|| BackendError::Other("backend reported no row id".into()))?;
                SetOutcome::Inserted(RowKey::Int(id))
            }
            Some(key) => {
                let insert = format!("INSERT INTO {table} (\"key\", data) VALUES (?, ?)");
                match backend.execute(&insert, &[key.to_param(), text.clone()]).await {
                    Ok(_) => SetOutcome::Inserted(key),
                    Err(BackendError::Constraint(_)) => {
                        let update = format!("UPDATE {table} SET data = ? WHERE \"key\" = ?");
                        backend.execute(&update, &[text, key.to_param()]).await?;
                        SetOutcome::Updated(key)
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        };

        self.inner.notify([match &outcome {
            SetOutcome::Inserted(key) => Mutation::Insert(key.clone()),
            SetOutcome::Updated(key) => Mutation::Update(key.clone()),
        }]);
        Ok(outcome)
    }

    /// Upsert every document in one transaction.
    pub async fn batch_set(&self, docs: &[T]) -> TableResult<BatchOutcome> {
        if docs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let table = &self.inner.schema.table;

        let mut entries = Vec::with_capacity(docs.len());
        for doc in docs {
            let data = serde_json::to_value(doc)?;
            let key = self.inner.key_of(&data)?;
            entries.push((key, Value::String(data.to_string())));
        }

        if self.inner.config.key.is_none() {
            let sql = format!("INSERT INTO {table} (data) VALUES (?)");
            let statements = entries
                .into_iter()
                .map(|(_, text)| Statement::new(sql.clone(), vec![text]))
                .collect();
            let results = self.inner.backend.transaction(statements).await?;
            let inserted = results
                .iter()
                .map(|result| {
                    result
                        .last_insert_id
                        .map(RowKey::Int)
                        .ok_or_else(|| BackendError::Other("backend reported no row id".into()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.inner
                .notify(inserted.iter().cloned().map(Mutation::Insert));
            return Ok(BatchOutcome {
                inserted,
                updated: Vec::new(),
            });
        }

        let keys: Vec<RowKey> = entries.iter().filter_map(|(key, _)| key.clone()).collect();
        let mut existing = self.existing_keys(&keys).await?;

        let sql = format!(
            "INSERT INTO {table} (\"key\", data) VALUES (?, ?) \
             ON CONFLICT(\"key\") DO UPDATE SET data = excluded.data"
        );
        let mut outcome = BatchOutcome::default();
        let mut statements = Vec::with_capacity(entries.len());
        for (key, text) in entries {
            let Some(key) = key else { continue };
            statements.push(Statement::new(sql.clone(), vec![key.to_param(), text]));
            if existing.insert(key.clone()) {
                outcome.inserted.push(key);
            } else {
                outcome.updated.push(key);
            }
        }
        self.inner.backend.transaction(statements).await?;

        self.inner.notify(
            outcome
                .inserted
                .iter()
                .cloned()
                .map(Mutation::Insert)
                .chain(outcome.updated.iter().cloned().map(Mutation::Update)),
        );
        Ok(outcome)
    }

    async fn existing_keys(&self, keys: &[RowKey]) -> TableResult<HashSet<RowKey>> {
        let mut existing = HashSet::new();
        for chunk in keys.chunks(KEY_CHUNK_SIZE) {
            let sql = format!(
                "SELECT \"key\" AS __key FROM {} WHERE \"key\" IN ({})",
                self.inner.schema.table,
                vec!["?"; chunk.len()].join(", ")
            );
            let params: Vec<Value> = chunk.iter().map(RowKey::to_param).collect();
            let rows = self.inner.backend.select(&sql, &params).await?;
            existing.extend(rows.iter().filter_map(row_key));
        }
        Ok(existing)
    }

    pub async fn get(&self, key: impl Into<RowKey>) -> TableResult<Option<T>> {
        let key = key.into();
        let sql = format!(
            "SELECT data FROM {} WHERE {} = ?",
            self.inner.schema.table, self.inner.schema.identity
        );
        let rows = self.inner.backend.select(&sql, &[key.to_param()]).await?;
        rows.first().map(decode_data::<T>).transpose()
    }

    /// Delete one row. Returns whether it existed.
    pub async fn delete(&self, key: impl Into<RowKey>) -> TableResult<bool> {
        let key = key.into();
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.inner.schema.table, self.inner.schema.identity
        );
        let result = self.inner.backend.execute(&sql, &[key.to_param()]).await?;
        let deleted = result.rows_affected > 0;
        if deleted {
            self.inner.notify([Mutation::Delete(key)]);
        }
        Ok(deleted)
    }

    /// Delete every row matching `filter` and return their keys.
    pub async fn delete_by(&self, filter: &Where) -> TableResult<Vec<RowKey>> {
        let (clause, params) = where_sql(Some(filter), &self.inner.scope())?;
        let table = &self.inner.schema.table;
        let identity = self.inner.schema.identity;

        let sql = format!("DELETE FROM {table}{clause} RETURNING {identity} AS __key");
        let keys = match self.inner.backend.select(&sql, &params).await {
            Ok(rows) => rows.iter().filter_map(row_key).collect(),
            Err(error) if error.is_unsupported_returning() => {
                tracing::debug!(table = %self.name(), %error, "falling back to chunked delete");
                self.delete_in_chunks(&clause, &params).await?
            }
            Err(error) => return Err(error.into()),
        };

        self.inner.notify(keys.iter().cloned().map(Mutation::Delete));
        Ok(keys)
    }

    async fn delete_in_chunks(&self, clause: &str, params: &[Value]) -> TableResult<Vec<RowKey>> {
        let table = &self.inner.schema.table;
        let identity = self.inner.schema.identity;

        let select = format!("SELECT {identity} AS __key FROM {table}{clause}");
        let keys: Vec<RowKey> = self
            .inner
            .backend
            .select(&select, params)
            .await?
            .iter()
            .filter_map(row_key)
            .collect();
        if keys.is_empty() {
            return Ok(keys);
        }

        let statements = keys
            .chunks(KEY_CHUNK_SIZE)
            .map(|chunk| {
                Statement::new(
                    format!(
                        "DELETE FROM {table} WHERE {identity} IN ({})",
                        vec!["?"; chunk.len()].join(", ")
                    ),
                    chunk.iter().map(RowKey::to_param).collect(),
                )
            })
            .collect();
        self.inner.backend.transaction(statements).await?;
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn count(&self, filter: Option<&Where>) -> TableResult<u64> {
        let (clause, params) = where_sql(filter, &self.inner.scope())?;
        let sql = format!("SELECT COUNT(*) AS count FROM {}{clause}", self.inner.schema.table);
        let rows = self.inner.backend.select(&sql, &params).await?;
        Ok(rows.first().map_or(0, count_of))
    }

    /// Count rows per distinct value of `path`.
    pub async fn group_by(&self, path: &str, filter: Option<&Where>) -> TableResult<Vec<Group>> {
        validate_path(path)?;
        let (clause, params) = where_sql(filter, &self.inner.scope())?;
        let sql = format!(
            "SELECT {} AS value, COUNT(*) AS count FROM {}{clause} GROUP BY 1 ORDER BY 1",
            json_extract("data", path),
            self.inner.schema.table
        );
        let rows = self.inner.backend.select(&sql, &params).await?;
        Ok(rows
            .iter()
            .map(|row| Group {
                value: row.get("value").cloned().unwrap_or(Value::Null),
                count: count_of(row),
            })
            .collect())
    }

    /// Page lazily through the documents matching `options`.
    pub fn search(&self, options: &SearchOptions) -> BoxStream<'static, TableResult<T>> {
        self.inner
            .search_keyed(options)
            .map_ok(|(_, doc)| doc)
            .boxed()
    }

    /// Like [`Table::search`], also yielding each row's key.
    pub fn search_keyed(
        &self,
        options: &SearchOptions,
    ) -> BoxStream<'static, TableResult<(RowKey, T)>> {
        self.inner.search_keyed(options)
    }

    /// Search and project each document through `f`.
    pub fn search_map<U, F>(
        &self,
        options: &SearchOptions,
        f: F,
    ) -> BoxStream<'static, TableResult<U>>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + 'static,
    {
        self.search(options).map_ok(f).boxed()
    }

    /// Collect every matching document.
    pub async fn collect(&self, options: &SearchOptions) -> TableResult<Vec<T>> {
        self.search(options).try_collect().await
    }

    // ------------------------------------------------------------------
    // Live queries
    // ------------------------------------------------------------------

    /// Run a search and keep its result current.
    ///
    /// A second live query with the same `search_id` replaces the first; the
    /// first one stops re-running.
    pub async fn live(
        &self,
        search_id: impl Into<Arc<str>>,
        options: SearchOptions,
    ) -> TableResult<LiveQuery<T>> {
        let search: Arc<str> = search_id.into();
        let writes = self.inner.writes.load(Ordering::SeqCst);
        let rows = self.inner.collect_keyed(&options).await?;
        let id = ScheduleId {
            table: self.inner.id,
            search: Arc::clone(&search),
        };
        let shared = Arc::new(LiveShared::new(id.clone(), options, rows));

        let table = Arc::downgrade(&self.inner);
        let live = Arc::downgrade(&shared);
        let handlers = KeyHandlers::on_finish(move |_: &ScheduleId| {
            if let (Some(table), Some(live)) = (table.upgrade(), live.upgrade()) {
                LiveShared::rerun(table, live);
            }
        })
        .with_resolve_item(|id: &ScheduleId, mutation: Mutation| {
            tracing::trace!(query = %id, ?mutation, "live query dirty");
        });
        *shared.registration.lock() = Some(self.inner.batcher.register(id, handlers));

        let replaced = self.inner.live.lock().insert(search, Arc::clone(&shared));
        if let Some(replaced) = replaced {
            replaced.cancel.cancel();
        }

        // A write that landed during the initial fetch found nothing to
        // notify; the fetched rows may predate it.
        if self.inner.writes.load(Ordering::SeqCst) != writes {
            tracing::debug!(query = %shared.id, "write during registration, re-running");
            LiveShared::rerun(Arc::clone(&self.inner), Arc::clone(&shared));
        }

        Ok(LiveQuery {
            shared,
            table: Arc::downgrade(&self.inner),
        })
    }

    /// Number of live queries attached to this table.
    pub fn live_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Wait until no live query is dirty or re-running and every resulting
    /// emission on the current thread's runtime has been delivered.
    pub async fn settled(&self) {
        loop {
            tokio::task::yield_now().await;
            let busy = !self.inner.batcher.is_idle()
                || self
                    .inner
                    .live
                    .lock()
                    .values()
                    .any(|live| live.cancel.in_flight());
            if !busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Runtime::current().settled().await;
    }
}

fn row_key(row: &Row) -> Option<RowKey> {
    row.get("__key").and_then(RowKey::from_cell)
}

fn count_of(row: &Row) -> u64 {
    row.get("count").and_then(Value::as_u64).unwrap_or(0)
}

impl<T: Document> std::fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.table_name)
            .field("live", &self.live_count())
            .finish()
    }
}
