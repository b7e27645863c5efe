//! Integration Tests for Reactive Tables
//!
//! These run against an in-memory SQLite database.

#![cfg(feature = "sqlite")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ripple_core::table::{
    Backend, ExecResult, IndexSpec, KeyType, Order, Row, RowKey, SearchOptions, SetOutcome,
    SqliteBackend, Statement, Table, TableConfig, Where,
};
use ripple_core::{BackendError, TableError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    id: String,
    category: Option<String>,
    price: i64,
    #[serde(default)]
    title: String,
}

fn product(id: &str, category: Option<&str>, price: i64) -> Product {
    Product {
        id: id.to_string(),
        category: category.map(str::to_string),
        price,
        title: String::new(),
    }
}

fn memory() -> Arc<dyn Backend> {
    Arc::new(SqliteBackend::open_in_memory().unwrap())
}

async fn products(backend: Arc<dyn Backend>) -> Table<Product> {
    let config = TableConfig::new("products")
        .key("id")
        .index(IndexSpec::expression("price"))
        .index(IndexSpec::fts("title"));
    Table::create(backend, config).await.unwrap()
}

async fn seeded(rows: &[Product]) -> Table<Product> {
    let table = products(memory()).await;
    table.batch_set(rows).await.unwrap();
    table
}

fn ids(rows: &[Product]) -> Vec<&str> {
    rows.iter().map(|row| row.id.as_str()).collect()
}

async fn matching(table: &Table<Product>, filter: Value) -> Vec<Product> {
    let filter = Where::from_json(&filter).unwrap();
    table
        .collect(&SearchOptions::new().filter(filter))
        .await
        .unwrap()
}

// ----------------------------------------------------------------------------
// Writes and reads
// ----------------------------------------------------------------------------

#[tokio::test]
async fn set_reports_insert_then_update() {
    let table = products(memory()).await;

    let first = table.set(&product("a", None, 1)).await.unwrap();
    assert_eq!(first, SetOutcome::Inserted(RowKey::from("a")));

    let second = table.set(&product("a", None, 2)).await.unwrap();
    assert_eq!(second, SetOutcome::Updated(RowKey::from("a")));

    assert_eq!(table.get("a").await.unwrap().unwrap().price, 2);
    assert_eq!(table.get("missing").await.unwrap(), None);
    assert_eq!(table.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn batch_set_reports_inserted_and_updated_keys() {
    let table = seeded(&[product("a", None, 1)]).await;

    let outcome = table
        .batch_set(&[product("a", None, 5), product("b", None, 6)])
        .await
        .unwrap();

    assert_eq!(outcome.inserted, vec![RowKey::from("b")]);
    assert_eq!(outcome.updated, vec![RowKey::from("a")]);
    assert_eq!(table.get("a").await.unwrap().unwrap().price, 5);
}

#[tokio::test]
async fn documents_without_a_key_are_rejected() {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Loose {
        name: Option<String>,
    }

    let table: Table<Loose> = Table::create(memory(), TableConfig::new("loose").key("name"))
        .await
        .unwrap();
    let error = table.set(&Loose { name: None }).await.unwrap_err();
    assert!(matches!(error, TableError::MissingKey { .. }));
}

#[tokio::test]
async fn rowid_tables_key_by_row_id() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Event {
        kind: String,
    }

    let config = TableConfig::new("events").disable_pragma_optimization();
    let table: Table<Event> = Table::create(memory(), config).await.unwrap();
    let event = Event { kind: "login".into() };

    let outcome = table.set(&event).await.unwrap();
    assert!(outcome.is_insert());
    let key = outcome.key().clone();
    assert_eq!(table.get(key.clone()).await.unwrap(), Some(event));
    assert!(table.delete(key).await.unwrap());
    assert_eq!(table.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn integer_keys_are_typed() {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Slot {
        n: Value,
    }

    let config = TableConfig::new("slots").key("n").key_type(KeyType::Integer);
    let table: Table<Slot> = Table::create(memory(), config).await.unwrap();

    assert!(table.set(&Slot { n: json!(3) }).await.is_ok());
    assert!(matches!(
        table.set(&Slot { n: json!("3") }).await,
        Err(TableError::InvalidKey { .. })
    ));
}

// ----------------------------------------------------------------------------
// Predicates
// ----------------------------------------------------------------------------

#[tokio::test]
async fn range_predicate_selects_middle_row() {
    let table = seeded(&[
        product("p10", None, 10),
        product("p20", None, 20),
        product("p30", None, 30),
    ])
    .await;

    let rows = matching(&table, json!({ "price": { "gt": 15, "lt": 25 } })).await;
    assert_eq!(ids(&rows), vec!["p20"]);
}

#[tokio::test]
async fn empty_lists_match_nothing_or_everything() {
    let table = seeded(&[
        product("p10", None, 10),
        product("p20", None, 20),
        product("p30", None, 30),
    ])
    .await;

    assert!(matching(&table, json!({ "price": { "in": [] } })).await.is_empty());
    assert_eq!(
        matching(&table, json!({ "price": { "notIn": [] } })).await.len(),
        3
    );
}

#[tokio::test]
async fn nested_and_or_predicate() {
    let table = seeded(&[
        product("f10", Some("fruit"), 10),
        product("f20", Some("fruit"), 20),
        product("f15", Some("fruit"), 15),
        product("v10", Some("veg"), 10),
    ])
    .await;

    let rows = matching(
        &table,
        json!({
            "AND": [
                { "category": "fruit" },
                { "OR": [ { "price": { "lt": 15 } }, { "price": { "is": 15 } } ] }
            ]
        }),
    )
    .await;

    let mut found = ids(&rows);
    found.sort();
    assert_eq!(found, vec!["f10", "f15"]);
}

#[tokio::test]
async fn not_in_keeps_missing_fields() {
    let table = seeded(&[
        product("a", Some("fruit"), 1),
        product("b", Some("veg"), 2),
        product("c", None, 3),
    ])
    .await;

    let rows = matching(&table, json!({ "category": { "notIn": ["fruit"] } })).await;
    assert_eq!(ids(&rows), vec!["b", "c"]);
}

#[tokio::test]
async fn full_text_search_uses_the_fts_index() {
    let mut pen = product("pen", None, 2);
    pen.title = "Fountain pen with gold nib".into();
    let mut pad = product("pad", None, 3);
    pad.title = "Paper pad".into();
    let table = seeded(&[pen, pad]).await;

    let rows = matching(&table, json!({ "title": { "fts": "gold" } })).await;
    assert_eq!(ids(&rows), vec!["pen"]);

    // Updates flow through the triggers.
    let mut pad = table.get("pad").await.unwrap().unwrap();
    pad.title = "Gold leaf pad".into();
    table.set(&pad).await.unwrap();
    let rows = matching(&table, json!({ "title": { "fts": "gold" } })).await;
    assert_eq!(ids(&rows), vec!["pad", "pen"]);

    let unknown = table
        .collect(&SearchOptions::new().filter(Where::fts("category", "x")))
        .await;
    assert!(matches!(unknown, Err(TableError::UnknownFtsIndex(_))));
}

// ----------------------------------------------------------------------------
// Search
// ----------------------------------------------------------------------------

#[tokio::test]
async fn keyset_paging_walks_every_row() {
    let rows: Vec<_> = (0..25)
        .map(|i| product(&format!("k{i:02}"), None, i))
        .collect();
    let table = seeded(&rows).await;

    let all = table
        .collect(&SearchOptions::new().step_size(4))
        .await
        .unwrap();
    assert_eq!(all, rows);

    let window = table
        .collect(&SearchOptions::new().step_size(3).offset(5).limit(7))
        .await
        .unwrap();
    assert_eq!(window, rows[5..12].to_vec());

    let newest = table
        .collect(&SearchOptions::new().order(Order::Desc).limit(2))
        .await
        .unwrap();
    assert_eq!(ids(&newest), vec!["k24", "k23"]);
}

#[tokio::test]
async fn sorted_paging_orders_by_field() {
    let table = seeded(&[
        product("a", None, 30),
        product("b", None, 10),
        product("c", None, 20),
        product("d", None, 10),
    ])
    .await;

    let rows = table
        .collect(&SearchOptions::new().sort_by("price").step_size(1))
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec!["b", "d", "c", "a"]);

    let prices: Vec<i64> = table
        .search_map(
            &SearchOptions::new().sort_by("price").order(Order::Desc).limit(2),
            |row| row.price,
        )
        .try_collect()
        .await
        .unwrap();
    assert_eq!(prices, vec![30, 20]);
}

#[tokio::test]
async fn search_streams_are_restartable() {
    let table = seeded(&[product("a", None, 1), product("b", None, 2)]).await;
    let options = SearchOptions::new().step_size(1);

    let first: Vec<Product> = table.search(&options).try_collect().await.unwrap();
    let second: Vec<Product> = table.search(&options).try_collect().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

// ----------------------------------------------------------------------------
// delete_by and group_by
// ----------------------------------------------------------------------------

#[tokio::test]
async fn delete_by_returns_deleted_keys() {
    let table = seeded(&[
        product("a", None, 1),
        product("b", None, 20),
        product("c", None, 30),
    ])
    .await;

    let mut deleted = table.delete_by(&Where::gt("price", 10)).await.unwrap();
    deleted.sort();
    assert_eq!(deleted, vec![RowKey::from("b"), RowKey::from("c")]);
    assert_eq!(table.count(None).await.unwrap(), 1);
}

/// Rejects `RETURNING` the way older SQL engines do.
struct NoReturning {
    inner: SqliteBackend,
    rejected: AtomicUsize,
}

#[async_trait]
impl Backend for NoReturning {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult, BackendError> {
        self.inner.execute(sql, params).await
    }

    async fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError> {
        if sql.contains("RETURNING") {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unsupported("RETURNING".into()));
        }
        self.inner.select(sql, params).await
    }

    async fn transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<ExecResult>, BackendError> {
        self.inner.transaction(statements).await
    }
}

#[tokio::test]
async fn delete_by_falls_back_without_returning() {
    let backend = Arc::new(NoReturning {
        inner: SqliteBackend::open_in_memory().unwrap(),
        rejected: AtomicUsize::new(0),
    });
    let table = products(backend.clone()).await;
    let rows: Vec<_> = (0..1_800)
        .map(|i| product(&format!("k{i:04}"), None, i % 3))
        .collect();
    table.batch_set(&rows).await.unwrap();

    let deleted = table.delete_by(&Where::is("price", 0)).await.unwrap();

    assert_eq!(backend.rejected.load(Ordering::SeqCst), 1);
    // 600 keys: two chunked delete statements.
    assert_eq!(deleted.len(), 600);
    assert_eq!(table.count(None).await.unwrap(), 1_200);
    assert_eq!(table.count(Some(&Where::is("price", 0))).await.unwrap(), 0);
}

#[tokio::test]
async fn group_by_buckets_missing_values_as_null() {
    let table = seeded(&[
        product("a", Some("fruit"), 1),
        product("b", Some("fruit"), 2),
        product("c", Some("veg"), 3),
        product("d", None, 4),
    ])
    .await;

    let groups = table.group_by("category", None).await.unwrap();
    let pairs: Vec<(Value, u64)> = groups.into_iter().map(|g| (g.value, g.count)).collect();
    assert_eq!(
        pairs,
        vec![(Value::Null, 1), (json!("fruit"), 2), (json!("veg"), 1)]
    );
}

// ----------------------------------------------------------------------------
// Live queries
// ----------------------------------------------------------------------------

#[tokio::test]
async fn live_query_reruns_only_when_affected() {
    let table = seeded(&[
        product("a", Some("fruit"), 1),
        product("b", Some("fruit"), 2),
        product("c", Some("veg"), 3),
    ])
    .await;

    let live = table
        .live(
            "fruit",
            SearchOptions::new().filter(Where::is("category", "fruit")),
        )
        .await
        .unwrap();
    assert_eq!(ids(&live.rows().unwrap()), vec!["a", "b"]);

    let notified = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&notified);
    let _sub = live.subscribe(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    // "c" is not in the result: no re-run, no notification.
    table.set(&product("c", Some("veg"), 30)).await.unwrap();
    table.settled().await;
    assert_eq!(live.run_count(), 0);
    assert_eq!(notified.load(Ordering::SeqCst), 0);

    // Deleting "a" re-runs once and drops it from the result.
    assert!(table.delete("a").await.unwrap());
    table.settled().await;
    assert_eq!(live.run_count(), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(ids(&live.rows().unwrap()), vec!["b"]);
    assert!(!live.contains(&RowKey::from("a")));
}

#[tokio::test]
async fn inserts_dirty_every_live_query_once_per_tick() {
    let table = seeded(&[product("a", Some("fruit"), 1)]).await;
    let fruit = table
        .live(
            "fruit",
            SearchOptions::new().filter(Where::is("category", "fruit")),
        )
        .await
        .unwrap();
    let cheap = table
        .live("cheap", SearchOptions::new().filter(Where::lt("price", 5)))
        .await
        .unwrap();

    table.set(&product("b", Some("fruit"), 9)).await.unwrap();
    table.set(&product("c", Some("fruit"), 2)).await.unwrap();
    table.settled().await;

    assert_eq!(fruit.run_count(), 1);
    assert_eq!(cheap.run_count(), 1);
    assert_eq!(ids(&fruit.rows().unwrap()), vec!["a", "b", "c"]);
    assert_eq!(ids(&cheap.rows().unwrap()), vec!["a", "c"]);
}

#[tokio::test]
async fn dropped_live_queries_detach() {
    let table = seeded(&[product("a", None, 1)]).await;
    let live = table.live("all", SearchOptions::new()).await.unwrap();
    assert_eq!(table.live_count(), 1);

    live.refresh().await.unwrap();
    assert_eq!(live.run_count(), 1);

    drop(live);
    assert_eq!(table.live_count(), 0);
    table.set(&product("b", None, 2)).await.unwrap();
    table.settled().await;
}

/// Holds every read result back, so writes can land after the read but
/// before its caller sees the rows.
struct SlowReads {
    inner: SqliteBackend,
}

#[async_trait]
impl Backend for SlowReads {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult, BackendError> {
        self.inner.execute(sql, params).await
    }

    async fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError> {
        let rows = self.inner.select(sql, params).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(rows)
    }

    async fn transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<ExecResult>, BackendError> {
        self.inner.transaction(statements).await
    }
}

#[tokio::test]
async fn writes_during_live_registration_are_not_lost() {
    let backend = Arc::new(SlowReads {
        inner: SqliteBackend::open_in_memory().unwrap(),
    });
    let table = products(backend).await;
    table.set(&product("a", None, 1)).await.unwrap();

    let writer = table.clone();
    let (live, written) = tokio::join!(table.live("all", SearchOptions::new()), async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        writer.set(&product("b", None, 2)).await
    });
    let live = live.unwrap();
    assert!(written.unwrap().is_insert());

    table.settled().await;
    assert_eq!(table.count(None).await.unwrap(), 2);
    assert_eq!(ids(&live.rows().unwrap()), vec!["a", "b"]);
    assert!(live.contains(&RowKey::from("b")));
}

#[tokio::test]
async fn live_queries_project_selected_fields() {
    let table = seeded(&[
        product("a", Some("fruit"), 1),
        product("b", Some("veg"), 2),
    ])
    .await;

    let live = table
        .live("prices", SearchOptions::new().select(["id", "price"]))
        .await
        .unwrap();
    assert_eq!(live.rows().unwrap(), vec![product("a", None, 1), product("b", None, 2)]);

    table.set(&product("b", Some("veg"), 20)).await.unwrap();
    table.settled().await;
    assert_eq!(live.rows().unwrap(), vec![product("a", None, 1), product("b", None, 20)]);

    let bad = table
        .collect(&SearchOptions::new().select(["tags[0]"]))
        .await
        .unwrap_err();
    assert!(matches!(bad, TableError::InvalidPath(_)));
}
