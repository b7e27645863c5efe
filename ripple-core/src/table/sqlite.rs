//! SQLite backend built on `rusqlite`.
//!
//! Statements run synchronously on one connection behind a mutex. That
//! matches SQLite's single-writer model and keeps transactions simple.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::{Map, Number, Value};

use super::backend::{Backend, ExecResult, Row, Statement};
use crate::error::BackendError;

/// Convert a JSON parameter to a SQLite value.
fn json_value_to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => rusqlite::types::Value::Integer(i),
            None => rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

/// Convert a result cell to JSON.
fn sql_to_json(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

fn backend_err(e: rusqlite::Error) -> BackendError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            BackendError::Constraint(message.clone().unwrap_or_else(|| failure.to_string()))
        }
        _ => BackendError::Other(e.to_string()),
    }
}

fn is_insert(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("insert"))
}

/// Run a statement, stepping through (and discarding) any rows it returns.
fn run(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<ExecResult> {
    {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter().map(json_value_to_sql)))?;
        while rows.next()?.is_some() {}
    }
    Ok(ExecResult {
        rows_affected: conn.changes() as u64,
        last_insert_id: is_insert(sql).then(|| conn.last_insert_rowid()),
    })
}

fn query(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter().map(json_value_to_sql)))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            map.insert(name.clone(), sql_to_json(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

/// A [`Backend`] over one SQLite connection.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open a file-backed SQLite database.
    pub fn open(path: &str) -> Result<Self, BackendError> {
        let conn = Connection::open(path).map_err(backend_err)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>,
    ) -> Result<R, BackendError> {
        let mut conn = self.conn.lock();
        f(&mut conn).map_err(backend_err)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult, BackendError> {
        self.with_conn(|conn| run(conn, sql, params))
    }

    async fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError> {
        self.with_conn(|conn| query(conn, sql, params))
    }

    async fn transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<ExecResult>, BackendError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut results = Vec::with_capacity(statements.len());
            for statement in &statements {
                results.push(run(&tx, &statement.sql, &statement.params)?);
            }
            tx.commit()?;
            Ok(results)
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn execute_select_roundtrip() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (k TEXT PRIMARY KEY, n INTEGER, f REAL)", &[])
            .await
            .unwrap();
        let result = db
            .execute(
                "INSERT INTO t (k, n, f) VALUES (?, ?, ?)",
                &[json!("a"), json!(true), json!(1.5)],
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));

        let rows = db.select("SELECT k, n, f FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["k"], json!("a"));
        assert_eq!(rows[0]["n"], json!(1));
        assert_eq!(rows[0]["f"], json!(1.5));
    }

    #[tokio::test]
    async fn duplicate_keys_are_constraint_errors() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (k TEXT PRIMARY KEY)", &[]).await.unwrap();
        db.execute("INSERT INTO t (k) VALUES ('x')", &[]).await.unwrap();
        let error = db
            .execute("INSERT INTO t (k) VALUES ('x')", &[])
            .await
            .unwrap_err();
        assert!(matches!(error, BackendError::Constraint(_)));
    }

    #[tokio::test]
    async fn failed_transactions_roll_back() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (k TEXT PRIMARY KEY)", &[]).await.unwrap();
        let result = db
            .transaction(vec![
                Statement::new("INSERT INTO t (k) VALUES (?)", vec![json!("a")]),
                Statement::new("INSERT INTO t (k) VALUES (?)", vec![json!("a")]),
            ])
            .await;
        assert!(result.is_err());

        let rows = db.select("SELECT COUNT(*) AS c FROM t", &[]).await.unwrap();
        assert_eq!(rows[0]["c"], json!(0));
    }

    #[tokio::test]
    async fn pragmas_that_return_rows_execute() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.execute("PRAGMA journal_mode = WAL", &[]).await.unwrap();
        db.execute("PRAGMA synchronous = NORMAL", &[]).await.unwrap();
    }
}
