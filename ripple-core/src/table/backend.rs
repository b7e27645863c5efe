//! SQL backend contract.
//!
//! The table engine never talks to a database directly. It builds SQL with
//! positional `?` parameters and hands it to an injected [`Backend`].
//! Parameters and result cells are plain `serde_json::Value`s, so a backend
//! only has to map JSON scalars onto its own value type.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::BackendError;

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Row id of the most recent insert, when the backend tracks one.
    pub last_insert_id: Option<i64>,
}

/// A SQL statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Executes SQL on behalf of a table.
///
/// Implementations must report uniqueness and primary key violations as
/// [`BackendError::Constraint`]; `set` relies on it to fall back to an
/// update.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run a statement that does not return rows.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult, BackendError>;

    /// Run a statement and collect its rows.
    async fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError>;

    /// Run every statement atomically: either all of them apply or none does.
    async fn transaction(&self, statements: Vec<Statement>)
        -> Result<Vec<ExecResult>, BackendError>;
}
