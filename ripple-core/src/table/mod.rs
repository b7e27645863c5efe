//! Reactive Tables
//!
//! A document store on top of SQL with indexed search and live queries.
//!
//! # Concepts
//!
//! ## Table
//!
//! A [`Table`] holds serde documents of one type as JSON text, keyed either
//! by a field of the document or by the row id. Fields can be indexed with
//! expression indexes or full-text (FTS5) indexes.
//!
//! ## Where
//!
//! A [`Where`] filters documents. It is compiled to parameterized SQL, so
//! field paths are validated and values are never spliced into statements.
//!
//! ## Live Queries
//!
//! A [`LiveQuery`] is a search whose rows are kept in a reactive
//! [`State`](crate::reactive::State). Writes made through the table re-run
//! only the live queries they can affect.
//!
//! ## Backend
//!
//! SQL runs through the [`Backend`] trait. With the `sqlite` feature (on by
//! default) [`SqliteBackend`] provides one over `rusqlite`.

mod backend;
mod config;
mod document;
mod live;
mod schema;
mod search;
#[cfg(feature = "sqlite")]
mod sqlite;
#[allow(clippy::module_inception)]
mod table;
mod where_clause;

pub use backend::{Backend, ExecResult, Row, Statement};
pub use config::{validate_identifier, validate_path, IndexSpec, KeyType, TableConfig, Tokenizer};
pub use document::{Document, RowKey};
pub use live::{LiveQuery, Mutation, ScheduleId};
pub use search::{Order, SearchOptions};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use table::{BatchOutcome, Group, SetOutcome, Table, KEY_CHUNK_SIZE};
pub use where_clause::{Condition, Where};
