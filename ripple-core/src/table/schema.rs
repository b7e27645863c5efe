//! Table DDL.
//!
//! A table with a key path stores `(key, data)`; without one it stores only
//! `data` and uses the row id as its key. Documents are JSON text in `data`.
//! Expression indexes are built over `json_extract(data, '$.path')`. Each FTS
//! index is a separate FTS5 table whose rowid mirrors the document row id,
//! kept in sync by insert, update and delete triggers.

use indexmap::IndexMap;

use super::config::{json_extract, path_suffix, quote_ident, IndexSpec, TableConfig};
use super::where_clause::fts_table;

/// Generated names and statements for one table.
#[derive(Debug, Clone)]
pub(crate) struct Schema {
    /// Quoted table name.
    pub table: String,
    /// Column (or `rowid`) identifying a row.
    pub identity: &'static str,
    pub keyed: bool,
    /// Field path to quoted FTS table name.
    pub fts: IndexMap<String, String>,
}

impl Schema {
    pub fn new(config: &TableConfig) -> Self {
        let fts = config
            .indexes
            .iter()
            .filter(|index| index.is_fts())
            .map(|index| {
                (
                    index.path().to_string(),
                    fts_table(&config.table_name, index.path()),
                )
            })
            .collect();
        let keyed = config.key.is_some();
        Self {
            table: quote_ident(&config.table_name),
            identity: if keyed { "\"key\"" } else { "rowid" },
            keyed,
            fts,
        }
    }

    /// Statements run once at table creation, in order.
    pub fn statements(&self, config: &TableConfig) -> Vec<String> {
        let mut statements = Vec::new();
        if !config.disable_pragma_optimization {
            statements.push("PRAGMA journal_mode = WAL".to_string());
            statements.push("PRAGMA synchronous = NORMAL".to_string());
        }

        let table = &self.table;
        statements.push(if self.keyed {
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\"key\" {} PRIMARY KEY NOT NULL, data TEXT NOT NULL)",
                config.key_type.sql()
            )
        } else {
            format!("CREATE TABLE IF NOT EXISTS {table} (data TEXT NOT NULL)")
        });

        for index in &config.indexes {
            match index {
                IndexSpec::Expression { path } => {
                    let name = quote_ident(&format!(
                        "{}_idx_{}",
                        config.table_name,
                        path_suffix(path)
                    ));
                    statements.push(format!(
                        "CREATE INDEX IF NOT EXISTS {name} ON {table} ({})",
                        json_extract("data", path)
                    ));
                }
                IndexSpec::Fts { path, tokenizer } => {
                    let fts = fts_table(&config.table_name, path);
                    let tokenize = tokenizer
                        .as_ref()
                        .map(|tokenizer| format!(", {}", tokenizer.to_sql()))
                        .unwrap_or_default();
                    statements.push(format!(
                        "CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(content{tokenize})"
                    ));
                    statements.extend(fts_triggers(&config.table_name, table, &fts, path));
                }
            }
        }
        statements
    }
}

fn fts_triggers(name: &str, table: &str, fts: &str, path: &str) -> [String; 3] {
    let trigger = |suffix: &str| quote_ident(&format!("{name}_fts_{}_{suffix}", path_suffix(path)));
    let insert = format!(
        "INSERT INTO {fts} (rowid, content) VALUES (new.rowid, {})",
        json_extract("new.data", path)
    );
    let delete = format!("DELETE FROM {fts} WHERE rowid = old.rowid");
    [
        format!(
            "CREATE TRIGGER IF NOT EXISTS {} AFTER INSERT ON {table} BEGIN {insert}; END",
            trigger("ai")
        ),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {} AFTER DELETE ON {table} BEGIN {delete}; END",
            trigger("ad")
        ),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {} AFTER UPDATE ON {table} BEGIN {delete}; {insert}; END",
            trigger("au")
        ),
    ]
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
