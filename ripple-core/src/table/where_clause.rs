//! Where Clauses
//!
//! A [`Where`] is a predicate tree over document fields. It is built either
//! with the constructor functions or parsed from the JSON wire shape:
//!
//! ```json
//! {
//!   "category": "tools",
//!   "price": { "gte": 10, "lt": 50 },
//!   "tags": ["sale", "new"],
//!   "meta": { "color": { "isNot": null } },
//!   "OR": [ { "stock": { "gt": 0 } }, { "backorder": true } ]
//! }
//! ```
//!
//! - A literal means `is`, an array means `in`.
//! - An object whose keys are all operators is an operator object; any
//!   other object is flattened into dot paths.
//! - `AND` / `OR` take an array of clauses, `NOT` takes a clause.
//!
//! # Compilation
//!
//! Every field becomes `json_extract(data, '$.path')` with values passed as
//! positional parameters. Compiling yields `None` when a clause constrains
//! nothing (an empty `notIn`, an empty `AND`), so callers can omit the
//! `WHERE` entirely.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use super::config::{json_extract, quote_ident, validate_path};
use crate::error::{TableError, TableResult};

const OPERATORS: [&str; 10] = [
    "is", "isNot", "gt", "gte", "lt", "lte", "in", "notIn", "like", "fts",
];

/// A single constraint on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Is(Value),
    IsNot(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Like(String),
    /// Full-text match against the FTS index declared for the field.
    Fts(String),
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    And(Vec<Where>),
    Or(Vec<Where>),
    Not(Box<Where>),
    Field {
        path: String,
        conditions: Vec<Condition>,
    },
}

impl Where {
    pub fn field(path: impl Into<String>, condition: Condition) -> Self {
        Self::Field {
            path: path.into(),
            conditions: vec![condition],
        }
    }

    pub fn is(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::Is(value.into()))
    }

    pub fn is_not(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::IsNot(value.into()))
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::Gt(value.into()))
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::Gte(value.into()))
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::Lt(value.into()))
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::Lte(value.into()))
    }

    pub fn any_of<V>(path: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<Value>,
    {
        Self::field(
            path,
            Condition::In(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn none_of<V>(path: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<Value>,
    {
        Self::field(
            path,
            Condition::NotIn(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn like(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::field(path, Condition::Like(pattern.into()))
    }

    pub fn fts(path: impl Into<String>, query: impl Into<String>) -> Self {
        Self::field(path, Condition::Fts(query.into()))
    }

    pub fn and(clauses: impl IntoIterator<Item = Where>) -> Self {
        Self::And(clauses.into_iter().collect())
    }

    pub fn or(clauses: impl IntoIterator<Item = Where>) -> Self {
        Self::Or(clauses.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(clause: Where) -> Self {
        Self::Not(Box::new(clause))
    }

    /// Parse the JSON wire shape.
    pub fn from_json(value: &Value) -> TableResult<Self> {
        match value {
            Value::Object(map) => parse_object(map, None),
            other => Err(TableError::InvalidWhere(format!(
                "expected an object, found {other}"
            ))),
        }
    }

    /// Compile to a SQL boolean expression.
    pub(crate) fn compile(&self, scope: &Scope<'_>) -> TableResult<Option<Fragment>> {
        match self {
            Self::And(clauses) => {
                let mut parts = Vec::new();
                for clause in clauses {
                    if let Some(part) = clause.compile(scope)? {
                        parts.push(part);
                    }
                }
                Ok(Fragment::join(parts, " AND "))
            }
            Self::Or(clauses) => {
                if clauses.is_empty() {
                    return Ok(Some(Fragment::constant(false)));
                }
                let mut parts = Vec::new();
                for clause in clauses {
                    match clause.compile(scope)? {
                        Some(part) => parts.push(part),
                        // One branch matches everything.
                        None => return Ok(None),
                    }
                }
                Ok(Fragment::join(parts, " OR "))
            }
            Self::Not(clause) => Ok(Some(match clause.compile(scope)? {
                Some(inner) => Fragment {
                    sql: format!("NOT ({})", inner.sql),
                    params: inner.params,
                },
                None => Fragment::constant(false),
            })),
            Self::Field { path, conditions } => {
                validate_path(path)?;
                let mut parts = Vec::new();
                for condition in conditions {
                    if let Some(part) = compile_condition(path, condition, scope)? {
                        parts.push(part);
                    }
                }
                Ok(Fragment::join(parts, " AND "))
            }
        }
    }
}

impl<'de> Deserialize<'de> for Where {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Where::from_json(&value).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn join_path(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{key}"),
        None => key.to_string(),
    }
}

fn parse_object(map: &Map<String, Value>, prefix: Option<&str>) -> TableResult<Where> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "AND" => Where::And(parse_list(value, prefix, "AND")?),
            "OR" => Where::Or(parse_list(value, prefix, "OR")?),
            "NOT" => Where::not(match value {
                Value::Array(_) => Where::And(parse_list(value, prefix, "NOT")?),
                _ => parse_clause(value, prefix, "NOT")?,
            }),
            field => parse_field(join_path(prefix, field), value)?,
        };
        clauses.push(clause);
    }
    Ok(match clauses.len() {
        1 => clauses.remove(0),
        _ => Where::And(clauses),
    })
}

fn parse_clause(value: &Value, prefix: Option<&str>, combinator: &str) -> TableResult<Where> {
    match value {
        Value::Object(map) => parse_object(map, prefix),
        other => Err(TableError::InvalidWhere(format!(
            "{combinator} expects objects, found {other}"
        ))),
    }
}

fn parse_list(value: &Value, prefix: Option<&str>, combinator: &str) -> TableResult<Vec<Where>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| parse_clause(item, prefix, combinator))
            .collect(),
        single => Ok(vec![parse_clause(single, prefix, combinator)?]),
    }
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|key| OPERATORS.contains(&key.as_str()))
}

fn parse_field(path: String, value: &Value) -> TableResult<Where> {
    match value {
        Value::Object(map) if is_operator_object(map) => {
            let conditions = map
                .iter()
                .map(|(op, operand)| parse_condition(&path, op, operand))
                .collect::<TableResult<Vec<_>>>()?;
            Ok(Where::Field { path, conditions })
        }
        Value::Object(map) if map.is_empty() => Err(TableError::InvalidWhere(format!(
            "empty object for \"{path}\""
        ))),
        Value::Object(map) => parse_object(map, Some(&path)),
        Value::Array(items) => Ok(Where::field(path, Condition::In(items.clone()))),
        literal => Ok(Where::field(path, Condition::Is(literal.clone()))),
    }
}

fn parse_condition(path: &str, op: &str, operand: &Value) -> TableResult<Condition> {
    let text = |operand: &Value| {
        operand.as_str().map(str::to_string).ok_or_else(|| {
            TableError::InvalidWhere(format!("\"{op}\" on \"{path}\" expects a string"))
        })
    };
    let list = |operand: &Value| match operand {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(TableError::InvalidWhere(format!(
            "\"{op}\" on \"{path}\" expects an array"
        ))),
    };
    Ok(match op {
        "is" => match operand {
            Value::Array(items) => Condition::In(items.clone()),
            _ => Condition::Is(operand.clone()),
        },
        "isNot" => match operand {
            Value::Array(items) => Condition::NotIn(items.clone()),
            _ => Condition::IsNot(operand.clone()),
        },
        "gt" => Condition::Gt(operand.clone()),
        "gte" => Condition::Gte(operand.clone()),
        "lt" => Condition::Lt(operand.clone()),
        "lte" => Condition::Lte(operand.clone()),
        "in" => Condition::In(list(operand)?),
        "notIn" => Condition::NotIn(list(operand)?),
        "like" => Condition::Like(text(operand)?),
        "fts" => Condition::Fts(text(operand)?),
        other => {
            return Err(TableError::InvalidWhere(format!(
                "unknown operator \"{other}\""
            )))
        }
    })
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// A piece of SQL with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Fragment {
    fn constant(value: bool) -> Self {
        Self {
            sql: if value { "1" } else { "0" }.to_string(),
            params: Vec::new(),
        }
    }

    fn join(parts: Vec<Fragment>, separator: &str) -> Option<Fragment> {
        match parts.len() {
            0 => None,
            1 => parts.into_iter().next(),
            _ => {
                let mut sql = Vec::with_capacity(parts.len());
                let mut params = Vec::new();
                for part in parts {
                    sql.push(format!("({})", part.sql));
                    params.extend(part.params);
                }
                Some(Fragment {
                    sql: sql.join(separator),
                    params,
                })
            }
        }
    }
}

/// What a predicate compiles against.
pub(crate) struct Scope<'a> {
    /// Quoted name of the document table.
    pub table: &'a str,
    /// Field path to quoted FTS table name.
    pub fts: &'a IndexMap<String, String>,
}

fn scalar(path: &str, value: &Value) -> TableResult<Value> {
    match value {
        Value::Array(_) | Value::Object(_) => Err(TableError::InvalidWhere(format!(
            "\"{path}\" can only be compared with scalars"
        ))),
        other => Ok(other.clone()),
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn compile_condition(
    path: &str,
    condition: &Condition,
    scope: &Scope<'_>,
) -> TableResult<Option<Fragment>> {
    let expr = json_extract("data", path);
    let compare = |op: &str, value: &Value| -> TableResult<Option<Fragment>> {
        Ok(Some(Fragment {
            sql: format!("{expr} {op} ?"),
            params: vec![scalar(path, value)?],
        }))
    };

    match condition {
        Condition::Is(Value::Null) => Ok(Some(Fragment {
            sql: format!("{expr} IS NULL"),
            params: Vec::new(),
        })),
        Condition::IsNot(Value::Null) => Ok(Some(Fragment {
            sql: format!("{expr} IS NOT NULL"),
            params: Vec::new(),
        })),
        Condition::Is(value) => compare("=", value),
        Condition::IsNot(value) => compare("IS NOT", value),
        Condition::Gt(value) => compare(">", value),
        Condition::Gte(value) => compare(">=", value),
        Condition::Lt(value) => compare("<", value),
        Condition::Lte(value) => compare("<=", value),
        Condition::Like(pattern) => compare("LIKE", &Value::String(pattern.clone())),
        Condition::In(values) => {
            if values.is_empty() {
                return Ok(Some(Fragment::constant(false)));
            }
            let with_null = values.iter().any(Value::is_null);
            let params = values
                .iter()
                .filter(|value| !value.is_null())
                .map(|value| scalar(path, value))
                .collect::<TableResult<Vec<_>>>()?;
            let sql = match (params.is_empty(), with_null) {
                (true, _) => format!("{expr} IS NULL"),
                (false, false) => format!("{expr} IN ({})", placeholders(params.len())),
                (false, true) => format!(
                    "{expr} IN ({}) OR {expr} IS NULL",
                    placeholders(params.len())
                ),
            };
            Ok(Some(Fragment { sql, params }))
        }
        Condition::NotIn(values) => {
            if values.is_empty() {
                return Ok(None);
            }
            let with_null = values.iter().any(Value::is_null);
            let params = values
                .iter()
                .filter(|value| !value.is_null())
                .map(|value| scalar(path, value))
                .collect::<TableResult<Vec<_>>>()?;
            let sql = match (params.is_empty(), with_null) {
                (true, _) => format!("{expr} IS NOT NULL"),
                (false, false) => format!(
                    "{expr} IS NULL OR {expr} NOT IN ({})",
                    placeholders(params.len())
                ),
                (false, true) => format!(
                    "{expr} IS NOT NULL AND {expr} NOT IN ({})",
                    placeholders(params.len())
                ),
            };
            Ok(Some(Fragment { sql, params }))
        }
        Condition::Fts(query) => {
            let fts = scope
                .fts
                .get(path)
                .ok_or_else(|| TableError::UnknownFtsIndex(path.to_string()))?;
            Ok(Some(Fragment {
                sql: format!(
                    "EXISTS (SELECT 1 FROM {fts} WHERE {fts}.rowid = {table}.rowid AND {fts} MATCH ?)",
                    table = scope.table,
                ),
                params: vec![Value::String(query.clone())],
            }))
        }
    }
}

/// Compile an optional predicate into a ` WHERE …` suffix.
pub(crate) fn where_sql(
    filter: Option<&Where>,
    scope: &Scope<'_>,
) -> TableResult<(String, Vec<Value>)> {
    match filter.map(|filter| filter.compile(scope)).transpose()?.flatten() {
        Some(fragment) => Ok((format!(" WHERE {}", fragment.sql), fragment.params)),
        None => Ok((String::new(), Vec::new())),
    }
}

/// Quoted FTS table name for a document table and field path.
pub(crate) fn fts_table(table: &str, path: &str) -> String {
    quote_ident(&format!("{table}_fts_{}", super::config::path_suffix(path)))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
