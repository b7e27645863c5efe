//! Table configuration.
//!
//! A [`TableConfig`] names the SQL table, where the document key lives and
//! which fields get indexed. It deserializes from the JSON shape used by
//! configuration files:
//!
//! ```json
//! {
//!   "tableName": "products",
//!   "key": "sku",
//!   "keyType": "text",
//!   "indexes": ["price", "fts:title", { "type": "fts", "path": "body", "tokenizer": { "removeDiacritics": 2 } }]
//! }
//! ```
//!
//! Every identifier and field path ends up inside generated SQL, so both are
//! validated against a strict character set before any statement is built.

use serde::Deserialize;

use crate::error::{TableError, TableResult};

/// SQL type of the key column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Text,
    Integer,
}

impl KeyType {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
        }
    }
}

/// Options for the `unicode61` full-text tokenizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tokenizer {
    /// 0 keeps diacritics, 1 and 2 fold them.
    #[serde(alias = "remove_diacritics")]
    pub remove_diacritics: Option<u8>,
    /// Extra characters treated as part of a token.
    #[serde(alias = "token_chars", alias = "tokenchars")]
    pub token_chars: Option<String>,
    /// Extra characters treated as separators.
    pub separators: Option<String>,
}

impl Tokenizer {
    pub fn validate(&self) -> TableResult<()> {
        if let Some(level) = self.remove_diacritics {
            if level > 2 {
                return Err(TableError::InvalidTokenizer(format!(
                    "remove_diacritics must be 0, 1 or 2, got {level}"
                )));
            }
        }
        for (name, chars) in [
            ("token_chars", &self.token_chars),
            ("separators", &self.separators),
        ] {
            if let Some(chars) = chars {
                if chars.contains(['\'', '"']) {
                    return Err(TableError::InvalidTokenizer(format!(
                        "{name} may not contain quote characters"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The `tokenize = "..."` argument of an FTS5 table.
    pub(crate) fn to_sql(&self) -> String {
        let mut options = String::from("unicode61");
        if let Some(level) = self.remove_diacritics {
            options.push_str(&format!(" remove_diacritics {level}"));
        }
        if let Some(chars) = &self.token_chars {
            options.push_str(&format!(" tokenchars '{chars}'"));
        }
        if let Some(chars) = &self.separators {
            options.push_str(&format!(" separators '{chars}'"));
        }
        format!("tokenize = \"{options}\"")
    }
}

/// A declared index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawIndex")]
pub enum IndexSpec {
    /// An expression index over `json_extract(data, path)`.
    Expression { path: String },
    /// A full-text index kept in sync by triggers.
    Fts {
        path: String,
        tokenizer: Option<Tokenizer>,
    },
}

impl IndexSpec {
    pub fn expression(path: impl Into<String>) -> Self {
        Self::Expression { path: path.into() }
    }

    pub fn fts(path: impl Into<String>) -> Self {
        Self::Fts {
            path: path.into(),
            tokenizer: None,
        }
    }

    pub fn fts_with(path: impl Into<String>, tokenizer: Tokenizer) -> Self {
        Self::Fts {
            path: path.into(),
            tokenizer: Some(tokenizer),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Expression { path } | Self::Fts { path, .. } => path,
        }
    }

    pub fn is_fts(&self) -> bool {
        matches!(self, Self::Fts { .. })
    }
}

/// Wire forms accepted for an index entry.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawIndex {
    Path(String),
    Detailed {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        path: String,
        #[serde(default)]
        tokenizer: Option<Tokenizer>,
    },
}

impl TryFrom<RawIndex> for IndexSpec {
    type Error = String;

    fn try_from(raw: RawIndex) -> Result<Self, Self::Error> {
        match raw {
            RawIndex::Path(path) => Ok(match path.strip_prefix("fts:") {
                Some(path) => Self::fts(path),
                None => Self::expression(path),
            }),
            RawIndex::Detailed {
                kind,
                path,
                tokenizer,
            } => match kind.as_deref() {
                None | Some("index") | Some("expression") => {
                    if tokenizer.is_some() {
                        return Err(format!("index \"{path}\" has a tokenizer but is not fts"));
                    }
                    Ok(Self::expression(path))
                }
                Some("fts") => Ok(Self::Fts { path, tokenizer }),
                Some(other) => Err(format!("unknown index type \"{other}\"")),
            },
        }
    }
}

/// Everything needed to create a table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableConfig {
    #[serde(alias = "table_name")]
    pub table_name: String,
    /// Dot path of the key inside each document. `None` uses the row id.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, alias = "key_type")]
    pub key_type: KeyType,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    /// Skip the WAL / synchronous pragmas issued at creation.
    #[serde(default, alias = "disable_pragma_optimization")]
    pub disable_pragma_optimization: bool,
}

impl TableConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            key: None,
            key_type: KeyType::Text,
            indexes: Vec::new(),
            disable_pragma_optimization: false,
        }
    }

    pub fn key(mut self, path: impl Into<String>) -> Self {
        self.key = Some(path.into());
        self
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn disable_pragma_optimization(mut self) -> Self {
        self.disable_pragma_optimization = true;
        self
    }

    /// Check every name and path that will be spliced into SQL.
    pub fn validate(&self) -> TableResult<()> {
        validate_identifier(&self.table_name)?;
        if let Some(key) = &self.key {
            validate_path(key)?;
        }
        for index in &self.indexes {
            validate_path(index.path())?;
            if let IndexSpec::Fts {
                tokenizer: Some(tokenizer),
                ..
            } = index
            {
                tokenizer.validate()?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Identifier and path helpers
// ---------------------------------------------------------------------------

fn is_word(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Table names: ASCII letters, digits and `_`, not starting with a digit.
pub fn validate_identifier(name: &str) -> TableResult<()> {
    let starts_with_digit = name.bytes().next().is_some_and(|b| b.is_ascii_digit());
    if is_word(name) && !starts_with_digit {
        Ok(())
    } else {
        Err(TableError::InvalidIdentifier(name.to_string()))
    }
}

/// Field paths: dot-separated words, each optionally followed by `[n]`
/// array subscripts, e.g. `tags[0].name`.
pub fn validate_path(path: &str) -> TableResult<()> {
    let invalid = || TableError::InvalidPath(path.to_string());
    if path.is_empty() {
        return Err(invalid());
    }
    for segment in path.split('.') {
        let (name, mut rest) = match segment.find('[') {
            Some(at) => segment.split_at(at),
            None => (segment, ""),
        };
        if !is_word(name) {
            return Err(invalid());
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(invalid)?;
            let digits = &rest[1..close];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid());
            }
        }
    }
    Ok(())
}

/// SQLite JSON path for a validated field path.
pub(crate) fn json_path(path: &str) -> String {
    format!("$.{path}")
}

/// `json_extract` over the document column.
pub(crate) fn json_extract(column: &str, path: &str) -> String {
    format!("json_extract({column}, '{}')", json_path(path))
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Suffix used in index and trigger names derived from a field path.
pub(crate) fn path_suffix(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
