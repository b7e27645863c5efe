//! Search and Pagination
//!
//! Searches come back as a lazy [`Stream`](futures_util::Stream) that fetches
//! one page of `step_size` rows at a time. Dropping the stream stops paging;
//! calling `search` again starts over from the first page.
//!
//! # Paging Modes
//!
//! - **Keyset** (default): rows are ordered by key (or row id) and each page
//!   continues after the last key seen, so pages stay cheap however deep the
//!   scan goes.
//! - **Sorted** (`sort_by` set): rows are ordered by the JSON expression, ties
//!   broken by key, and pages advance with `OFFSET`.
//!
//! `offset` skips rows before the first page; `limit` caps the total.
//!
//! # Projection
//!
//! `select` keeps only the listed field paths of each document, nested as in
//! the stored document, before it is decoded. Fields a document lacks are
//! left out, so the target type must tolerate them missing.

use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::backend::Row;
use super::config::{json_extract, validate_path};
use super::document::{lookup, Document, RowKey};
use super::table::TableInner;
use super::where_clause::{Fragment, Where};
use crate::error::{BackendError, TableError, TableResult};

const DEFAULT_STEP_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Order {
    #[default]
    #[serde(rename = "asc", alias = "ASC")]
    Asc,
    #[serde(rename = "desc", alias = "DESC")]
    Desc,
}

impl Order {
    fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// What to search for and how to page through it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    #[serde(alias = "sort_by")]
    pub sort_by: Option<String>,
    pub order: Order,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(rename = "where")]
    pub filter: Option<Where>,
    /// Rows fetched per page. Defaults to 100.
    #[serde(alias = "step_size")]
    pub step_size: Option<usize>,
    /// Field paths to keep; `None` keeps whole documents.
    pub select: Option<Vec<String>>,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort_by(mut self, path: impl Into<String>) -> Self {
        self.sort_by = Some(path.into());
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn step_size(mut self, step_size: usize) -> Self {
        self.step_size = Some(step_size);
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Everything about a search that stays fixed across pages.
struct PagePlan {
    query: String,
    fields: Option<Vec<String>>,
    filter: Option<Fragment>,
    identity: &'static str,
    sort: Option<String>,
    order: Order,
    step: usize,
    limit: Option<usize>,
    offset: usize,
}

type PageState<T> = (Arc<TableInner<T>>, PagePlan, Cursor);

#[derive(Default)]
struct Cursor {
    after: Option<RowKey>,
    fetched: usize,
    done: bool,
}

impl<T: Document> TableInner<T> {
    fn plan(&self, options: &SearchOptions) -> TableResult<PagePlan> {
        let filter = match &options.filter {
            Some(filter) => filter.compile(&self.scope())?,
            None => None,
        };
        let sort = match &options.sort_by {
            Some(path) => {
                validate_path(path)?;
                Some(json_extract("data", path))
            }
            None => None,
        };
        if let Some(fields) = &options.select {
            for path in fields {
                validate_path(path)?;
                if path.contains('[') {
                    return Err(TableError::InvalidPath(path.clone()));
                }
            }
        }
        Ok(PagePlan {
            query: format!(
                "SELECT {} AS __key, data FROM {}",
                self.schema.identity, self.schema.table
            ),
            fields: options.select.clone(),
            filter,
            identity: self.schema.identity,
            sort,
            order: options.order,
            step: options.step_size.unwrap_or(DEFAULT_STEP_SIZE).max(1),
            limit: options.limit,
            offset: options.offset.unwrap_or(0),
        })
    }

    async fn fetch_page(
        &self,
        plan: &PagePlan,
        cursor: &Cursor,
        size: usize,
    ) -> TableResult<Vec<(RowKey, T)>> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if let Some(filter) = &plan.filter {
            conditions.push(format!("({})", filter.sql));
            params.extend(filter.params.iter().cloned());
        }

        let dir = plan.order.sql();
        let (order_by, offset) = match &plan.sort {
            Some(sort) => (
                format!("{sort} {dir}, {} {dir}", plan.identity),
                plan.offset + cursor.fetched,
            ),
            None => {
                if let Some(after) = &cursor.after {
                    let op = match plan.order {
                        Order::Asc => ">",
                        Order::Desc => "<",
                    };
                    conditions.push(format!("{} {op} ?", plan.identity));
                    params.push(after.to_param());
                }
                let offset = if cursor.after.is_none() { plan.offset } else { 0 };
                (format!("{} {dir}", plan.identity), offset)
            }
        };

        let mut sql = plan.query.clone();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {order_by} LIMIT ? OFFSET ?"));
        params.push(Value::from(size as u64));
        params.push(Value::from(offset as u64));

        let rows = self.backend.select(&sql, &params).await?;
        rows.iter()
            .map(|row| decode_selected::<T>(row, plan.fields.as_deref()))
            .collect()
    }

    /// Lazily page through every row matching `options`.
    pub(crate) fn search_keyed(
        self: &Arc<Self>,
        options: &SearchOptions,
    ) -> BoxStream<'static, TableResult<(RowKey, T)>> {
        let plan = match self.plan(options) {
            Ok(plan) => plan,
            Err(error) => return stream::iter([Err(error)]).boxed(),
        };

        stream::try_unfold((Arc::clone(self), plan, Cursor::default()), |state| {
            Self::next_page(state)
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn next_page(
        (table, plan, mut cursor): PageState<T>,
    ) -> TableResult<Option<(Vec<(RowKey, T)>, PageState<T>)>> {
        if cursor.done {
            return Ok(None);
        }
        let size = match plan.limit {
            Some(limit) => plan.step.min(limit.saturating_sub(cursor.fetched)),
            None => plan.step,
        };
        if size == 0 {
            return Ok(None);
        }

        let page = table.fetch_page(&plan, &cursor, size).await?;
        if page.is_empty() {
            return Ok(None);
        }
        cursor.fetched += page.len();
        cursor.done = page.len() < size;
        cursor.after = page.last().map(|(key, _)| key.clone());
        Ok(Some((page, (table, plan, cursor))))
    }

    pub(crate) async fn collect_keyed(
        self: &Arc<Self>,
        options: &SearchOptions,
    ) -> TableResult<Vec<(RowKey, T)>> {
        self.search_keyed(options).try_collect().await
    }
}

pub(crate) fn decode_row<T: Document>(row: &Row) -> TableResult<(RowKey, T)> {
    decode_selected(row, None)
}

fn decode_selected<T: Document>(
    row: &Row,
    fields: Option<&[String]>,
) -> TableResult<(RowKey, T)> {
    let key = row
        .get("__key")
        .and_then(RowKey::from_cell)
        .ok_or_else(|| BackendError::Other("result row has no usable key".into()))?;
    let doc = match fields {
        None => decode_data(row)?,
        Some(fields) => {
            let full: Value = decode_data(row)?;
            serde_json::from_value(project(&full, fields))?
        }
    };
    Ok((key, doc))
}

/// Copy the `fields` of `doc` into a fresh object, keeping their nesting.
fn project(doc: &Value, fields: &[String]) -> Value {
    let mut out = Map::new();
    for path in fields {
        let Some(value) = lookup(doc, path) else {
            continue;
        };
        let mut segments = path.split('.').peekable();
        let mut target = &mut out;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                target.insert(segment.to_string(), value.clone());
                break;
            }
            let slot = target
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match slot {
                Value::Object(map) => target = map,
                // A shorter selected path already copied this subtree whole.
                _ => break,
            }
        }
    }
    Value::Object(out)
}

pub(crate) fn decode_data<T: Document>(row: &Row) -> TableResult<T> {
    match row.get("data") {
        Some(Value::String(text)) => Ok(serde_json::from_str(text)?),
        _ => Err(TableError::Backend(BackendError::Other(
            "result row has no document column".into(),
        ))),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_deserialize_with_camel_case_and_where() {
        let options: SearchOptions = serde_json::from_value(json!({
            "sortBy": "price",
            "order": "desc",
            "limit": 5,
            "stepSize": 2,
            "where": { "price": { "gt": 15 } }
        }))
        .unwrap();

        assert_eq!(
            options,
            SearchOptions::new()
                .sort_by("price")
                .order(Order::Desc)
                .limit(5)
                .step_size(2)
                .filter(Where::gt("price", 15))
        );
    }

    #[test]
    fn rows_decode_into_keyed_documents() {
        let mut row = Row::new();
        row.insert("__key".into(), json!("a"));
        row.insert("data".into(), json!(r#"{"n":1}"#));
        let (key, doc): (RowKey, Value) = decode_row(&row).unwrap();
        assert_eq!(key, RowKey::from("a"));
        assert_eq!(doc, json!({ "n": 1 }));

        row.remove("data");
        assert!(decode_row::<Value>(&row).is_err());
    }

    #[test]
    fn projection_keeps_nesting_and_skips_missing_fields() {
        let doc = json!({
            "id": "a",
            "price": 3,
            "meta": { "color": "red", "size": 2 },
            "tags": ["x"]
        });
        let fields: Vec<String> = ["id", "meta.color", "missing", "missing.deep"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            project(&doc, &fields),
            json!({ "id": "a", "meta": { "color": "red" } })
        );

        let overlapping = vec!["meta".to_string(), "meta.size".to_string()];
        assert_eq!(
            project(&doc, &overlapping),
            json!({ "meta": { "color": "red", "size": 2 } })
        );
    }

    #[test]
    fn select_deserializes_as_a_path_list() {
        let options: SearchOptions =
            serde_json::from_value(json!({ "select": ["id", "meta.color"] })).unwrap();
        assert_eq!(options, SearchOptions::new().select(["id", "meta.color"]));
    }
}
