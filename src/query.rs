//! Streaming query planner.
//!
//! A [`Query`] is a builder over key filters (prefix, regex), value-field
//! predicates, sort, offset, limit, and field projection. Execution fuses
//! everything over one streaming scan of the backend:
//!
//! - When only a prefix filter is set (no regex, no value predicates) and
//!   the backend supports ranged scans, the whole query pushes down to a
//!   single key-ordered query with limit and offset.
//! - Otherwise entries stream in key order and predicates apply per entry.
//!   A sort combined with a small limit keeps a bounded top-k buffer; a
//!   limit without a sort exits the scan early.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use regex::Regex;
use serde_json::Map;
use tracing::trace;

use crate::codec;
use crate::error::{DatabaseError, Result};
use crate::traits::StorageBackend;
use crate::value::{Value, compare};

/// Keep a bounded top-k buffer only below this many rows.
const TOP_K_THRESHOLD: usize = 1000;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Predicate operator on a resolved document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

impl FilterOp {
    /// Parse the textual operator form (`"="`, `">="`, `"contains"`, …).
    #[must_use]
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" | "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "contains" => Self::Contains,
            "startsWith" => Self::StartsWith,
            "endsWith" => Self::EndsWith,
            "in" => Self::In,
            "notIn" => Self::NotIn,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
struct Filter {
    path: String,
    op: FilterOp,
    rhs: Value,
}

impl Filter {
    fn accepts(&self, document: &Value) -> bool {
        let field = match document.resolve_path(&self.path) {
            Some(Value::Undefined) | None => None,
            other => other,
        };
        match self.op {
            FilterOp::Eq => field == Some(&self.rhs),
            FilterOp::Ne => field.is_none_or(|f| *f != self.rhs),
            FilterOp::Lt => ordered(field, &self.rhs, Ordering::is_lt),
            FilterOp::Le => ordered(field, &self.rhs, Ordering::is_le),
            FilterOp::Gt => ordered(field, &self.rhs, Ordering::is_gt),
            FilterOp::Ge => ordered(field, &self.rhs, Ordering::is_ge),
            FilterOp::Contains => {
                field.is_some_and(|f| f.coerce_string().contains(&self.rhs.coerce_string()))
            }
            FilterOp::StartsWith => {
                field.is_some_and(|f| f.coerce_string().starts_with(&self.rhs.coerce_string()))
            }
            FilterOp::EndsWith => {
                field.is_some_and(|f| f.coerce_string().ends_with(&self.rhs.coerce_string()))
            }
            FilterOp::In => self
                .rhs
                .as_array()
                .is_some_and(|set| field.is_some_and(|f| set.contains(f))),
            FilterOp::NotIn => self
                .rhs
                .as_array()
                .is_some_and(|set| field.is_none_or(|f| !set.contains(f))),
        }
    }
}

fn ordered(field: Option<&Value>, rhs: &Value, test: fn(Ordering) -> bool) -> bool {
    field
        .and_then(|f| compare(f, rhs))
        .is_some_and(test)
}

/// One query result: the entry's key and its decoded document.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub key: String,
    pub document: Value,
}

impl QueryRow {
    /// Resolve a dotted field path on the document. `"key"` resolves to
    /// the entry key.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<Value> {
        if path == "key" {
            return Some(Value::String(self.key.clone()));
        }
        self.document.resolve_path(path).cloned()
    }

    /// Render to the documented result shape: document objects flatten to
    /// `{key, ...document}`; arrays and primitives become `{key, value}`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = Map::new();
        out.insert("key".to_string(), serde_json::Value::String(self.key.clone()));
        match &self.document {
            Value::Object(fields) => {
                for (name, value) in fields {
                    out.insert(name.clone(), codec::to_json(value));
                }
            }
            other => {
                out.insert("value".to_string(), codec::to_json(other));
            }
        }
        serde_json::Value::Object(out)
    }
}

/// Fluent query builder returned by [`crate::Database::query`].
#[derive(Clone)]
pub struct Query {
    backend: Arc<dyn StorageBackend>,
    prefix: Option<String>,
    regex: Option<Regex>,
    filters: Vec<Filter>,
    sort: Option<(String, SortOrder)>,
    limit: Option<usize>,
    offset: usize,
    select: Option<Vec<String>>,
}

impl Query {
    pub(crate) fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            prefix: None,
            regex: None,
            filters: Vec::new(),
            sort: None,
            limit: None,
            offset: 0,
            select: None,
        }
    }

    /// Keep only keys starting with `prefix`.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Keep only keys matching `regex`.
    #[must_use]
    pub fn regex(mut self, regex: Regex) -> Self {
        self.regex = Some(regex);
        self
    }

    /// Add a value predicate on a dotted field path.
    #[must_use]
    pub fn filter(mut self, path: impl Into<String>, op: FilterOp, rhs: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            path: path.into(),
            op,
            rhs: rhs.into(),
        });
        self
    }

    /// Sort by a field path (`"key"` sorts by entry key). Null, undefined,
    /// and missing fields sort to the end in either order.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((field.into(), order));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Project each document object down to the named fields.
    #[must_use]
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Execute and return all matching rows.
    pub async fn get(self) -> Result<Vec<QueryRow>> {
        self.execute().await
    }

    /// Execute the filters only and count matches; sort, limit, and offset
    /// do not apply.
    pub async fn count(mut self) -> Result<usize> {
        self.sort = None;
        self.limit = None;
        self.offset = 0;
        self.select = None;
        Ok(self.execute().await?.len())
    }

    /// Execute with limit 1 and return the first row, if any.
    pub async fn first(mut self) -> Result<Option<QueryRow>> {
        self.limit = Some(1);
        Ok(self.execute().await?.into_iter().next())
    }

    /// Whether any row matches.
    pub async fn exists(self) -> Result<bool> {
        Ok(self.first().await?.is_some())
    }

    /// Field values of every matching row, skipping rows without the field.
    pub async fn pluck(self, path: &str) -> Result<Vec<Value>> {
        let path = path.to_string();
        Ok(self
            .execute()
            .await?
            .into_iter()
            .filter_map(|row| match row.field(&path) {
                Some(Value::Undefined) | None => None,
                value => value,
            })
            .collect())
    }

    fn accepts(&self, key: &str, document: &Value) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(regex) = &self.regex {
            if !regex.is_match(key) {
                return false;
            }
        }
        self.filters.iter().all(|filter| filter.accepts(document))
    }

    /// Push-down is sound only when the backend would apply exactly the
    /// same plan: a prefix range in key order with nothing else to check.
    fn can_push_down(&self) -> bool {
        self.prefix.is_some()
            && self.regex.is_none()
            && self.filters.is_empty()
            && self.sort.as_ref().is_none_or(|(field, _)| field == "key")
    }

    async fn execute(mut self) -> Result<Vec<QueryRow>> {
        if self.can_push_down() {
            let prefix = self.prefix.clone().unwrap_or_default();
            let descending = matches!(self.sort, Some((_, SortOrder::Desc)));
            let rows = self
                .backend
                .scan_prefix(&prefix, descending, self.limit, self.offset)
                .await
                .map_err(DatabaseError::read)?;
            if let Some(rows) = rows {
                trace!(prefix = %prefix, rows = rows.len(), "query pushed down");
                // Limit and offset were applied by the backend.
                self.limit = None;
                self.offset = 0;
                let rows = rows
                    .into_iter()
                    .map(|(key, document)| QueryRow { key, document })
                    .collect();
                return Ok(self.finish(rows, true));
            }
        }

        let mut stream = self
            .backend
            .stream_entries()
            .await
            .map_err(DatabaseError::read)?;
        let wanted = self.limit.map(|limit| limit + self.offset);
        let top_k = self.sort.is_some() && wanted.is_some_and(|w| w < TOP_K_THRESHOLD);

        let mut rows: Vec<QueryRow> = Vec::new();
        while let Some(entry) = stream.next().await {
            let (key, document) = entry.map_err(DatabaseError::read)?;
            if !self.accepts(&key, &document) {
                continue;
            }
            rows.push(QueryRow { key, document });
            match (top_k, wanted) {
                (true, Some(cap)) => {
                    // Bounded buffer: sort and truncate whenever it spills.
                    if rows.len() > cap {
                        self.sort_rows(&mut rows);
                        rows.truncate(cap);
                    }
                }
                (false, Some(cap)) if self.sort.is_none() => {
                    if rows.len() >= cap {
                        break;
                    }
                }
                _ => {}
            }
        }
        Ok(self.finish(rows, false))
    }

    fn finish(&self, mut rows: Vec<QueryRow>, pushed_down: bool) -> Vec<QueryRow> {
        if !pushed_down && self.sort.is_some() {
            self.sort_rows(&mut rows);
        }
        let mut rows: Vec<QueryRow> = rows.into_iter().skip(self.offset).collect();
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        if let Some(select) = &self.select {
            for row in &mut rows {
                if let Value::Object(fields) = &row.document {
                    let mut projected = BTreeMap::new();
                    for name in select {
                        if let Some(value) = fields.get(name) {
                            projected.insert(name.clone(), value.clone());
                        }
                    }
                    row.document = Value::Object(projected);
                }
            }
        }
        rows
    }

    fn sort_rows(&self, rows: &mut [QueryRow]) {
        let Some((field, order)) = &self.sort else {
            return;
        };
        let descending = *order == SortOrder::Desc;
        rows.sort_by(|a, b| {
            let left = sortable(a, field);
            let right = sortable(b, field);
            match (left, right) {
                (None, None) => Ordering::Equal,
                // Absent values land at the end in either direction.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => {
                    let ord = compare(&x, &y).unwrap_or(Ordering::Equal);
                    if descending { ord.reverse() } else { ord }
                }
            }
        });
    }
}

fn sortable(row: &QueryRow, field: &str) -> Option<Value> {
    match row.field(field) {
        Some(Value::Null | Value::Undefined) | None => None,
        value => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::JsonFileBackend;
    use crate::codec::encode;

    async fn seeded_backend() -> (tempfile::TempDir, Arc<dyn StorageBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("q.json"));
        backend.connect().await.unwrap();

        let mut entries = Vec::new();
        for i in 0..30 {
            let doc = Value::object([
                ("n", Value::from(i)),
                ("parity", Value::from(if i % 2 == 0 { "even" } else { "odd" })),
                (
                    "nested",
                    Value::object([("depth", Value::from(i * 10))]),
                ),
            ]);
            entries.push((format!("item:{i:02}"), encode(&doc)));
        }
        entries.push(("plain".to_string(), encode(&Value::from("scalar"))));
        backend.batch_set(entries).await.unwrap();
        (dir, Arc::new(backend))
    }

    fn query(backend: &Arc<dyn StorageBackend>) -> Query {
        Query::new(Arc::clone(backend))
    }

    #[tokio::test]
    async fn prefix_and_filters_compose() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend)
            .prefix("item:")
            .filter("n", FilterOp::Ge, 10)
            .filter("n", FilterOp::Lt, 20)
            .filter("parity", FilterOp::Eq, "even")
            .get()
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
        for row in &rows {
            let n = row.field("n").unwrap().as_f64().unwrap();
            assert!((10.0..20.0).contains(&n));
        }
    }

    #[tokio::test]
    async fn nested_paths_resolve() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend)
            .filter("nested.depth", FilterOp::Gt, 250)
            .get()
            .await
            .unwrap();
        assert_eq!(rows.len(), 4); // 260, 270, 280, 290
    }

    #[tokio::test]
    async fn sort_desc_with_limit_keeps_top_k() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend)
            .prefix("item:")
            .filter("parity", FilterOp::Eq, "odd")
            .sort("n", SortOrder::Desc)
            .limit(3)
            .get()
            .await
            .unwrap();
        let ns: Vec<f64> = rows
            .iter()
            .map(|r| r.field("n").unwrap().as_f64().unwrap())
            .collect();
        assert_eq!(ns, [29.0, 27.0, 25.0]);
    }

    #[tokio::test]
    async fn offset_skips_rows() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend)
            .prefix("item:")
            .sort("n", SortOrder::Asc)
            .offset(28)
            .get()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.first().unwrap().field("n"), Some(Value::from(28)));
    }

    #[tokio::test]
    async fn missing_sort_fields_go_last() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend).sort("n", SortOrder::Desc).get().await.unwrap();
        // "plain" has no "n" field, so it sorts to the end even descending.
        assert_eq!(rows.last().unwrap().key, "plain");
    }

    #[tokio::test]
    async fn string_operators_use_coercion() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend)
            .filter("parity", FilterOp::StartsWith, "ev")
            .count()
            .await
            .unwrap();
        assert_eq!(rows, 15);

        let contains = query(&backend)
            .filter("n", FilterOp::Contains, "9")
            .count()
            .await
            .unwrap();
        assert_eq!(contains, 3); // 9, 19, 29
    }

    #[tokio::test]
    async fn membership_operators() {
        let (_dir, backend) = seeded_backend().await;
        let selected = Value::Array(vec![Value::from(1), Value::from(2), Value::from(3)]);
        let rows = query(&backend)
            .filter("n", FilterOp::In, selected.clone())
            .count()
            .await
            .unwrap();
        assert_eq!(rows, 3);

        let rest = query(&backend)
            .prefix("item:")
            .filter("n", FilterOp::NotIn, selected)
            .count()
            .await
            .unwrap();
        assert_eq!(rest, 27);
    }

    #[tokio::test]
    async fn count_ignores_limit_and_offset() {
        let (_dir, backend) = seeded_backend().await;
        let count = query(&backend)
            .prefix("item:")
            .limit(2)
            .offset(5)
            .count()
            .await
            .unwrap();
        assert_eq!(count, 30);
    }

    #[tokio::test]
    async fn first_and_exists() {
        let (_dir, backend) = seeded_backend().await;
        let first = query(&backend)
            .prefix("item:")
            .sort("n", SortOrder::Desc)
            .first()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.field("n"), Some(Value::from(29)));

        assert!(query(&backend).prefix("item:").exists().await.unwrap());
        assert!(!query(&backend).prefix("nothing:").exists().await.unwrap());
    }

    #[tokio::test]
    async fn pluck_skips_missing_fields() {
        let (_dir, backend) = seeded_backend().await;
        let values = query(&backend).pluck("parity").await.unwrap();
        // "plain" has no parity field and is skipped.
        assert_eq!(values.len(), 30);
    }

    #[tokio::test]
    async fn result_shape_flattens_objects_and_wraps_scalars() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend).prefix("item:00").get().await.unwrap();
        let json = rows.first().unwrap().to_json();
        assert_eq!(json["key"], "item:00");
        assert_eq!(json["n"], 0);

        let rows = query(&backend).prefix("plain").get().await.unwrap();
        let json = rows.first().unwrap().to_json();
        assert_eq!(json["key"], "plain");
        assert_eq!(json["value"], "scalar");
    }

    #[tokio::test]
    async fn select_projects_fields() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend)
            .prefix("item:01")
            .limit(1)
            .select(["parity"])
            .get()
            .await
            .unwrap();
        let doc = rows.first().unwrap().document.as_object().unwrap();
        assert!(doc.contains_key("parity"));
        assert!(!doc.contains_key("n"));
    }

    #[tokio::test]
    async fn regex_filters_keys() {
        let (_dir, backend) = seeded_backend().await;
        let count = query(&backend)
            .regex(Regex::new(r"^item:0[0-4]$").unwrap())
            .count()
            .await
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn unsorted_limit_exits_the_scan_early() {
        let (_dir, backend) = seeded_backend().await;
        let rows = query(&backend).prefix("item:").limit(4).get().await.unwrap();
        assert_eq!(rows.len(), 4);
        // Stream order is key order.
        assert_eq!(rows.first().unwrap().key, "item:00");
    }
}
