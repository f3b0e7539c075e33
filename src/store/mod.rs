//! The document store: the remote source of truth for budgets and months.
//!
//! The `DocumentStore` trait is the seam between the ledger and wherever documents live. Two
//! implementations are provided:
//! - `MemoryStore` keeps everything in memory. It is used by tests and can inject failures.
//! - `SqliteStore` keeps documents as JSON in a SQLite database in the ledger home directory.
//!
//! Documents are JSON objects addressed by `(collection, id)`. Every write stamps the document
//! with a strictly increasing `updated_at`, which is also written into the document body so that
//! it deserializes into `Budget::updated_at` and `Month::updated_at`. Writes are last-write-wins
//! unless the caller passes an `expected_updated_at` precondition.

mod memory;
mod migrations;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Res;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

/// The collection holding `Budget` documents.
pub const BUDGETS: &str = "budgets";

/// The collection holding `Month` documents.
pub const MONTHS: &str = "months";

/// The name of the timestamp field that the store maintains in every document.
pub const UPDATED_AT: &str = "updated_at";

/// A document as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

/// How a write treats an existing document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// When true, `data` is deep-merged into the existing document so that fields absent from
    /// `data` are preserved. When false, the document is replaced.
    pub merge: bool,
    /// When set, the write fails with `PreconditionFailed` unless the stored document currently
    /// has exactly this `updated_at`.
    pub expected_updated_at: Option<DateTime<Utc>>,
}

impl WriteOptions {
    pub fn replace() -> Self {
        Self::default()
    }

    pub fn merge() -> Self {
        Self {
            merge: true,
            expected_updated_at: None,
        }
    }

    /// Adds an `updated_at` precondition.
    pub fn expecting(mut self, updated_at: Option<DateTime<Utc>>) -> Self {
        self.expected_updated_at = updated_at;
        self
    }
}

/// A query predicate on a top-level field of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field == value`
    Eq(String, Value),
    /// `field >= value`, for numbers or strings.
    Gte(String, Value),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    /// True if `data` satisfies this filter. A missing field never matches.
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Filter::Eq(field, value) => data.get(field) == Some(value),
            Filter::Gte(field, value) => match (data.get(field), value) {
                (Some(Value::Number(a)), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a >= b,
                    _ => false,
                },
                (Some(Value::String(a)), Value::String(b)) => a >= b,
                _ => false,
            },
        }
    }
}

/// Returned (inside the `anyhow::Error`) when a write's `expected_updated_at` does not match the
/// stored document. Use `is_precondition_failed` to detect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionFailed {
    pub collection: String,
    pub id: String,
    pub expected: Option<DateTime<Utc>>,
    pub actual: Option<DateTime<Utc>>,
}

impl Display for PreconditionFailed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Document {}/{} was modified concurrently (expected updated_at {:?}, found {:?})",
            self.collection, self.id, self.expected, self.actual
        )
    }
}

impl std::error::Error for PreconditionFailed {}

/// True if `e`, or any error in its chain, is a `PreconditionFailed`.
pub fn is_precondition_failed(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| cause.downcast_ref::<PreconditionFailed>().is_some())
}

/// The interface to the remote document store.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads one document. Returns `Ok(None)` if it does not exist.
    async fn read(&self, collection: &str, id: &str) -> Res<Option<Document>>;

    /// Writes one document and returns the `updated_at` it was stamped with.
    async fn write(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        options: WriteOptions,
    ) -> Res<DateTime<Utc>>;

    /// Returns every document of `collection` that satisfies all `filters`, in no particular
    /// order.
    async fn query(&self, collection: &str, filters: &[Filter]) -> Res<Vec<Document>>;

    /// Deletes one document. Deleting a document that does not exist is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Res<()>;
}

/// Deep-merges `patch` into `target`. Objects are merged key by key, recursively; any other value
/// in `patch` replaces the value in `target`.
pub(crate) fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Returns a timestamp that is later than `last`, preferring the current time.
pub(crate) fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

/// Applies a write to an optional existing document body and stamps it with `updated_at`.
pub(crate) fn apply_write(
    existing: Option<Value>,
    data: Value,
    merge: bool,
    updated_at: DateTime<Utc>,
) -> Res<Value> {
    let mut body = match (existing, merge) {
        (Some(mut existing), true) => {
            merge_json(&mut existing, data);
            existing
        }
        _ => data,
    };
    match body.as_object_mut() {
        Some(object) => {
            object.insert(UPDATED_AT.to_string(), serde_json::to_value(updated_at)?);
        }
        None => anyhow::bail!("Documents must be JSON objects"),
    }
    Ok(body)
}

/// Serializes `value` into a JSON object, dropping its `updated_at` so that the store stamps it.
pub(crate) fn to_document<T: serde::Serialize>(value: &T) -> Res<Value> {
    let mut data = serde_json::to_value(value)?;
    if let Some(object) = data.as_object_mut() {
        object.remove(UPDATED_AT);
    }
    Ok(data)
}

/// Builds a JSON object from `(field, value)` pairs, for partial merge writes.
pub(crate) fn fields<I, K>(pairs: I) -> Value
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    Value::Object(
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<Map<String, Value>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_preserves_siblings() {
        let mut target = json!({
            "a": 1,
            "nested": { "x": 1, "y": 2 },
            "list": [1, 2, 3]
        });
        merge_json(
            &mut target,
            json!({ "nested": { "y": 20, "z": 30 }, "list": [9], "b": true }),
        );
        assert_eq!(
            target,
            json!({
                "a": 1,
                "nested": { "x": 1, "y": 20, "z": 30 },
                "list": [9],
                "b": true
            })
        );
    }

    #[test]
    fn filters() {
        let doc = json!({ "budget_id": "b1", "year_month_ordinal": 202405 });
        assert!(Filter::eq("budget_id", "b1").matches(&doc));
        assert!(!Filter::eq("budget_id", "b2").matches(&doc));
        assert!(Filter::gte("year_month_ordinal", 202405).matches(&doc));
        assert!(Filter::gte("year_month_ordinal", 202312).matches(&doc));
        assert!(!Filter::gte("year_month_ordinal", 202406).matches(&doc));
        assert!(!Filter::eq("missing", "x").matches(&doc));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let far_future = Utc::now() + Duration::days(1);
        let next = next_timestamp(Some(far_future));
        assert!(next > far_future);
        let mut last = None;
        for _ in 0..100 {
            let ts = next_timestamp(last);
            if let Some(last) = last {
                assert!(ts > last);
            }
            last = Some(ts);
        }
    }

    #[test]
    fn apply_write_stamps_and_merges() {
        let ts = Utc::now();
        let body = apply_write(Some(json!({ "a": 1, "b": 2 })), json!({ "b": 3 }), true, ts).unwrap();
        assert_eq!(body["a"], json!(1));
        assert_eq!(body["b"], json!(3));
        let stamped: DateTime<Utc> = serde_json::from_value(body[UPDATED_AT].clone()).unwrap();
        assert_eq!(stamped, ts);

        let replaced = apply_write(Some(json!({ "a": 1 })), json!({ "b": 3 }), false, ts).unwrap();
        assert!(replaced.get("a").is_none());

        assert!(apply_write(None, json!([1]), false, ts).is_err());
    }
}
