//! Implements the `DocumentStore` trait in memory.
//!
//! Note: this is compiled even in the "production" version of this crate so that the whole ledger
//! can be exercised, top-to-bottom, without a database. It can also simulate the misbehavior of a
//! remote store: failing writes or reads, and returning query results in an arbitrary order.

use crate::error::Res;
use crate::store::{
    apply_write, next_timestamp, Document, DocumentStore, Filter, PreconditionFailed,
    WriteOptions, UPDATED_AT,
};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

/// An in-memory `DocumentStore`. Cloning it yields another handle to the same documents, which is
/// how tests play the role of a second device writing to the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Document>>,
    last_timestamp: Option<DateTime<Utc>>,
    failing_writes: Vec<WriteFailure>,
    fail_reads: bool,
    scramble_queries: bool,
    writes: usize,
    queries: usize,
}

#[derive(Debug, Clone)]
struct WriteFailure {
    collection: String,
    /// `None` fails writes to any document of the collection.
    id: Option<String>,
    /// How many more writes to fail; `None` fails forever.
    remaining: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Res<MutexGuard<'_, MemoryState>> {
        match self.state.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => bail!("The memory store lock is poisoned"),
        }
    }

    /// Makes every write to `collection/id` fail until `clear_failures` is called.
    pub fn fail_writes_to(&self, collection: &str, id: &str) {
        self.push_failure(WriteFailure {
            collection: collection.to_string(),
            id: Some(id.to_string()),
            remaining: None,
        });
    }

    /// Makes the next `count` writes to any document in `collection` fail.
    pub fn fail_next_writes(&self, collection: &str, count: usize) {
        self.push_failure(WriteFailure {
            collection: collection.to_string(),
            id: None,
            remaining: Some(count),
        });
    }

    /// Makes every read and query fail, as if the store were unreachable.
    pub fn set_fail_reads(&self, fail: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_reads = fail;
        }
    }

    /// Returns query results in reverse-interleaved id order instead of id order.
    pub fn set_scramble_queries(&self, scramble: bool) {
        if let Ok(mut state) = self.lock() {
            state.scramble_queries = scramble;
        }
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.lock() {
            state.failing_writes.clear();
            state.fail_reads = false;
        }
    }

    /// The number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().map(|s| s.writes).unwrap_or_default()
    }

    /// The number of queries so far.
    pub fn query_count(&self) -> usize {
        self.lock().map(|s| s.queries).unwrap_or_default()
    }

    fn push_failure(&self, failure: WriteFailure) {
        if let Ok(mut state) = self.lock() {
            state.failing_writes.push(failure);
        }
    }
}

impl MemoryState {
    /// Consumes one matching injected failure, returning true if this write must fail.
    fn take_failure(&mut self, collection: &str, id: &str) -> bool {
        let position = self.failing_writes.iter().position(|f| {
            f.collection == collection && f.id.as_deref().map_or(true, |fid| fid == id)
        });
        let Some(position) = position else {
            return false;
        };
        let failure = &mut self.failing_writes[position];
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.failing_writes.remove(position);
            }
        }
        true
    }
}

/// Reorders `docs` deterministically so that they are clearly not in id order.
fn scramble(mut docs: Vec<Document>) -> Vec<Document> {
    docs.reverse();
    let (odd, even): (Vec<_>, Vec<_>) = docs
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % 2 == 1);
    odd.into_iter().chain(even).map(|(_, d)| d).collect()
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, collection: &str, id: &str) -> Res<Option<Document>> {
        trace!("read {collection}/{id}");
        let state = self.lock()?;
        if state.fail_reads {
            bail!("Simulated read failure for {collection}/{id}");
        }
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn write(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        options: WriteOptions,
    ) -> Res<DateTime<Utc>> {
        trace!("write {collection}/{id} (merge: {})", options.merge);
        let mut state = self.lock()?;
        if state.take_failure(collection, id) {
            bail!("Simulated write failure for {collection}/{id}");
        }

        let existing = state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned();

        if let Some(expected) = options.expected_updated_at {
            let actual = existing.as_ref().map(|d| d.updated_at);
            if actual != Some(expected) {
                return Err(PreconditionFailed {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    expected: Some(expected),
                    actual,
                }
                .into());
            }
        }

        let updated_at = next_timestamp(state.last_timestamp);
        let body = apply_write(existing.map(|d| d.data), data, options.merge, updated_at)
            .with_context(|| format!("Unable to write {collection}/{id}"))?;
        debug_assert!(body.get(UPDATED_AT).is_some());

        state.last_timestamp = Some(updated_at);
        state.writes += 1;
        state.collections.entry(collection.to_string()).or_default().insert(
            id.to_string(),
            Document {
                id: id.to_string(),
                data: body,
                updated_at,
            },
        );
        Ok(updated_at)
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Res<Vec<Document>> {
        trace!("query {collection} {filters:?}");
        let mut state = self.lock()?;
        if state.fail_reads {
            bail!("Simulated query failure for {collection}");
        }
        state.queries += 1;
        let docs: Vec<Document> = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|d| filters.iter().all(|f| f.matches(&d.data)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if state.scramble_queries {
            Ok(scramble(docs))
        } else {
            Ok(docs)
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Res<()> {
        trace!("delete {collection}/{id}");
        let mut state = self.lock()?;
        if state.take_failure(collection, id) {
            bail!("Simulated delete failure for {collection}/{id}");
        }
        if let Some(docs) = state.collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }
}
