//! Implements the `DocumentStore` trait on top of a SQLite database using `sqlx`.
//!
//! Each document is one row of the `documents` table, keyed by `(collection, id)`, with its JSON
//! body in `data`. Queries load a collection and filter in process, which is adequate for the
//! number of months a single budget accumulates.

use crate::error::Res;
use crate::store::{
    apply_write, migrations, next_timestamp, Document, DocumentStore, Filter,
    PreconditionFailed, WriteOptions,
};
use anyhow::{bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// A `DocumentStore` backed by a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    pool: SqlitePool,
    last_timestamp: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SqliteStore {
    /// - Validates that no file currently exists at `path`
    /// - Creates a new SQLite file at `path`
    /// - Initializes the schema
    pub async fn init(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        if path.exists() {
            bail!("A database already exists at '{}'", path.display());
        }
        let pool = connect(path, true).await?;
        migrations::bootstrap(&pool).await?;
        migrations::run(&pool, 0, migrations::CURRENT_VERSION).await?;
        debug!("Created SQLite store at {}", path.display());
        Ok(Self::new(path, pool))
    }

    /// - Validates that there is a SQLite file at `path`
    /// - Updates the schema with migrations if it is out-of-date
    pub async fn load(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("The database file is missing '{}'", path.display());
        }
        let pool = connect(path, false).await?;
        migrations::bootstrap(&pool).await?;
        let version = migrations::version(&pool).await?;
        if version > migrations::CURRENT_VERSION {
            bail!(
                "The database schema version {version} is newer than this program supports ({})",
                migrations::CURRENT_VERSION
            );
        }
        migrations::run(&pool, version, migrations::CURRENT_VERSION).await?;
        Ok(Self::new(path, pool))
    }

    fn new(path: &Path, pool: SqlitePool) -> Self {
        Self {
            path: path.to_path_buf(),
            pool,
            last_timestamp: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of documents in `collection`.
    pub async fn count(&self, collection: &str) -> Res<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Unable to count documents in {collection}"))?;
        Ok(u64::try_from(row.0).unwrap_or_default())
    }

    /// The next strictly increasing timestamp, never earlier than `floor`.
    fn stamp(&self, floor: Option<DateTime<Utc>>) -> Res<DateTime<Utc>> {
        let mut last = match self.last_timestamp.lock() {
            Ok(guard) => guard,
            Err(_) => bail!("The timestamp lock is poisoned"),
        };
        let ts = next_timestamp((*last).max(floor));
        *last = Some(ts);
        Ok(ts)
    }
}

async fn connect(path: &Path, create: bool) -> Res<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .context("Failed to parse SQLite connection string")?
        .create_if_missing(create);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Unable to open SQLite database '{}'", path.display()))
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Res<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{s}'"))?
        .with_timezone(&Utc))
}

fn to_document(id: String, data: &str, updated_at: &str) -> Res<Document> {
    let data: Value = serde_json::from_str(data)
        .with_context(|| format!("Document '{id}' does not contain valid JSON"))?;
    Ok(Document {
        id,
        data,
        updated_at: parse_ts(updated_at)?,
    })
}

#[async_trait::async_trait]
impl DocumentStore for SqliteStore {
    async fn read(&self, collection: &str, id: &str) -> Res<Option<Document>> {
        trace!("read {collection}/{id}");
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT data, updated_at FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Unable to read {collection}/{id}"))?;
        row.map(|(data, updated_at)| to_document(id.to_string(), &data, &updated_at))
            .transpose()
    }

    async fn write(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        options: WriteOptions,
    ) -> Res<DateTime<Utc>> {
        trace!("write {collection}/{id} (merge: {})", options.merge);
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin write transaction")?;

        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT data, updated_at FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("Unable to read {collection}/{id} before writing"))?;
        let existing = row
            .map(|(data, updated_at)| to_document(id.to_string(), &data, &updated_at))
            .transpose()?;

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

        let updated_at = self.stamp(existing.as_ref().map(|d| d.updated_at))?;
        let body = apply_write(existing.map(|d| d.data), data, options.merge, updated_at)
            .with_context(|| format!("Unable to write {collection}/{id}"))?;
        let json = serde_json::to_string(&body).context("Unable to serialize document")?;

        sqlx::query(
            "INSERT INTO documents (collection, id, data, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (collection, id) DO UPDATE SET \
             data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(collection)
        .bind(id)
        .bind(json)
        .bind(format_ts(updated_at))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Unable to write {collection}/{id}"))?;

        tx.commit()
            .await
            .context("Failed to commit write transaction")?;
        Ok(updated_at)
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Res<Vec<Document>> {
        trace!("query {collection} {filters:?}");
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT id, data, updated_at FROM documents WHERE collection = ? ORDER BY id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Unable to query {collection}"))?;

        let mut docs = Vec::new();
        for (id, data, updated_at) in rows {
            let doc = to_document(id, &data, &updated_at)?;
            if filters.iter().all(|f| f.matches(&doc.data)) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn delete(&self, collection: &str, id: &str) -> Res<()> {
        trace!("delete {collection}/{id}");
        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Unable to delete {collection}/{id}"))?;
        Ok(())
    }
}
