use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast;

use shared::protocol::{Document, FieldValue, Fields, Patch, Query};

const CHANGE_FEED_CAPACITY: usize = 1024;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Emitted after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub collection: String,
    pub document_id: String,
}

/// Document store over SQLite. Documents are JSON objects grouped by
/// collection path; ids and timestamps are assigned here, never by callers.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    clock: Arc<AtomicI64>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        // Every connection to an in-memory url opens its own empty database,
        // so those run on exactly one connection that is never recycled.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let storage = Self {
            pool,
            clock: Arc::new(AtomicI64::new(0)),
            changes,
        };
        storage.ensure_documents_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }

    /// Next value of the store clock in epoch millis. Strictly increasing
    /// within this process even if the wall clock stalls or steps back.
    pub fn next_server_time(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .clock
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    async fn ensure_documents_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                doc_id     TEXT NOT NULL,
                body       TEXT NOT NULL,
                UNIQUE (collection, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure documents table exists")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS documents_by_collection ON documents (collection, seq)")
            .execute(&self.pool)
            .await
            .context("failed to ensure documents index exists")?;
        Ok(())
    }

    pub async fn add_document(&self, collection: &str, patch: &Patch) -> Result<String> {
        let doc_id = uuid::Uuid::new_v4().simple().to_string();
        let mut fields = Map::new();
        apply_patch(&mut fields, patch, self.next_server_time());
        sqlx::query("INSERT INTO documents (collection, doc_id, body) VALUES (?, ?, ?)")
            .bind(collection)
            .bind(&doc_id)
            .bind(encode_body(fields)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to insert document into '{collection}'"))?;
        self.notify(collection, &doc_id);
        Ok(doc_id)
    }

    /// Create or fully replace a document under a caller-chosen id.
    pub async fn put_document(&self, collection: &str, doc_id: &str, patch: &Patch) -> Result<()> {
        let mut fields = Map::new();
        apply_patch(&mut fields, patch, self.next_server_time());
        sqlx::query(
            "INSERT INTO documents (collection, doc_id, body) VALUES (?, ?, ?)
             ON CONFLICT(collection, doc_id) DO UPDATE SET body = excluded.body",
        )
        .bind(collection)
        .bind(doc_id)
        .bind(encode_body(fields)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to put document '{collection}/{doc_id}'"))?;
        self.notify(collection, doc_id);
        Ok(())
    }

    /// Returns `false` when the document does not exist.
    ///
    /// The read-modify-write runs under `BEGIN IMMEDIATE`, so concurrent
    /// updates queue on the write lock instead of failing on upgrade.
    pub async fn update_document(
        &self,
        collection: &str,
        doc_id: &str,
        patch: &Patch,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to lock '{collection}/{doc_id}' for update"))?;

        let updated = match self.patch_locked(&mut conn, collection, doc_id, patch).await {
            Ok(updated) => updated,
            Err(err) => {
                if sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
                    conn.close_on_drop();
                }
                return Err(err);
            }
        };
        let finish = if updated { "COMMIT" } else { "ROLLBACK" };
        if let Err(err) = sqlx::query(finish).execute(&mut *conn).await {
            conn.close_on_drop();
            return Err(err)
                .with_context(|| format!("failed to finish update of '{collection}/{doc_id}'"));
        }
        if updated {
            self.notify(collection, doc_id);
        }
        Ok(updated)
    }

    async fn patch_locked(
        &self,
        conn: &mut SqliteConnection,
        collection: &str,
        doc_id: &str,
        patch: &Patch,
    ) -> Result<bool> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(doc_id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut fields = decode_body(&row.try_get::<String, _>("body")?)?;
        apply_patch(&mut fields, patch, self.next_server_time());
        sqlx::query("UPDATE documents SET body = ? WHERE collection = ? AND doc_id = ?")
            .bind(encode_body(fields)?)
            .bind(collection)
            .bind(doc_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to update document '{collection}/{doc_id}'"))?;
        Ok(true)
    }

    /// Returns `false` when the document does not exist.
    pub async fn delete_document(&self, collection: &str, doc_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete document '{collection}/{doc_id}'"))?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.notify(collection, doc_id);
        }
        Ok(deleted)
    }

    pub async fn get_document(&self, collection: &str, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT doc_id, body FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row_to_document(&row)).transpose()
    }

    /// Run a query. Candidates are read in insertion order, so ordering ties
    /// resolve to document creation order.
    pub async fn query_documents(&self, query: &Query) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT doc_id, body FROM documents WHERE collection = ? ORDER BY seq ASC",
        )
        .bind(&query.collection)
        .fetch_all(&self.pool)
        .await?;
        let documents = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(query.apply(documents))
    }

    fn notify(&self, collection: &str, doc_id: &str) {
        let _ = self.changes.send(ChangeNotice {
            collection: collection.to_owned(),
            document_id: doc_id.to_owned(),
        });
    }
}

/// Apply field writes in order. Dotted paths address nested objects and
/// create intermediate objects as needed.
pub fn apply_patch(fields: &mut Fields, patch: &Patch, server_time_ms: i64) {
    for (path, value) in patch.entries() {
        match value {
            FieldValue::Value(value) => write_path(fields, path, value.clone()),
            FieldValue::ServerTimestamp => write_path(fields, path, Value::from(server_time_ms)),
            FieldValue::Delete => remove_path(fields, path),
        }
    }
}

fn write_path(fields: &mut Fields, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        let entry = current
            .entry((*segment).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Some(map) = entry.as_object_mut() else {
            return;
        };
        current = map;
    }
    current.insert((*last).to_owned(), value);
}

fn remove_path(fields: &mut Fields, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        let Some(map) = current.get_mut(*segment).and_then(Value::as_object_mut) else {
            return;
        };
        current = map;
    }
    current.remove(*last);
}

fn encode_body(fields: Fields) -> Result<String> {
    serde_json::to_string(&Value::Object(fields)).context("failed to encode document body")
}

fn decode_body(raw: &str) -> Result<Fields> {
    match serde_json::from_str::<Value>(raw).context("failed to decode document body")? {
        Value::Object(fields) => Ok(fields),
        other => anyhow::bail!("document body is not an object: {other}"),
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let doc_id: String = row.try_get("doc_id")?;
    let body: String = row.try_get("body")?;
    Ok(Document::new(doc_id, decode_body(&body)?))
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
