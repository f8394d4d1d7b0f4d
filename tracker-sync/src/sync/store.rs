use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::{
    Row, Sqlite, SqlitePool, Transaction, migrate::Migrator, sqlite::SqliteConnectOptions,
};
use thiserror::Error;
use tracker_core::unix_millis_now;

use super::registry::{RegistryError, ResourceRegistry};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Equality filter for cached records: every entry must match the record's
/// top-level field of the same name.
pub type RecordFilter = Map<String, Value>;

const META_UPSERT: &str = "INSERT INTO meta (key, value, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET
        value = excluded.value,
        updated_at = excluded.updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON in store: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{kind} record has no usable id")]
    MissingId { kind: String },
}

/// SQLite-backed cache: one `records_<kind>` table per known resource kind
/// plus a `meta` key/value table.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    registry: Arc<ResourceRegistry>,
}

impl LocalStore {
    pub fn from_pool(pool: SqlitePool, registry: Arc<ResourceRegistry>) -> Self {
        Self { pool, registry }
    }

    pub async fn new(
        database_url: &str,
        registry: Arc<ResourceRegistry>,
    ) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool, registry };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(path: &Path, registry: Arc<ResourceRegistry>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool, registry };
        store.init().await?;
        Ok(store)
    }

    /// Creates the meta table and one table per descriptor. Safe to repeat.
    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        for descriptor in self.registry.descriptors() {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY NOT NULL,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                table_name(descriptor.kind)
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Upserts a record under its id and returns that id.
    pub async fn put_record(&self, kind: &str, record: &Value) -> Result<String, StoreError> {
        let table = self.table(kind)?;
        let id = record_id(record).ok_or_else(|| StoreError::MissingId {
            kind: kind.to_string(),
        })?;
        sqlx::query(&upsert_sql(&table))
            .bind(&id)
            .bind(serde_json::to_string(record)?)
            .bind(unix_millis_now())
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get_record(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let table = self.table(kind)?;
        let row = sqlx::query(&format!("SELECT body FROM {table} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.try_get("body")?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    /// All records of `kind` in first-insertion order, optionally narrowed
    /// by an equality filter.
    pub async fn get_all(
        &self,
        kind: &str,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<Value>, StoreError> {
        let table = self.table(kind)?;
        let rows = sqlx::query(&format!("SELECT body FROM {table} ORDER BY rowid ASC"))
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            let record: Value = serde_json::from_str(&body)?;
            if filter.is_none_or(|filter| matches_filter(&record, filter)) {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub async fn delete_record(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let table = self.table(kind)?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear(&self, kind: &str) -> Result<(), StoreError> {
        let table = self.table(kind)?;
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self, kind: &str) -> Result<i64, StoreError> {
        let table = self.table(kind)?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn put_meta(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        sqlx::query(META_UPSERT)
            .bind(key)
            .bind(serde_json::to_string(value)?)
            .bind(unix_millis_now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;
        Ok(Some(serde_json::from_str(&value)?))
    }

    /// Replaces every resource table with `records` and writes `meta_value`
    /// under `meta_key`, all in one transaction. On error nothing changes.
    pub async fn rebuild(
        &self,
        records: &BTreeMap<String, Vec<Value>>,
        meta_key: &str,
        meta_value: &Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match self
            .write_rebuild(&mut tx, records, meta_key, meta_value)
            .await
        {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    async fn write_rebuild(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        records: &BTreeMap<String, Vec<Value>>,
        meta_key: &str,
        meta_value: &Value,
    ) -> Result<(), StoreError> {
        let now = unix_millis_now();
        for descriptor in self.registry.descriptors() {
            let sql = format!("DELETE FROM {}", table_name(descriptor.kind));
            sqlx::query(&sql).execute(&mut **tx).await?;
        }

        for (kind, items) in records {
            let sql = upsert_sql(&self.table(kind)?);
            for record in items {
                let id = record_id(record).ok_or_else(|| StoreError::MissingId {
                    kind: kind.clone(),
                })?;
                sqlx::query(&sql)
                    .bind(id)
                    .bind(serde_json::to_string(record)?)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;
            }
        }

        sqlx::query(META_UPSERT)
            .bind(meta_key)
            .bind(serde_json::to_string(meta_value)?)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn table(&self, kind: &str) -> Result<String, StoreError> {
        let descriptor = self.registry.lookup(kind)?;
        Ok(table_name(descriptor.kind))
    }
}

// Kinds are validated as lowercase identifiers by the registry, so they are
// safe to splice into SQL.
fn table_name(kind: &str) -> String {
    format!("\"records_{kind}\"")
}

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (id, body, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            body = excluded.body,
            updated_at = excluded.updated_at"
    )
}

/// Stable id of a record: a non-empty string, or a number in decimal form.
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub fn matches_filter(record: &Value, filter: &RecordFilter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| record.get(field) == Some(expected))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
