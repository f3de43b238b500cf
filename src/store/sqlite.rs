//! SQLite-backed [`DocumentStore`].
//!
//! Each collection is a table `(id TEXT PRIMARY KEY, body TEXT)` holding
//! the JSON document. Timestamp queries use `json_extract` + `julianday`
//! so RFC 3339 strings compare chronologically regardless of precision.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::db;
use crate::error::{StoreError, StoreResult};
use crate::migrate;
use crate::models::BulkItem;

use super::{parse_timestamp, DocumentStore, ScanFrom, ScannedDoc};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database at `path` and run migrations.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Quote a collection name as a table identifier.
fn table(name: &str) -> StoreResult<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        return Err(StoreError::Backend(format!(
            "invalid collection name '{}'",
            name
        )));
    }
    Ok(format!("\"{}\"", name))
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("no such table"),
        _ => false,
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_collection(&self, name: &str, mapping: &Value) -> StoreResult<()> {
        let t = table(name)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, body TEXT NOT NULL)",
            t
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO collections (name, mapping_json, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(mapping.to_string())
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn bulk_write(&self, items: &[BulkItem]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for item in items {
            let t = table(&item.index)?;
            let result = sqlx::query(&format!(
                "INSERT INTO {} (id, body) VALUES (?, ?) \
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                t
            ))
            .bind(&item.id)
            .bind(item.data.to_string())
            .execute(&mut *tx)
            .await;

            // Dropping `tx` rolls back everything written so far.
            if let Err(e) = result {
                if is_missing_table(&e) {
                    return Err(StoreError::CollectionMissing(item.index.clone()));
                }
                return Err(StoreError::Rejected {
                    collection: item.index.clone(),
                    reason: e.to_string(),
                });
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        let t = table(collection)?;
        let body: Option<String> =
            match sqlx::query_scalar(&format!("SELECT body FROM {} WHERE id = ?", t))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(body) => body,
                Err(e) if is_missing_table(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    async fn stat_max(&self, collection: &str, field: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let t = table(collection)?;
        let path = json_path(field);
        let sql = format!(
            "SELECT json_extract(body, ?) FROM {} \
             WHERE julianday(json_extract(body, ?)) IS NOT NULL \
             ORDER BY julianday(json_extract(body, ?)) DESC LIMIT 1",
            t
        );
        let value: Option<Option<String>> = match sqlx::query_scalar(&sql)
            .bind(&path)
            .bind(&path)
            .bind(&path)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(v) => v,
            Err(e) if is_missing_table(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(value
            .flatten()
            .and_then(|s| parse_timestamp(&Value::String(s))))
    }

    async fn scan(
        &self,
        collection: &str,
        field: &str,
        from: &ScanFrom,
        limit: usize,
    ) -> StoreResult<Vec<ScannedDoc>> {
        let t = table(collection)?;
        let path = json_path(field);
        let since = from.since.to_rfc3339_opts(SecondsFormat::Micros, true);
        let sql = format!(
            "SELECT id, body FROM {} \
             WHERE julianday(json_extract(body, ?)) > julianday(?) \
                OR (julianday(json_extract(body, ?)) = julianday(?) AND (? IS NULL OR id > ?)) \
             ORDER BY julianday(json_extract(body, ?)), id \
             LIMIT ?",
            t
        );
        let rows: Vec<(String, String)> = match sqlx::query_as(&sql)
            .bind(&path)
            .bind(&since)
            .bind(&path)
            .bind(&since)
            .bind(from.after_id.as_deref())
            .bind(from.after_id.as_deref())
            .bind(&path)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_missing_table(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut docs = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            let body: Value = serde_json::from_str(&body)?;
            let Some(at) = body.get(field).and_then(parse_timestamp) else {
                continue;
            };
            docs.push(ScannedDoc { id, at, body });
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_are_validated() {
        assert_eq!(table("sds-acme-raw").unwrap(), "\"sds-acme-raw\"");
        assert!(table("bad\"name").is_err());
        assert!(table("drop table;").is_err());
        assert!(table("").is_err());
    }
}
