//! Repository layer for the local mirror
//!
//! Records are kept as one JSON document per `(table, id)`. All writes are
//! upserts or merges; soft delete only stamps `deleted_at`. The untyped
//! [`TableStore`] is what the queue and pull code use, [`Records`] is the
//! typed view the rest of the crate works with.

use super::models::SyncRecord;
use super::table::{merge_json, object_mut, Table};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::marker::PhantomData;

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Untyped accessor for one table of the mirror
    pub fn table(&self, table: Table) -> TableStore {
        TableStore {
            pool: self.pool.clone(),
            table,
        }
    }

    /// Typed accessor for the table backing `R`
    pub fn records<R: SyncRecord>(&self) -> Records<R> {
        Records {
            store: self.table(R::TABLE),
            _marker: PhantomData,
        }
    }

    /// Get a sync metadata value
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Set sync meta: {} = {}", key, value);
        Ok(())
    }

    /// Wipe every mirrored record, queued operation, failure and meta value.
    ///
    /// Only for an explicit "clear local cache" action.
    pub async fn clear_local_cache(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for statement in [
            "DELETE FROM records",
            "DELETE FROM sync_queue",
            "DELETE FROM sync_failures",
            "DELETE FROM sync_meta",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;

        tracing::warn!("Local cache cleared");
        Ok(())
    }
}

/// Keyed access to the rows of a single table
#[derive(Clone)]
pub struct TableStore {
    pool: SqlitePool,
    table: Table,
}

impl TableStore {
    pub fn table(&self) -> Table {
        self.table
    }

    /// Upsert a row by id, returning the normalized row that was stored
    pub async fn put(&self, row: &Value) -> Result<Value> {
        let mut row = row.clone();
        self.table.normalize(&mut row);

        let id = row
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::invalid(self.table, "row has no id"))?
            .to_string();
        let updated_at = timestamp_field(&row, "updated_at");
        let deleted_at = timestamp_field(&row, "deleted_at");
        let data = serde_json::to_string(&row)?;

        sqlx::query(
            r#"
            INSERT INTO records (table_name, id, data, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(table_name, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(self.table.as_str())
        .bind(&id)
        .bind(&data)
        .bind(updated_at)
        .bind(deleted_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Put {}/{}", self.table, id);
        Ok(row)
    }

    /// Get a row by id, including soft-deleted rows
    pub async fn get(&self, id: &str) -> Result<Option<Value>> {
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM records WHERE table_name = ? AND id = ?")
                .bind(self.table.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        data.map(|data| serde_json::from_str(&data).map_err(AppError::from))
            .transpose()
    }

    /// Fetch several rows at once; the result is aligned with `ids`.
    pub async fn bulk_get(&self, ids: &[String]) -> Result<Vec<Option<Value>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let query = format!(
            "SELECT id, data FROM records WHERE table_name = ? AND id IN ({})",
            placeholders
        );

        let mut q = sqlx::query(&query).bind(self.table.as_str());
        for id in ids {
            q = q.bind(id);
        }

        let mut found: HashMap<String, Value> = HashMap::new();
        for row in q.fetch_all(&self.pool).await? {
            let id: String = row.try_get("id")?;
            let data: String = row.try_get("data")?;
            found.insert(id, serde_json::from_str(&data)?);
        }

        Ok(ids.iter().map(|id| found.get(id).cloned()).collect())
    }

    /// Merge `patch` over the stored row
    pub async fn update(&self, id: &str, patch: &Value) -> Result<Value> {
        let mut row = self
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found(self.table, id))?;

        merge_json(&mut row, patch);
        object_mut(&mut row).insert("id".to_string(), Value::String(id.to_string()));

        self.put(&row).await
    }

    /// Mark a row deleted without removing it
    pub async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<Value> {
        let stamp = Value::String(at.to_rfc3339());
        let patch = serde_json::json!({ "deleted_at": stamp, "updated_at": stamp });
        self.update(id, &patch).await
    }

    /// List rows ordered by `updated_at`
    pub async fn list(&self, include_deleted: bool) -> Result<Vec<Value>> {
        let query = if include_deleted {
            "SELECT data FROM records WHERE table_name = ? ORDER BY updated_at ASC, id ASC"
        } else {
            "SELECT data FROM records WHERE table_name = ? AND deleted_at IS NULL ORDER BY updated_at ASC, id ASC"
        };

        let rows: Vec<String> = sqlx::query_scalar(query)
            .bind(self.table.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(AppError::from))
            .collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM records WHERE table_name = ? AND deleted_at IS NULL",
        )
        .bind(self.table.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

/// Typed view over a [`TableStore`]
pub struct Records<R> {
    store: TableStore,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for Records<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R: SyncRecord> Records<R> {
    pub async fn get(&self, id: &str) -> Result<Option<R>> {
        self.store
            .get(id)
            .await?
            .map(|row| serde_json::from_value(row).map_err(AppError::from))
            .transpose()
    }

    pub async fn put(&self, record: &R) -> Result<R> {
        let row = self.store.put(&serde_json::to_value(record)?).await?;
        Ok(serde_json::from_value(row)?)
    }

    /// Non-deleted records
    pub async fn list(&self) -> Result<Vec<R>> {
        decode_all(self.store.list(false).await?)
    }

    /// All records, soft-deleted included
    pub async fn list_all(&self) -> Result<Vec<R>> {
        decode_all(self.store.list(true).await?)
    }
}

fn decode_all<R: SyncRecord>(rows: Vec<Value>) -> Result<Vec<R>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(AppError::from))
        .collect()
}

fn timestamp_field(row: &Value, field: &str) -> Option<String> {
    row.get(field).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Context;
    use crate::database::test_repository;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_get_row() {
        let repo = test_repository().await;
        let store = repo.table(Table::Transactions);

        store
            .put(&json!({"id": "t1", "date": "2024-05-02", "amount": 10}))
            .await
            .unwrap();

        let row = store.get("t1").await.unwrap().unwrap();
        assert_eq!(row["amount"], 10);
        assert_eq!(row["year_month"], "2024-05");
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let repo = test_repository().await;
        let store = repo.table(Table::Contexts);

        store.put(&json!({"id": "c1", "name": "Trip"})).await.unwrap();
        store.put(&json!({"id": "c1", "name": "Holiday"})).await.unwrap();

        let rows = store.list(false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "Holiday");
    }

    #[tokio::test]
    async fn test_put_without_id_fails() {
        let repo = test_repository().await;
        let result = repo.table(Table::Groups).put(&json!({"name": "x"})).await;
        assert!(matches!(result, Err(AppError::InvalidRecord { .. })));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let repo = test_repository().await;
        let store = repo.table(Table::Categories);

        store
            .put(&json!({"id": "c1", "name": "Food", "color": "red"}))
            .await
            .unwrap();
        let updated = store.update("c1", &json!({"name": "Groceries"})).await.unwrap();

        assert_eq!(updated["name"], "Groceries");
        assert_eq!(updated["color"], "red");

        let missing = store.update("nope", &json!({"name": "x"})).await;
        assert!(matches!(missing, Err(AppError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row() {
        let repo = test_repository().await;
        let store = repo.table(Table::ShoppingItems);

        store.put(&json!({"id": "s1", "name": "Milk"})).await.unwrap();
        store.soft_delete("s1", Utc::now()).await.unwrap();

        assert!(store.list(false).await.unwrap().is_empty());
        let all = store.list(true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0]["deleted_at"].is_null());
    }

    #[tokio::test]
    async fn test_bulk_get_aligns_with_ids() {
        let repo = test_repository().await;
        let store = repo.table(Table::Groups);

        store.put(&json!({"id": "g1", "name": "Home"})).await.unwrap();
        store.put(&json!({"id": "g2", "name": "Office"})).await.unwrap();

        let rows = store
            .bulk_get(&["g2".to_string(), "missing".to_string(), "g1".to_string()])
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].as_ref().unwrap()["name"], "Office");
        assert!(rows[1].is_none());
        assert_eq!(rows[2].as_ref().unwrap()["name"], "Home");
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let repo = test_repository().await;

        repo.table(Table::Groups)
            .put(&json!({"id": "same", "name": "Group"}))
            .await
            .unwrap();
        repo.table(Table::Contexts)
            .put(&json!({"id": "same", "name": "Context"}))
            .await
            .unwrap();

        assert_eq!(repo.table(Table::Groups).count().await.unwrap(), 1);
        assert_eq!(repo.table(Table::Contexts).count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_typed_records() {
        let repo = test_repository().await;
        let contexts = repo.records::<Context>();

        let ctx = Context {
            id: "ctx-1".to_string(),
            user_id: "u1".to_string(),
            name: "Vacation".to_string(),
            description: None,
            active: true,
            updated_at: Some(Utc::now()),
            deleted_at: None,
            sync_token: None,
            pending_sync: false,
        };
        contexts.put(&ctx).await.unwrap();

        let fetched = contexts.get("ctx-1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "Vacation");
        assert_eq!(contexts.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_meta_and_clear() {
        let repo = test_repository().await;

        repo.set_meta("last_sync_at", "2024-01-01T00:00:00Z").await.unwrap();
        repo.set_meta("last_sync_at", "2024-02-01T00:00:00Z").await.unwrap();
        assert_eq!(
            repo.get_meta("last_sync_at").await.unwrap(),
            Some("2024-02-01T00:00:00Z".to_string())
        );

        repo.table(Table::Groups)
            .put(&json!({"id": "g1", "name": "Home"}))
            .await
            .unwrap();
        repo.clear_local_cache().await.unwrap();

        assert_eq!(repo.get_meta("last_sync_at").await.unwrap(), None);
        assert_eq!(repo.table(Table::Groups).count().await.unwrap(), 0);
    }
}
