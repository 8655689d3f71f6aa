//! Retry queue persistence
//!
//! Storage for queued operations and for the failure log that receives
//! operations dropped after exhausting their attempts.

use super::models::{QueueOperation, QueuedOperation, SyncFailure};
use super::repository::Repository;
use super::table::Table;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;

impl Repository {
    /// Append an operation to the queue with zero attempts
    pub async fn enqueue_operation(
        &self,
        table: Table,
        operation: QueueOperation,
        record_id: &str,
        data: Option<&Value>,
        last_error: Option<&str>,
    ) -> Result<QueuedOperation> {
        let now = Utc::now();
        let data = data.map(serde_json::to_string).transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO sync_queue (table_name, operation, record_id, data, attempts, queued_at, last_error)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            RETURNING *
            "#,
        )
        .bind(table.as_str())
        .bind(operation.as_str())
        .bind(record_id)
        .bind(data)
        .bind(now)
        .bind(last_error)
        .fetch_one(self.pool())
        .await?;

        let item = queued_from_row(&row)?;
        tracing::debug!(
            "Queued {} {}/{} as #{}",
            operation,
            table,
            record_id,
            item.id
        );
        Ok(item)
    }

    /// All queued operations, oldest first
    pub async fn list_queue(&self) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query("SELECT * FROM sync_queue ORDER BY id ASC")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(queued_from_row).collect()
    }

    pub async fn count_queue(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(self.pool())
            .await?;

        Ok(count)
    }

    /// Persist a failed replay attempt
    pub async fn record_queue_attempt(&self, id: i64, attempts: i64, last_error: &str) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET attempts = ?, last_error = ? WHERE id = ?")
            .bind(attempts)
            .bind(last_error)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn remove_queue_item(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Delete every queued operation, returning how many were removed
    pub async fn clear_queue(&self) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM sync_queue")
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok(removed)
    }

    /// Ids of records in `table` that still have queued operations
    pub async fn pending_record_ids(&self, table: Table) -> Result<HashSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT record_id FROM sync_queue WHERE table_name = ?")
                .bind(table.as_str())
                .fetch_all(self.pool())
                .await?;

        Ok(ids.into_iter().collect())
    }

    pub async fn has_pending_operations(&self, table: Table, record_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_queue WHERE table_name = ? AND record_id = ?",
        )
        .bind(table.as_str())
        .bind(record_id)
        .fetch_one(self.pool())
        .await?;

        Ok(count > 0)
    }

    /// Move an exhausted operation from the queue to the failure log
    pub async fn move_to_failures(
        &self,
        item: &QueuedOperation,
        attempts: i64,
        last_error: &str,
    ) -> Result<SyncFailure> {
        let data = item.data.as_ref().map(serde_json::to_string).transpose()?;
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO sync_failures
                (table_name, operation, record_id, data, attempts, queued_at, failed_at, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(item.table.as_str())
        .bind(item.operation.as_str())
        .bind(&item.record_id)
        .bind(data)
        .bind(attempts)
        .bind(item.queued_at)
        .bind(Utc::now())
        .bind(last_error)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(item.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        failure_from_row(&row)
    }

    pub async fn list_failures(&self) -> Result<Vec<SyncFailure>> {
        let rows = sqlx::query("SELECT * FROM sync_failures ORDER BY id ASC")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(failure_from_row).collect()
    }

    /// Move a failure back onto the queue with zero attempts, in one transaction
    pub async fn requeue_failure(&self, id: i64) -> Result<Option<QueuedOperation>> {
        let mut tx = self.pool().begin().await?;

        let Some(row) = sqlx::query("DELETE FROM sync_failures WHERE id = ? RETURNING *")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let failure = failure_from_row(&row)?;
        let data = failure.data.as_ref().map(serde_json::to_string).transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO sync_queue (table_name, operation, record_id, data, attempts, queued_at, last_error)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            RETURNING *
            "#,
        )
        .bind(failure.table.as_str())
        .bind(failure.operation.as_str())
        .bind(&failure.record_id)
        .bind(data)
        .bind(Utc::now())
        .bind(&failure.last_error)
        .fetch_one(&mut *tx)
        .await?;
        let item = queued_from_row(&row)?;

        tx.commit().await?;

        tracing::debug!(
            "Requeued failure #{} as #{} ({} {}/{})",
            id,
            item.id,
            item.operation,
            item.table,
            item.record_id
        );
        Ok(Some(item))
    }
}

fn parse_table(row: &SqliteRow) -> Result<Table> {
    let name: String = row.try_get("table_name")?;
    name.parse().map_err(AppError::Generic)
}

fn parse_operation(row: &SqliteRow) -> Result<QueueOperation> {
    let op: String = row.try_get("operation")?;
    op.parse().map_err(AppError::Generic)
}

fn parse_data(row: &SqliteRow) -> Result<Option<Value>> {
    let data: Option<String> = row.try_get("data")?;
    data.map(|data| serde_json::from_str(&data).map_err(AppError::from))
        .transpose()
}

fn queued_from_row(row: &SqliteRow) -> Result<QueuedOperation> {
    Ok(QueuedOperation {
        id: row.try_get("id")?,
        table: parse_table(row)?,
        operation: parse_operation(row)?,
        record_id: row.try_get("record_id")?,
        data: parse_data(row)?,
        attempts: row.try_get("attempts")?,
        queued_at: row.try_get::<DateTime<Utc>, _>("queued_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn failure_from_row(row: &SqliteRow) -> Result<SyncFailure> {
    Ok(SyncFailure {
        id: row.try_get("id")?,
        table: parse_table(row)?,
        operation: parse_operation(row)?,
        record_id: row.try_get("record_id")?,
        data: parse_data(row)?,
        attempts: row.try_get("attempts")?,
        queued_at: row.try_get::<DateTime<Utc>, _>("queued_at")?,
        failed_at: row.try_get::<DateTime<Utc>, _>("failed_at")?,
        last_error: row.try_get("last_error")?,
    })
}
