//! Write path
//!
//! The single entry point for mutations. Each call tries the remote first
//! and mirrors the remote's answer locally. Connectivity failures degrade to
//! an optimistic local write plus a queued retry; rejections surface to the
//! caller and touch nothing.

use super::queue::RetryQueue;
use crate::database::table::object_mut;
use crate::database::{
    merge_json, QueueOperation, Repository, SyncRecord, Table, PENDING_SYNC_FIELD,
};
use crate::error::{AppError, Result};
use crate::remote::{RemoteError, RemoteStore};
use crate::session::Actor;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct WritePath {
    repo: Repository,
    remote: Arc<dyn RemoteStore>,
    queue: RetryQueue,
}

impl WritePath {
    pub fn new(repo: Repository, remote: Arc<dyn RemoteStore>, queue: RetryQueue) -> Self {
        Self {
            repo,
            remote,
            queue,
        }
    }

    /// Create a record.
    ///
    /// Missing `id` and owner fields are filled in; `updated_at` is always
    /// stamped. Returns the record as it now stands in the local mirror.
    pub async fn insert(&self, table: Table, data: &Value, actor: &Actor) -> Result<Value> {
        if !data.is_object() {
            return Err(AppError::invalid(table, "insert payload must be an object"));
        }

        let mut payload = data.clone();
        let obj = object_mut(&mut payload);

        let id = match obj.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = Uuid::new_v4().to_string();
                obj.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        if let Some(owner) = table.owner_field() {
            if is_blank(obj.get(owner)) {
                obj.insert(owner.to_string(), Value::String(actor.id.clone()));
            }
        }

        obj.insert("updated_at".to_string(), timestamp(Utc::now()));
        table.strip_local_only(&mut payload);

        if self.repo.has_pending_operations(table, &id).await? {
            return self
                .insert_optimistic(table, &id, payload, "queued behind pending operations")
                .await;
        }

        match self.remote.insert(table, &payload).await {
            Ok(row) => {
                tracing::debug!("Inserted {}/{} for {}", table, id, actor);
                self.repo.table(table).put(&row).await
            }
            Err(err) if err.is_offline_like() => {
                self.queue.connectivity().record_failure(&err);
                self.insert_optimistic(table, &id, payload, &err.to_string())
                    .await
            }
            Err(err) => Err(rejected(table, &id, err)),
        }
    }

    /// Apply a partial update to an existing record
    pub async fn update(
        &self,
        table: Table,
        id: &str,
        partial: &Value,
        actor: &Actor,
    ) -> Result<Value> {
        if !partial.is_object() {
            return Err(AppError::invalid(table, "update payload must be an object"));
        }

        let mut patch = partial.clone();
        let obj = object_mut(&mut patch);
        obj.remove("id");
        obj.insert("updated_at".to_string(), timestamp(Utc::now()));
        table.strip_local_only(&mut patch);

        if self.repo.has_pending_operations(table, id).await? {
            return self
                .update_optimistic(table, id, patch, "queued behind pending operations")
                .await;
        }

        match self.remote.update(table, id, &patch).await {
            Ok(row) => {
                tracing::debug!("Updated {}/{} for {}", table, id, actor);
                self.repo.table(table).put(&row).await
            }
            Err(err) if err.is_offline_like() => {
                self.queue.connectivity().record_failure(&err);
                self.update_optimistic(table, id, patch, &err.to_string())
                    .await
            }
            Err(err) => Err(rejected(table, id, err)),
        }
    }

    /// Mark a record deleted locally and remotely. Nothing is ever removed.
    pub async fn soft_delete(&self, table: Table, id: &str) -> Result<Value> {
        let now = Utc::now();

        if self.repo.has_pending_operations(table, id).await? {
            return self
                .delete_optimistic(table, id, now, "queued behind pending operations")
                .await;
        }

        match self.remote.soft_delete(table, id, now).await {
            Ok(()) => {
                tracing::debug!("Soft deleted {}/{}", table, id);
                self.mark_deleted(table, id, now, false).await
            }
            Err(err) if err.is_offline_like() => {
                self.queue.connectivity().record_failure(&err);
                self.delete_optimistic(table, id, now, &err.to_string())
                    .await
            }
            Err(err) => Err(rejected(table, id, err)),
        }
    }

    /// Typed [`insert`](Self::insert)
    pub async fn insert_record<R: SyncRecord>(&self, record: &R, actor: &Actor) -> Result<R> {
        let row = self
            .insert(R::TABLE, &serde_json::to_value(record)?, actor)
            .await?;
        Ok(serde_json::from_value(row)?)
    }

    /// Typed [`update`](Self::update)
    pub async fn update_record<R: SyncRecord>(
        &self,
        id: &str,
        partial: &Value,
        actor: &Actor,
    ) -> Result<R> {
        let row = self.update(R::TABLE, id, partial, actor).await?;
        Ok(serde_json::from_value(row)?)
    }

    async fn insert_optimistic(
        &self,
        table: Table,
        id: &str,
        payload: Value,
        reason: &str,
    ) -> Result<Value> {
        tracing::info!("Insert of {}/{} deferred: {}", table, id, reason);

        let mut local = payload.clone();
        object_mut(&mut local).insert(PENDING_SYNC_FIELD.to_string(), Value::Bool(true));
        let stored = self.repo.table(table).put(&local).await?;

        self.queue
            .enqueue(table, QueueOperation::Insert, id, Some(&payload), Some(reason))
            .await?;

        Ok(stored)
    }

    async fn update_optimistic(
        &self,
        table: Table,
        id: &str,
        patch: Value,
        reason: &str,
    ) -> Result<Value> {
        tracing::info!("Update of {}/{} deferred: {}", table, id, reason);

        let store = self.repo.table(table);
        let mut local = store
            .get(id)
            .await?
            .unwrap_or_else(|| json!({ "id": id }));
        merge_json(&mut local, &patch);
        object_mut(&mut local).insert(PENDING_SYNC_FIELD.to_string(), Value::Bool(true));
        let stored = store.put(&local).await?;

        self.queue
            .enqueue(table, QueueOperation::Update, id, Some(&patch), Some(reason))
            .await?;

        Ok(stored)
    }

    async fn delete_optimistic(
        &self,
        table: Table,
        id: &str,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Value> {
        tracing::info!("Delete of {}/{} deferred: {}", table, id, reason);

        let stored = self.mark_deleted(table, id, at, true).await?;
        let payload = json!({ "deleted_at": timestamp(at) });

        self.queue
            .enqueue(table, QueueOperation::Delete, id, Some(&payload), Some(reason))
            .await?;

        Ok(stored)
    }

    async fn mark_deleted(
        &self,
        table: Table,
        id: &str,
        at: DateTime<Utc>,
        pending: bool,
    ) -> Result<Value> {
        let store = self.repo.table(table);
        let mut row = store
            .get(id)
            .await?
            .unwrap_or_else(|| json!({ "id": id }));

        let obj = object_mut(&mut row);
        obj.insert("deleted_at".to_string(), timestamp(at));
        obj.insert("updated_at".to_string(), timestamp(at));
        if pending {
            obj.insert(PENDING_SYNC_FIELD.to_string(), Value::Bool(true));
        }

        store.put(&row).await
    }
}

/// Missing, null and empty-string values all count as unset
fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

fn rejected(table: Table, id: &str, err: RemoteError) -> AppError {
    tracing::warn!("Remote rejected write to {}/{}: {}", table, id, err);
    AppError::Remote(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{test_repository, Transaction};
    use crate::remote::InMemoryRemote;
    use crate::session::Session;
    use crate::sync::connectivity::Connectivity;
    use crate::sync::status::SyncStatusHub;

    struct Harness {
        writes: WritePath,
        queue: RetryQueue,
        repo: Repository,
        remote: InMemoryRemote,
        connectivity: Connectivity,
        actor: Actor,
    }

    async fn harness(online: bool) -> Harness {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        remote.set_offline(!online);
        let connectivity = Connectivity::new(online);
        let actor = Actor::new("user-1", "token");
        let queue = RetryQueue::new(
            repo.clone(),
            Arc::new(remote.clone()),
            Session::signed_in(actor.clone()),
            connectivity.clone(),
            SyncStatusHub::new(),
        );
        let writes = WritePath::new(repo.clone(), Arc::new(remote.clone()), queue.clone());

        Harness {
            writes,
            queue,
            repo,
            remote,
            connectivity,
            actor,
        }
    }

    fn expense(amount: f64) -> Value {
        json!({
            "type": "expense",
            "amount": amount,
            "description": "Coffee",
            "date": "2024-06-01",
        })
    }

    #[tokio::test]
    async fn test_online_insert_mirrors_remote_row() {
        let h = harness(true).await;

        let stored = h
            .writes
            .insert(Table::Transactions, &expense(3.5), &h.actor)
            .await
            .unwrap();

        let id = stored["id"].as_str().unwrap();
        let remote_row = h.remote.row(Table::Transactions, id).unwrap();
        assert_eq!(stored["sync_token"], remote_row["sync_token"]);
        assert_eq!(stored["user_id"], "user-1");
        assert_eq!(stored["year_month"], "2024-06");
        assert!(remote_row.get("year_month").is_none());

        let local = h.repo.table(Table::Transactions).get(id).await.unwrap().unwrap();
        assert_eq!(local["sync_token"], remote_row["sync_token"]);
        assert_eq!(h.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_insert_is_optimistic_and_queued() {
        let h = harness(false).await;

        let stored = h
            .writes
            .insert(Table::Transactions, &expense(3.5), &h.actor)
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        let local = h.repo.table(Table::Transactions).get(&id).await.unwrap().unwrap();
        assert_eq!(local["description"], "Coffee");
        assert_eq!(local["pending_sync"], true);
        assert!(local["updated_at"].is_string());

        let queued = h.queue.list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].record_id, id);
        assert_eq!(queued[0].attempts, 0);
        assert_eq!(queued[0].operation, QueueOperation::Insert);

        let payload = queued[0].data.as_ref().unwrap();
        assert!(payload.get("pending_sync").is_none());
        assert!(payload.get("year_month").is_none());
    }

    #[tokio::test]
    async fn test_rejection_propagates_without_side_effects() {
        let h = harness(true).await;
        h.remote
            .fail_next(RemoteError::rejected("23514", "amount must be positive"));

        let result = h
            .writes
            .insert(Table::Transactions, &expense(-1.0), &h.actor)
            .await;

        assert!(matches!(result, Err(AppError::Remote(RemoteError::Rejected { .. }))));
        assert!(h.repo.table(Table::Transactions).list(true).await.unwrap().is_empty());
        assert_eq!(h.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_update_merges_over_local_copy() {
        let h = harness(true).await;
        let stored = h
            .writes
            .insert(Table::Transactions, &expense(3.5), &h.actor)
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        h.remote.set_offline(true);
        h.connectivity.set_online(false);

        let updated = h
            .writes
            .update(Table::Transactions, &id, &json!({"description": "Tea"}), &h.actor)
            .await
            .unwrap();

        assert_eq!(updated["description"], "Tea");
        assert_eq!(updated["amount"], stored["amount"]);
        assert_eq!(h.remote.row(Table::Transactions, &id).unwrap()["description"], "Coffee");

        let queued = h.queue.list().await.unwrap();
        assert_eq!(queued[0].operation, QueueOperation::Update);
        assert_eq!(queued[0].data.as_ref().unwrap()["description"], "Tea");
    }

    #[tokio::test]
    async fn test_offline_soft_delete_then_drain() {
        let h = harness(true).await;
        let stored = h
            .writes
            .insert(Table::Transactions, &expense(3.5), &h.actor)
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        h.remote.set_offline(true);
        h.connectivity.set_online(false);

        let deleted = h.writes.soft_delete(Table::Transactions, &id).await.unwrap();
        assert!(deleted["deleted_at"].is_string());

        let queued = h.queue.list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, QueueOperation::Delete);
        assert!(h.remote.row(Table::Transactions, &id).unwrap()["deleted_at"].is_null());

        h.remote.set_offline(false);
        h.connectivity.set_online(true);
        h.queue.drain().await.unwrap();

        assert!(h.remote.row(Table::Transactions, &id).unwrap()["deleted_at"].is_string());
        let local = h.repo.table(Table::Transactions).get(&id).await.unwrap().unwrap();
        assert_eq!(local["deleted_at"], deleted["deleted_at"]);
        assert!(local.get("pending_sync").is_none());
    }

    #[tokio::test]
    async fn test_updates_queue_behind_pending_insert() {
        let h = harness(false).await;
        let stored = h
            .writes
            .insert(Table::Transactions, &expense(3.5), &h.actor)
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        // Remote is reachable again but the insert has not replayed yet.
        h.remote.set_offline(false);
        let calls = h.remote.mutation_calls();
        h.writes
            .update(Table::Transactions, &id, &json!({"amount": 4}), &h.actor)
            .await
            .unwrap();

        assert_eq!(h.remote.mutation_calls(), calls);
        let ops: Vec<QueueOperation> = h.queue.list().await.unwrap().iter().map(|i| i.operation).collect();
        assert_eq!(ops, vec![QueueOperation::Insert, QueueOperation::Update]);

        h.connectivity.set_online(true);
        h.queue.drain().await.unwrap();
        assert_eq!(h.remote.row(Table::Transactions, &id).unwrap()["amount"], 4);
    }

    #[tokio::test]
    async fn test_typed_insert() {
        let h = harness(true).await;
        let tx = Transaction {
            id: "t-typed".to_string(),
            user_id: String::new(),
            group_id: None,
            paid_by: None,
            category_id: None,
            context_id: None,
            recurring_id: None,
            kind: crate::database::TransactionType::Income,
            amount: rust_decimal::Decimal::new(1250, 2),
            description: "Salary".to_string(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            year_month: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            sync_token: None,
            pending_sync: false,
        };

        let stored = h.writes.insert_record(&tx, &h.actor).await.unwrap();
        assert_eq!(stored.id, "t-typed");
        assert_eq!(stored.user_id, "user-1");
        assert_eq!(h.remote.row(Table::Transactions, "t-typed").unwrap()["user_id"], "user-1");
        assert_eq!(stored.year_month.as_deref(), Some("2024-06"));
        assert!(stored.sync_token.is_some());
    }

    #[tokio::test]
    async fn test_explicit_owner_is_kept() {
        let h = harness(true).await;
        let mut data = expense(2.0);
        data["user_id"] = json!("someone-else");

        let stored = h
            .writes
            .insert(Table::Transactions, &data, &h.actor)
            .await
            .unwrap();
        assert_eq!(stored["user_id"], "someone-else");

        data["user_id"] = json!("");
        let stored = h
            .writes
            .insert(Table::Transactions, &data, &h.actor)
            .await
            .unwrap();
        assert_eq!(stored["user_id"], "user-1");
    }

    #[tokio::test]
    async fn test_unreachable_burst_while_flag_online_is_not_dropped() {
        let h = harness(true).await;
        h.remote.set_offline(true);

        for amount in 1..=6 {
            h.writes
                .insert(Table::Transactions, &expense(amount as f64), &h.actor)
                .await
                .unwrap();
        }

        assert!(!h.connectivity.is_online());

        // Give any background drain a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let queued = h.queue.list().await.unwrap();
        assert_eq!(queued.len(), 6);
        assert!(queued.iter().all(|item| item.attempts == 0));
        assert!(h.repo.list_failures().await.unwrap().is_empty());
        // Only the six direct writes reached the remote.
        assert_eq!(h.remote.mutation_calls(), 6);
    }
}
