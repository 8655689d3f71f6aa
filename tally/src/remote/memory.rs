//! In-process remote store
//!
//! Behaves like the hosted service for the parts the sync layer relies on:
//! server-assigned revision tokens, duplicate-id rejection, soft delete and
//! `updated_at` paging. It can be switched offline or told to fail the next
//! calls, which is how the offline paths are exercised.

use super::{PageRequest, RemoteError, RemoteResult, RemoteStore};
use crate::database::{merge_json, Table};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<Table, BTreeMap<String, Value>>>,
    injected: Mutex<VecDeque<RemoteError>>,
    rejections: Mutex<Vec<InsertRejection>>,
    offline: AtomicBool,
    revision: AtomicU64,
    mutations: AtomicUsize,
    lists: AtomicUsize,
}

/// Inserts into `table` whose `field` equals `value` fail with `error`
struct InsertRejection {
    table: Table,
    field: String,
    value: Value,
    error: RemoteError,
}

#[derive(Clone, Default)]
pub struct InMemoryRemote {
    inner: Arc<Inner>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a connectivity error
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next call with `error`; injected errors are consumed in order
    pub fn fail_next(&self, error: RemoteError) {
        lock(&self.inner.injected).push_back(error);
    }

    /// Reject every insert into `table` whose `field` equals `value`
    pub fn reject_inserts_where(
        &self,
        table: Table,
        field: &str,
        value: Value,
        error: RemoteError,
    ) {
        lock(&self.inner.rejections).push(InsertRejection {
            table,
            field: field.to_string(),
            value,
            error,
        });
    }

    /// Store rows directly, bypassing failure injection
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        let mut tables = lock(&self.inner.tables);
        let entries = tables.entry(table).or_default();
        for row in rows {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                entries.insert(id.to_string(), row.clone());
            }
        }
    }

    pub fn row(&self, table: Table, id: &str) -> Option<Value> {
        lock(&self.inner.tables)
            .get(&table)
            .and_then(|rows| rows.get(id).cloned())
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        lock(&self.inner.tables)
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of insert/update/soft-delete calls received, failed ones included
    pub fn mutation_calls(&self) -> usize {
        self.inner.mutations.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.inner.lists.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> RemoteResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::connectivity("network unreachable"));
        }
        match lock(&self.inner.injected).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_token(&self) -> Value {
        let rev = self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1;
        Value::String(format!("rev-{}", rev))
    }

    fn begin_mutation(&self) -> RemoteResult<()> {
        self.inner.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn insert(&self, table: Table, row: &Value) -> RemoteResult<Value> {
        self.begin_mutation()?;

        let id = row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::rejected("23502", "null value in column \"id\""))?
            .to_string();

        if let Some(rule) = lock(&self.inner.rejections)
            .iter()
            .find(|r| r.table == table && row.get(&r.field) == Some(&r.value))
        {
            return Err(rule.error.clone());
        }

        let mut tables = lock(&self.inner.tables);
        let rows = tables.entry(table).or_default();
        if rows.contains_key(&id) {
            return Err(RemoteError::rejected(
                "23505",
                format!("duplicate key value violates unique constraint on {}", table),
            ));
        }

        let now = Value::String(Utc::now().to_rfc3339());
        let mut stored = row.clone();
        if let Some(obj) = stored.as_object_mut() {
            obj.entry("created_at").or_insert_with(|| now.clone());
            obj.entry("updated_at").or_insert(now);
            obj.insert("sync_token".to_string(), self.next_token());
        }

        rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, table: Table, id: &str, patch: &Value) -> RemoteResult<Value> {
        self.begin_mutation()?;

        let mut tables = lock(&self.inner.tables);
        let row = tables
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| RemoteError::rejected("404", format!("{}/{} not found", table, id)))?;

        merge_json(row, patch);
        if let Some(obj) = row.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.to_string()));
            obj.insert("sync_token".to_string(), self.next_token());
        }

        Ok(row.clone())
    }

    async fn soft_delete(
        &self,
        table: Table,
        id: &str,
        deleted_at: DateTime<Utc>,
    ) -> RemoteResult<()> {
        self.begin_mutation()?;

        let mut tables = lock(&self.inner.tables);
        let row = tables
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| RemoteError::rejected("404", format!("{}/{} not found", table, id)))?;

        let stamp = Value::String(deleted_at.to_rfc3339());
        if let Some(obj) = row.as_object_mut() {
            obj.insert("deleted_at".to_string(), stamp.clone());
            obj.insert("updated_at".to_string(), stamp);
            obj.insert("sync_token".to_string(), self.next_token());
        }

        Ok(())
    }

    async fn list(&self, table: Table, page: &PageRequest) -> RemoteResult<Vec<Value>> {
        self.inner.lists.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut rows: Vec<(Option<DateTime<Utc>>, String, Value)> = self
            .rows(table)
            .into_iter()
            .map(|row| {
                let updated_at = parse_updated_at(&row);
                let id = row
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (updated_at, id, row)
            })
            .filter(|(updated_at, _, _)| match page.updated_after {
                Some(after) => updated_at.is_some_and(|at| at > after),
                None => true,
            })
            .collect();

        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        if !page.ascending {
            rows.reverse();
        }

        Ok(rows
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|(_, _, row)| row)
            .collect())
    }

    async fn get_one(&self, table: Table, id: &str) -> RemoteResult<Option<Value>> {
        self.check_available()?;
        Ok(self.row(table, id))
    }

    async fn ping(&self) -> RemoteResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::connectivity("network unreachable"));
        }
        Ok(())
    }
}

fn parse_updated_at(row: &Value) -> Option<DateTime<Utc>> {
    row.get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
