//! Observable sync status
//!
//! Process-wide sync state published to subscribers on every change.
//! Observers either register a callback or hold a watch receiver.

use crate::database::{QueueOperation, SyncFailure, Table};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;

/// A queued operation that was dropped after exhausting its attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorEntry {
    /// Stable key used by `retry_error`
    pub key: String,
    pub table: Table,
    pub operation: QueueOperation,
    pub record_id: String,
    pub message: String,
}

impl From<&SyncFailure> for SyncErrorEntry {
    fn from(failure: &SyncFailure) -> Self {
        Self {
            key: failure.id.to_string(),
            table: failure.table,
            operation: failure.operation,
            record_id: failure.record_id.clone(),
            message: failure
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: i64,
    pub error_count: usize,
    pub errors: Vec<SyncErrorEntry>,
}

type Callback = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

struct Inner {
    tx: watch::Sender<SyncStatus>,
    callbacks: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
}

/// Shared publisher of [`SyncStatus`]
#[derive(Clone)]
pub struct SyncStatusHub {
    inner: Arc<Inner>,
}

impl Default for SyncStatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusHub {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(Inner {
                tx,
                callbacks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn current(&self) -> SyncStatus {
        self.inner.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.tx.subscribe()
    }

    /// Register a callback invoked after every status change.
    ///
    /// The callback is removed when the returned [`Subscription`] is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.callbacks).insert(id, Arc::new(callback));

        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Apply a change and notify observers
    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        self.inner.tx.send_modify(|status| {
            change(status);
            status.error_count = status.errors.len();
        });

        let snapshot = self.current();
        // Clone the callbacks out so none runs while the registry is locked.
        let callbacks: Vec<Callback> = lock(&self.inner.callbacks).values().cloned().collect();
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    pub fn set_syncing(&self, is_syncing: bool) {
        self.update(|status| status.is_syncing = is_syncing);
    }

    pub fn set_pending(&self, pending_count: i64) {
        self.update(|status| status.pending_count = pending_count);
    }

    pub fn push_error(&self, entry: SyncErrorEntry) {
        self.update(|status| {
            status.errors.retain(|e| e.key != entry.key);
            status.errors.push(entry);
        });
    }

    pub fn remove_error(&self, key: &str) {
        self.update(|status| status.errors.retain(|e| e.key != key));
    }
}

/// Handle returned by [`SyncStatusHub::subscribe`]
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    id: u64,
    hub: Weak<Inner>,
}

impl Subscription {
    /// Stop receiving updates. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.hub.upgrade() {
            lock(&inner.callbacks).remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
