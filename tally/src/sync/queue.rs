//! Retry queue
//!
//! Durable FIFO of remote mutations that failed while offline. A drain
//! replays every item oldest first; an item that keeps failing is dropped
//! into the failure log after `MAX_ATTEMPTS` tries and surfaced through the
//! sync status errors.

use super::connectivity::Connectivity;
use super::status::{SyncErrorEntry, SyncStatusHub};
use crate::config::{MAX_ATTEMPTS, ONLINE_SETTLE_DELAY};
use crate::database::{QueueOperation, QueuedOperation, Repository, Table, PENDING_SYNC_FIELD};
use crate::error::Result;
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    Draining,
}

/// Why a drain did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainSkip {
    AlreadyDraining,
    Offline,
    NotAuthenticated,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    /// Failed items left queued for the next drain
    pub retried: usize,
    /// Failed items moved to the failure log
    pub dropped: usize,
    /// Items not tried this pass: queued behind a failed item for the same
    /// record, or left over when the remote became unreachable
    pub deferred: usize,
    pub skipped: Option<DrainSkip>,
}

impl DrainReport {
    fn skipped(reason: DrainSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// Resets the drain state when a drain finishes, even on early return
struct DrainGuard {
    state: Arc<Mutex<DrainState>>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        *lock(&self.state) = DrainState::Idle;
    }
}

#[derive(Clone)]
pub struct RetryQueue {
    repo: Repository,
    remote: Arc<dyn RemoteStore>,
    session: Session,
    connectivity: Connectivity,
    status: SyncStatusHub,
    state: Arc<Mutex<DrainState>>,
    settle_delay: Duration,
}

impl RetryQueue {
    pub fn new(
        repo: Repository,
        remote: Arc<dyn RemoteStore>,
        session: Session,
        connectivity: Connectivity,
        status: SyncStatusHub,
    ) -> Self {
        Self {
            repo,
            remote,
            session,
            connectivity,
            status,
            state: Arc::new(Mutex::new(DrainState::Idle)),
            settle_delay: ONLINE_SETTLE_DELAY,
        }
    }

    /// Override the delay between reconnect and drain
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Durably append an operation. When online, a drain is started in the
    /// background without waiting for it.
    pub async fn enqueue(
        &self,
        table: Table,
        operation: QueueOperation,
        record_id: &str,
        payload: Option<&Value>,
        last_error: Option<&str>,
    ) -> Result<QueuedOperation> {
        let item = self
            .repo
            .enqueue_operation(table, operation, record_id, payload, last_error)
            .await?;

        self.queued().await?;
        Ok(item)
    }

    /// Move a dropped operation from the failure log back onto the queue
    /// with zero attempts. `None` when no such failure exists.
    pub async fn requeue_failure(&self, failure_id: i64) -> Result<Option<QueuedOperation>> {
        let item = self.repo.requeue_failure(failure_id).await?;
        if item.is_some() {
            self.queued().await?;
        }
        Ok(item)
    }

    async fn queued(&self) -> Result<()> {
        self.refresh_pending().await?;

        if self.connectivity.is_online() {
            self.trigger_drain();
        }
        Ok(())
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Start a drain on the runtime without awaiting it
    pub fn trigger_drain(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.drain().await {
                tracing::error!("Background drain failed: {}", e);
            }
        })
    }

    pub fn is_draining(&self) -> bool {
        *lock(&self.state) == DrainState::Draining
    }

    /// Replay every queued operation, oldest first.
    ///
    /// A call while another drain is running, while offline, or without a
    /// signed-in actor returns immediately and leaves the queue untouched.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("Drain already running, skipping");
            return Ok(DrainReport::skipped(DrainSkip::AlreadyDraining));
        };

        if !self.connectivity.is_online() {
            tracing::debug!("Offline, skipping drain");
            return Ok(DrainReport::skipped(DrainSkip::Offline));
        }

        if self.session.actor().is_none() {
            tracing::warn!("No authenticated actor, leaving retry queue untouched");
            return Ok(DrainReport::skipped(DrainSkip::NotAuthenticated));
        }

        let items = self.repo.list_queue().await?;
        if items.is_empty() {
            return Ok(DrainReport::default());
        }

        tracing::info!("Draining {} queued operation(s)", items.len());
        let mut report = DrainReport::default();
        // Records with a failed operation this pass; their later operations wait.
        let mut blocked: HashSet<(Table, String)> = HashSet::new();
        let total = items.len();

        for (index, item) in items.into_iter().enumerate() {
            let key = (item.table, item.record_id.clone());
            if blocked.contains(&key) {
                report.deferred += 1;
                continue;
            }

            match self.replay(&item).await {
                Ok(remote_row) => {
                    self.repo.remove_queue_item(item.id).await?;
                    self.write_back(&item, remote_row).await;
                    report.succeeded += 1;
                }
                Err(err) => {
                    self.record_failed_attempt(&item, &err, &mut report).await?;
                    blocked.insert(key);

                    if err.is_unreachable() {
                        self.connectivity.record_failure(&err);
                        report.deferred += total - index - 1;
                        tracing::info!(
                            "Remote unreachable, stopping drain with {} operation(s) untried",
                            total - index - 1
                        );
                        break;
                    }
                }
            }
        }

        self.refresh_pending().await?;

        tracing::info!(
            "Drain finished: {} succeeded, {} retried, {} dropped, {} deferred",
            report.succeeded,
            report.retried,
            report.dropped,
            report.deferred
        );
        Ok(report)
    }

    /// Count a failed replay, dropping the item once its attempts run out
    async fn record_failed_attempt(
        &self,
        item: &QueuedOperation,
        err: &RemoteError,
        report: &mut DrainReport,
    ) -> Result<()> {
        let attempts = item.attempts + 1;
        let message = err.to_string();

        if attempts >= MAX_ATTEMPTS {
            let failure = self.repo.move_to_failures(item, attempts, &message).await?;
            tracing::error!(
                "Dropping {} {}/{} after {} attempts: {}",
                item.operation,
                item.table,
                item.record_id,
                attempts,
                message
            );
            self.status.push_error(SyncErrorEntry::from(&failure));
            report.dropped += 1;
        } else {
            self.repo
                .record_queue_attempt(item.id, attempts, &message)
                .await?;
            tracing::warn!(
                "Replay of {} {}/{} failed (attempt {}/{}): {}",
                item.operation,
                item.table,
                item.record_id,
                attempts,
                MAX_ATTEMPTS,
                message
            );
            report.retried += 1;
        }

        Ok(())
    }

    /// Re-issue the remote call implied by a queued operation.
    ///
    /// Returns the remote row to mirror locally, when the call produces one.
    async fn replay(&self, item: &QueuedOperation) -> RemoteResult<Option<Value>> {
        let table = item.table;
        let id = item.record_id.as_str();

        match item.operation {
            QueueOperation::Insert => {
                let payload = item
                    .data
                    .as_ref()
                    .ok_or_else(|| RemoteError::rejected("payload", "queued insert has no payload"))?;

                match self.remote.insert(table, payload).await {
                    Ok(row) => Ok(Some(row)),
                    // An earlier attempt reached the server but its response was lost.
                    Err(err) if err.is_duplicate() => {
                        tracing::debug!("{}/{} already exists remotely", table, id);
                        self.remote.get_one(table, id).await
                    }
                    Err(err) => Err(err),
                }
            }
            QueueOperation::Update => {
                let patch = item.data.clone().unwrap_or_else(|| Value::Object(Default::default()));
                self.remote.update(table, id, &patch).await.map(Some)
            }
            QueueOperation::Delete => {
                let deleted_at = item
                    .data
                    .as_ref()
                    .and_then(|data| data.get("deleted_at"))
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(item.queued_at);

                self.remote.soft_delete(table, id, deleted_at).await?;
                Ok(None)
            }
        }
    }

    /// Mirror the authoritative remote row unless later operations for the
    /// same record are still queued behind this one. Calls without a remote
    /// row only clear the local pending flag.
    async fn write_back(&self, item: &QueuedOperation, remote_row: Option<Value>) {
        if let Err(e) = self.mirror_row(item, remote_row.as_ref()).await {
            tracing::warn!(
                "Failed to mirror replayed {}/{}: {}",
                item.table,
                item.record_id,
                e
            );
        }
    }

    async fn mirror_row(&self, item: &QueuedOperation, remote_row: Option<&Value>) -> Result<()> {
        if self
            .repo
            .has_pending_operations(item.table, &item.record_id)
            .await?
        {
            return Ok(());
        }

        let store = self.repo.table(item.table);
        match remote_row {
            Some(row) => {
                store.put(row).await?;
            }
            None => {
                if let Some(mut local) = store.get(&item.record_id).await? {
                    if let Some(obj) = local.as_object_mut() {
                        obj.remove(PENDING_SYNC_FIELD);
                    }
                    store.put(&local).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        self.repo.count_queue().await
    }

    /// Queue contents, oldest first
    pub async fn list(&self) -> Result<Vec<QueuedOperation>> {
        self.repo.list_queue().await
    }

    /// Discard every queued operation
    pub async fn clear(&self) -> Result<u64> {
        let removed = self.repo.clear_queue().await?;
        tracing::warn!("Retry queue cleared ({} operations discarded)", removed);
        self.status.set_pending(0);
        Ok(removed)
    }

    /// Drain after every offline→online transition, once the connection has
    /// stayed up for the settle delay.
    pub fn spawn_connectivity_listener(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let mut rx = self.connectivity.subscribe();

        tokio::spawn(async move {
            let mut was_online = *rx.borrow_and_update();

            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();

                if online && !was_online {
                    tokio::time::sleep(queue.settle_delay).await;

                    if queue.connectivity.is_online() {
                        tracing::info!("Back online, draining retry queue");
                        if let Err(e) = queue.drain().await {
                            tracing::error!("Drain after reconnect failed: {}", e);
                        }
                    } else {
                        tracing::debug!("Connection dropped during settle delay");
                    }
                }

                was_online = online;
            }
        })
    }

    async fn refresh_pending(&self) -> Result<()> {
        let pending = self.repo.count_queue().await?;
        self.status.set_pending(pending);
        Ok(())
    }

    fn try_begin(&self) -> Option<DrainGuard> {
        let mut state = lock(&self.state);
        if *state == DrainState::Draining {
            return None;
        }
        *state = DrainState::Draining;

        Some(DrainGuard {
            state: Arc::clone(&self.state),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
