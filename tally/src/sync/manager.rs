//! Sync manager
//!
//! Coordinates the retry queue, reconciliation and the observable status.
//! This is the surface the rest of the application talks to.

use super::connectivity::Connectivity;
use super::pull::{PullMode, PullReport, Reconciler};
use super::queue::{DrainReport, RetryQueue};
use super::status::{Subscription, SyncErrorEntry, SyncStatus, SyncStatusHub};
use crate::config::{META_LAST_SYNC_AT, PUSH_DEBOUNCE};
use crate::database::{QueuedOperation, Repository};
use crate::error::{AppError, Result};
use crate::session::{Actor, Session};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSkip {
    AlreadySyncing,
    Offline,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub skipped: Option<SyncSkip>,
    pub drain: DrainReport,
    pub pull: Option<PullReport>,
    pub settings_pulled: bool,
}

impl SyncReport {
    fn skipped(reason: SyncSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct SyncManager {
    repo: Repository,
    session: Session,
    connectivity: Connectivity,
    status: SyncStatusHub,
    queue: RetryQueue,
    reconciler: Reconciler,
    running: Arc<Mutex<()>>,
    push_generation: Arc<AtomicU64>,
    push_delay: Duration,
}

impl SyncManager {
    pub fn new(
        repo: Repository,
        session: Session,
        connectivity: Connectivity,
        status: SyncStatusHub,
        queue: RetryQueue,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            repo,
            session,
            connectivity,
            status,
            queue,
            reconciler,
            running: Arc::new(Mutex::new(())),
            push_generation: Arc::new(AtomicU64::new(0)),
            push_delay: PUSH_DEBOUNCE,
        }
    }

    pub fn with_push_delay(mut self, push_delay: Duration) -> Self {
        self.push_delay = push_delay;
        self
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Drain the retry queue, then pull everything changed since the last sync
    pub async fn sync(&self) -> Result<SyncReport> {
        self.run(false).await
    }

    /// Drain the retry queue, then pull every table in full
    pub async fn full_sync(&self) -> Result<SyncReport> {
        self.run(true).await
    }

    async fn run(&self, full: bool) -> Result<SyncReport> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("Sync already running, skipping");
            return Ok(SyncReport::skipped(SyncSkip::AlreadySyncing));
        };

        let actor = self.session.actor().ok_or(AppError::NotAuthenticated)?;

        if !self.connectivity.is_online() {
            tracing::debug!("Offline, skipping sync");
            return Ok(SyncReport::skipped(SyncSkip::Offline));
        }

        self.status.set_syncing(true);
        let result = self.run_online(&actor, full).await;
        self.status.set_syncing(false);

        result
    }

    async fn run_online(&self, actor: &Actor, full: bool) -> Result<SyncReport> {
        tracing::info!("Starting {} sync for {}", if full { "full" } else { "delta" }, actor);

        let drain = self.queue.drain().await?;
        if !self.connectivity.is_online() {
            tracing::info!("Remote became unreachable during drain, skipping pull");
            return Ok(SyncReport {
                skipped: Some(SyncSkip::Offline),
                drain,
                ..SyncReport::default()
            });
        }
        let started = Utc::now();

        let mode = match (full, self.last_sync_at().await?) {
            (false, Some(at)) => PullMode::Since(at),
            _ => PullMode::Full,
        };
        let pull = self.reconciler.pull(mode).await;

        let settings_pulled = match self.reconciler.pull_user_settings(actor).await {
            Ok(settings) => settings.is_some(),
            Err(e) => {
                tracing::warn!("Failed to pull user settings: {}", e);
                false
            }
        };

        // Failed tables are pulled again next time from the old watermark.
        if pull.is_complete() {
            self.repo
                .set_meta(META_LAST_SYNC_AT, &started.to_rfc3339())
                .await?;
            self.status.update(|status| status.last_sync_at = Some(started));
        }

        Ok(SyncReport {
            skipped: None,
            drain,
            pull: Some(pull),
            settings_pulled,
        })
    }

    /// Ask the remote whether it is reachable and update connectivity
    pub async fn check_connectivity(&self) -> bool {
        self.connectivity.check(self.reconciler.remote()).await
    }

    /// Request a sync after the debounce window.
    ///
    /// A later call inside the window supersedes this one, so a burst of
    /// local edits produces a single sync.
    pub fn schedule_push(&self) -> JoinHandle<()> {
        let generation = self.push_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(manager.push_delay).await;

            if manager.push_generation.load(Ordering::SeqCst) != generation {
                return;
            }

            if let Err(e) = manager.sync().await {
                tracing::warn!("Scheduled sync failed: {}", e);
            }
        })
    }

    pub fn on_sync_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.status.subscribe(callback)
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.watch()
    }

    /// Put a dropped operation back on the retry queue with a fresh budget
    pub async fn retry_error(&self, key: &str) -> Result<QueuedOperation> {
        let id: i64 = key
            .parse()
            .map_err(|_| AppError::Generic(format!("Invalid sync error key: {}", key)))?;

        let item = self
            .queue
            .requeue_failure(id)
            .await?
            .ok_or_else(|| AppError::Generic(format!("Unknown sync error: {}", key)))?;

        tracing::info!(
            "Retrying dropped {} {}/{}",
            item.operation,
            item.table,
            item.record_id
        );

        self.status.remove_error(key);
        Ok(item)
    }

    /// Retry every dropped operation, oldest first
    pub async fn retry_all_errors(&self) -> Result<usize> {
        let failures = self.repo.list_failures().await?;
        for failure in &failures {
            self.retry_error(&failure.id.to_string()).await?;
        }
        Ok(failures.len())
    }

    /// Seed the status from durable state after startup
    pub async fn load_persisted_errors(&self) -> Result<()> {
        let errors: Vec<SyncErrorEntry> = self
            .repo
            .list_failures()
            .await?
            .iter()
            .map(SyncErrorEntry::from)
            .collect();
        let pending = self.queue.count().await?;
        let last_sync_at = self.last_sync_at().await?;

        if !errors.is_empty() {
            tracing::warn!("{} dropped operation(s) awaiting retry", errors.len());
        }

        self.status.update(|status| {
            status.errors = errors;
            status.pending_count = pending;
            status.last_sync_at = last_sync_at;
        });
        Ok(())
    }

    /// Wipe the local mirror, queue and failure log
    pub async fn clear_local_cache(&self) -> Result<()> {
        self.repo.clear_local_cache().await?;
        self.status.update(|status| {
            status.errors.clear();
            status.pending_count = 0;
            status.last_sync_at = None;
        });
        Ok(())
    }

    async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .repo
            .get_meta(META_LAST_SYNC_AT)
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}
