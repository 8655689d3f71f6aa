//! Application state and initialization
//!
//! This module wires the data layer together. All services are created here
//! and made available through AppState.

use crate::config::REACHABILITY_CHECK_INTERVAL;
use crate::database::{create_pool, Repository};
use crate::error::{AppError, Result};
use crate::import::BatchImporter;
use crate::remote::{HttpRemote, RemoteStore};
use crate::services::{AppSettings, SettingsService, SyncFrequency, SyncScheduler};
use crate::session::Session;
use crate::sync::{
    Connectivity, Reconciler, RecurringMaterializer, RetryQueue, SyncManager, SyncStatusHub,
    WritePath,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "tally.db";

/// Central application state holding all services
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub settings: AppSettings,
    pub repo: Repository,
    pub remote: Arc<dyn RemoteStore>,
    pub session: Session,
    pub connectivity: Connectivity,
    pub status: SyncStatusHub,
    pub queue: RetryQueue,
    pub writes: WritePath,
    pub manager: SyncManager,
    pub materializer: RecurringMaterializer,
}

impl AppState {
    /// Open the data directory and build every service around `remote`
    pub async fn initialize(
        data_dir: &Path,
        settings: AppSettings,
        remote: Arc<dyn RemoteStore>,
        session: Session,
        connectivity: Connectivity,
    ) -> Result<Self> {
        tracing::info!("Initializing data layer in {:?}", data_dir);
        std::fs::create_dir_all(data_dir)?;

        let pool = create_pool(&data_dir.join(DATABASE_FILE)).await?;
        let repo = Repository::new(pool);
        let status = SyncStatusHub::new();

        let queue = RetryQueue::new(
            repo.clone(),
            Arc::clone(&remote),
            session.clone(),
            connectivity.clone(),
            status.clone(),
        );
        let writes = WritePath::new(repo.clone(), Arc::clone(&remote), queue.clone());
        let reconciler = Reconciler::new(repo.clone(), Arc::clone(&remote));
        let manager = SyncManager::new(
            repo.clone(),
            session.clone(),
            connectivity.clone(),
            status.clone(),
            queue.clone(),
            reconciler,
        );
        let materializer = RecurringMaterializer::new(repo.clone(), writes.clone());

        manager.load_persisted_errors().await?;

        tracing::info!("Data layer initialized successfully");

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            settings,
            repo,
            remote,
            session,
            connectivity,
            status,
            queue,
            writes,
            manager,
            materializer,
        })
    }

    /// Load `settings.json` from `data_dir` and connect to the configured remote
    pub async fn from_settings(data_dir: &Path, session: Session) -> Result<Self> {
        let settings = SettingsService::new(data_dir.to_path_buf()).load().await?;

        if !settings.remote.is_configured() {
            return Err(AppError::Generic(
                "No remote configured; set remote.base_url in settings.json".to_string(),
            ));
        }

        let remote = HttpRemote::new(
            &settings.remote.base_url,
            settings.remote.api_key.clone(),
            settings.remote.timeout(),
            session.clone(),
        )?;

        Self::initialize(
            data_dir,
            settings,
            Arc::new(remote),
            session,
            Connectivity::default(),
        )
        .await
    }

    /// Importer using the configured match threshold
    pub fn importer(&self) -> BatchImporter {
        BatchImporter::new(self.repo.clone(), self.writes.clone())
            .with_threshold(self.settings.import.match_threshold)
    }

    /// Drain the retry queue whenever connectivity comes back
    pub fn spawn_connectivity_listener(&self) -> JoinHandle<()> {
        self.queue.spawn_connectivity_listener()
    }

    /// Ping the remote while offline and flip connectivity back when it answers
    pub fn spawn_reachability_monitor(&self) -> JoinHandle<()> {
        self.connectivity
            .spawn_reachability_monitor(Arc::clone(&self.remote), REACHABILITY_CHECK_INTERVAL)
    }

    /// Start periodic sync according to the auto-sync settings
    pub async fn start_scheduler(&self) -> Result<SyncScheduler> {
        let frequency: SyncFrequency = self
            .settings
            .auto_sync
            .frequency
            .parse()
            .map_err(AppError::Scheduler)?;

        let scheduler = SyncScheduler::new(
            self.manager.clone(),
            self.materializer.clone(),
            self.session.clone(),
        )
        .await?;
        scheduler
            .schedule_sync(frequency, self.settings.auto_sync.enabled)
            .await?;
        scheduler.start().await?;

        Ok(scheduler)
    }
}
