//! Settings service
//!
//! Manages application settings persistence using JSON file storage.

use crate::config::{
    DEFAULT_MATCH_THRESHOLD, DEFAULT_REMOTE_TIMEOUT_SECS, MAX_MATCH_THRESHOLD,
    MAX_REMOTE_TIMEOUT_SECS, MIN_REMOTE_TIMEOUT_SECS,
};
use crate::error::{AppError, Result};
use crate::services::scheduler::SyncFrequency;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Remote store endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the REST endpoint; no remote is configured when empty
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SECS
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RemoteSettings {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Periodic sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSyncSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sync_frequency")]
    pub frequency: String, // "15m", "2h", "1d", "hourly", "daily"
}

fn default_true() -> bool {
    true
}

fn default_sync_frequency() -> String {
    "15m".to_string()
}

impl Default for AutoSyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: default_sync_frequency(),
        }
    }
}

/// Import matching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Maximum edit distance for a name match; 0 means exact after normalization
    #[serde(default = "default_match_threshold")]
    pub match_threshold: usize,
}

fn default_match_threshold() -> usize {
    DEFAULT_MATCH_THRESHOLD
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
        }
    }
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppSettings {
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub auto_sync: AutoSyncSettings,
    #[serde(default)]
    pub import: ImportSettings,
}

impl AppSettings {
    /// Check every value against its accepted range
    pub fn validate(&self) -> Result<()> {
        if !(MIN_REMOTE_TIMEOUT_SECS..=MAX_REMOTE_TIMEOUT_SECS).contains(&self.remote.timeout_secs) {
            return Err(AppError::Generic(format!(
                "Remote timeout must be between {} and {} seconds",
                MIN_REMOTE_TIMEOUT_SECS, MAX_REMOTE_TIMEOUT_SECS
            )));
        }

        if self.remote.is_configured()
            && !(self.remote.base_url.starts_with("http://")
                || self.remote.base_url.starts_with("https://"))
        {
            return Err(AppError::Generic(format!(
                "Remote URL must start with http:// or https://: {}",
                self.remote.base_url
            )));
        }

        if self.import.match_threshold > MAX_MATCH_THRESHOLD {
            return Err(AppError::Generic(format!(
                "Match threshold must be at most {}",
                MAX_MATCH_THRESHOLD
            )));
        }

        self.auto_sync
            .frequency
            .parse::<SyncFrequency>()
            .map_err(AppError::Generic)?;

        Ok(())
    }
}

/// Service for managing application settings
#[derive(Clone)]
pub struct SettingsService {
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new(app_data_dir: PathBuf) -> Self {
        Self {
            settings_path: app_data_dir.join("settings.json"),
        }
    }

    /// Load settings from disk or create default if not exists
    pub async fn load(&self) -> Result<AppSettings> {
        if !self.settings_path.exists() {
            tracing::info!("Settings file not found, creating default settings");
            let default = AppSettings::default();
            self.save(&default).await?;
            return Ok(default);
        }

        let content = fs::read_to_string(&self.settings_path).await?;
        let settings: AppSettings = serde_json::from_str(&content)
            .map_err(|e| AppError::Generic(format!("Failed to parse settings: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to disk
    pub async fn save(&self, settings: &AppSettings) -> Result<()> {
        settings.validate()?;

        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| AppError::Generic(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.settings_path, content).await?;
        tracing::info!("Settings saved to {:?}", self.settings_path);

        Ok(())
    }

    pub async fn get_remote(&self) -> Result<RemoteSettings> {
        let settings = self.load().await?;
        Ok(settings.remote)
    }

    pub async fn update_remote(&self, remote: RemoteSettings) -> Result<()> {
        let mut settings = self.load().await?;
        settings.remote = remote;
        self.save(&settings).await?;
        Ok(())
    }

    pub async fn get_auto_sync(&self) -> Result<AutoSyncSettings> {
        let settings = self.load().await?;
        Ok(settings.auto_sync)
    }

    pub async fn update_auto_sync(&self, auto_sync: AutoSyncSettings) -> Result<()> {
        let mut settings = self.load().await?;
        settings.auto_sync = auto_sync;
        self.save(&settings).await?;
        Ok(())
    }

    pub async fn get_import(&self) -> Result<ImportSettings> {
        let settings = self.load().await?;
        Ok(settings.import)
    }

    pub async fn update_import(&self, import: ImportSettings) -> Result<()> {
        let mut settings = self.load().await?;
        settings.import = import;
        self.save(&settings).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_service() -> (SettingsService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let service = SettingsService::new(temp_dir.path().to_path_buf());
        (service, temp_dir)
    }

    #[tokio::test]
    async fn test_default_settings_created_on_load() {
        let (service, temp) = create_test_service();

        let settings = service.load().await.unwrap();

        assert!(!settings.remote.is_configured());
        assert_eq!(settings.remote.timeout_secs, 20);
        assert!(settings.auto_sync.enabled);
        assert_eq!(settings.auto_sync.frequency, "15m");
        assert_eq!(settings.import.match_threshold, 2);
        assert!(temp.path().join("settings.json").exists());
    }

    #[tokio::test]
    async fn test_missing_sections_use_defaults() {
        let (service, temp) = create_test_service();
        std::fs::write(
            temp.path().join("settings.json"),
            r#"{"remote": {"base_url": "https://example.test"}}"#,
        )
        .unwrap();

        let settings = service.load().await.unwrap();
        assert_eq!(settings.remote.base_url, "https://example.test");
        assert_eq!(settings.remote.timeout_secs, 20);
        assert_eq!(settings.auto_sync, AutoSyncSettings::default());
    }

    #[tokio::test]
    async fn test_settings_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let settings_path = temp_dir.path().to_path_buf();

        {
            let service = SettingsService::new(settings_path.clone());
            service
                .update_auto_sync(AutoSyncSettings {
                    enabled: false,
                    frequency: "2h".to_string(),
                })
                .await
                .unwrap();
        }

        {
            let service = SettingsService::new(settings_path);
            let loaded = service.get_auto_sync().await.unwrap();
            assert!(!loaded.enabled);
            assert_eq!(loaded.frequency, "2h");
        }
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let (service, _temp) = create_test_service();

        let too_fuzzy = service
            .update_import(ImportSettings { match_threshold: 50 })
            .await;
        assert!(too_fuzzy.is_err());

        let bad_frequency = service
            .update_auto_sync(AutoSyncSettings {
                enabled: true,
                frequency: "sometimes".to_string(),
            })
            .await;
        assert!(bad_frequency.is_err());

        let bad_url = service
            .update_remote(RemoteSettings {
                base_url: "ftp://example.test".to_string(),
                ..RemoteSettings::default()
            })
            .await;
        assert!(bad_url.is_err());

        // Nothing invalid reached the file.
        assert_eq!(service.load().await.unwrap(), AppSettings::default());
    }

    #[tokio::test]
    async fn test_remote_preserved_after_import_update() {
        let (service, _temp) = create_test_service();

        let remote = RemoteSettings {
            base_url: "https://example.test".to_string(),
            api_key: "anon".to_string(),
            timeout_secs: 5,
        };
        service.update_remote(remote.clone()).await.unwrap();
        service
            .update_import(ImportSettings { match_threshold: 0 })
            .await
            .unwrap();

        let settings = service.load().await.unwrap();
        assert_eq!(settings.remote, remote);
        assert_eq!(settings.import.match_threshold, 0);
    }
}
