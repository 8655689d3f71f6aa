//! Bulk and delta reconciliation
//!
//! Pages remote collections into the local mirror. Tables are pulled one at
//! a time in dependency order; a failing table is logged and skipped, and
//! tables already pulled stay pulled.

use crate::config::{DEFAULT_CURRENCY, DEFAULT_LANGUAGE, PULL_PAGE_SIZE};
use crate::database::{Repository, Table, UserSettings};
use crate::error::Result;
use crate::remote::{PageRequest, RemoteStore};
use crate::session::Actor;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Tables pulled by a reconciliation pass, parents before children.
/// User settings are a point lookup and are pulled separately.
pub const PULL_TABLES: [Table; 7] = [
    Table::Categories,
    Table::Contexts,
    Table::Groups,
    Table::GroupMembers,
    Table::Transactions,
    Table::RecurringTransactions,
    Table::ShoppingItems,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Every remote row replaces the local copy
    Full,
    /// Only rows changed after the instant; newer local copies win
    Since(DateTime<Utc>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePull {
    pub fetched: usize,
    pub applied: usize,
    /// Rows left alone because a local write is still queued or newer
    pub kept_local: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PullReport {
    pub tables: Vec<(Table, TablePull)>,
    pub failed: Vec<(Table, String)>,
}

impl PullReport {
    pub fn applied(&self) -> usize {
        self.tables.iter().map(|(_, t)| t.applied).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    repo: Repository,
    remote: Arc<dyn RemoteStore>,
    page_size: usize,
}

impl Reconciler {
    pub fn new(repo: Repository, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            repo,
            remote,
            page_size: PULL_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn remote(&self) -> &dyn RemoteStore {
        self.remote.as_ref()
    }

    /// Pull every table in [`PULL_TABLES`] order
    pub async fn pull(&self, mode: PullMode) -> PullReport {
        let mut report = PullReport::default();

        for table in PULL_TABLES {
            match self.pull_table(table, mode).await {
                Ok(pulled) => {
                    tracing::debug!(
                        "Pulled {}: {} fetched, {} applied",
                        table,
                        pulled.fetched,
                        pulled.applied
                    );
                    report.tables.push((table, pulled));
                }
                Err(e) => {
                    tracing::warn!("Pull of {} failed, continuing: {}", table, e);
                    report.failed.push((table, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Pull finished: {} row(s) applied, {} table(s) failed",
            report.applied(),
            report.failed.len()
        );
        report
    }

    /// Page through one remote table into the mirror
    pub async fn pull_table(&self, table: Table, mode: PullMode) -> Result<TablePull> {
        let since = match mode {
            PullMode::Full => None,
            PullMode::Since(at) => Some(at),
        };

        let pending = self.repo.pending_record_ids(table).await?;
        let store = self.repo.table(table);
        let mut page = PageRequest::first(self.page_size).since(since);
        let mut pulled = TablePull::default();

        loop {
            let rows = self.remote.list(table, &page).await?;
            pulled.fetched += rows.len();

            for row in &rows {
                if self.should_apply(table, row, mode, &pending).await? {
                    store.put(row).await?;
                    pulled.applied += 1;
                } else {
                    pulled.kept_local += 1;
                }
            }

            if rows.len() < page.limit {
                break;
            }
            page = page.next();
        }

        Ok(pulled)
    }

    async fn should_apply(
        &self,
        table: Table,
        row: &Value,
        mode: PullMode,
        pending: &HashSet<String>,
    ) -> Result<bool> {
        let Some(id) = row.get("id").and_then(Value::as_str) else {
            return Ok(false);
        };

        if pending.contains(id) {
            return Ok(false);
        }

        if mode == PullMode::Full {
            return Ok(true);
        }

        let Some(local) = self.repo.table(table).get(id).await? else {
            return Ok(true);
        };

        Ok(match (updated_at(row), updated_at(&local)) {
            (Some(remote), Some(local)) => remote >= local,
            _ => true,
        })
    }

    /// Fetch the actor's settings row and mirror it in local shape
    pub async fn pull_user_settings(&self, actor: &Actor) -> Result<Option<UserSettings>> {
        let Some(row) = self.remote.get_one(Table::UserSettings, &actor.id).await? else {
            tracing::debug!("No remote settings for {}", actor);
            return Ok(None);
        };

        let settings = settings_from_remote(&actor.id, &row);
        let stored = self.repo.records::<UserSettings>().put(&settings).await?;
        Ok(Some(stored))
    }
}

/// Map a remote settings row onto [`UserSettings`], defaulting nulls.
///
/// Older rows use `default_currency` and `locale`; both spellings are read.
pub fn settings_from_remote(actor_id: &str, row: &Value) -> UserSettings {
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| row.get(*key).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };

    let month_start_day = row
        .get("month_start_day")
        .and_then(Value::as_u64)
        .filter(|day| (1..=28).contains(day))
        .map(|day| day as u32)
        .unwrap_or(1);

    UserSettings {
        id: actor_id.to_string(),
        currency: text(&["currency", "default_currency"])
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        language: text(&["language", "locale"]).unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        default_group_id: text(&["default_group_id"]),
        month_start_day,
        updated_at: updated_at(row),
        deleted_at: row
            .get("deleted_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
    }
}

fn updated_at(row: &Value) -> Option<DateTime<Utc>> {
    row.get("updated_at")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{test_repository, QueueOperation};
    use crate::remote::{InMemoryRemote, RemoteError};
    use serde_json::json;

    fn reconciler(repo: &Repository, remote: &InMemoryRemote) -> Reconciler {
        Reconciler::new(repo.clone(), Arc::new(remote.clone()))
    }

    fn seed_transactions(remote: &InMemoryRemote, count: usize) {
        remote.seed(
            Table::Transactions,
            (0..count).map(|i| {
                json!({
                    "id": format!("t{:04}", i),
                    "date": "2024-02-10",
                    "amount": 1,
                    "updated_at": "2024-02-10T00:00:00Z",
                })
            }),
        );
    }

    #[tokio::test]
    async fn test_pages_until_short_page() {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        seed_transactions(&remote, 5);

        let pulled = reconciler(&repo, &remote)
            .with_page_size(2)
            .pull_table(Table::Transactions, PullMode::Full)
            .await
            .unwrap();

        assert_eq!(pulled.fetched, 5);
        assert_eq!(remote.list_calls(), 3);
        assert_eq!(repo.table(Table::Transactions).count().await.unwrap(), 5);

        let row = repo.table(Table::Transactions).get("t0003").await.unwrap().unwrap();
        assert_eq!(row["year_month"], "2024-02");
    }

    #[tokio::test]
    async fn test_exact_page_needs_one_empty_page() {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        seed_transactions(&remote, 4);

        reconciler(&repo, &remote)
            .with_page_size(2)
            .pull_table(Table::Transactions, PullMode::Full)
            .await
            .unwrap();

        assert_eq!(remote.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_normalizes_flags() {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        remote.seed(
            Table::ShoppingItems,
            [json!({"id": "s1", "name": "Milk", "checked": 1})],
        );

        reconciler(&repo, &remote)
            .pull_table(Table::ShoppingItems, PullMode::Full)
            .await
            .unwrap();

        let row = repo.table(Table::ShoppingItems).get("s1").await.unwrap().unwrap();
        assert_eq!(row["checked"], true);
    }

    #[tokio::test]
    async fn test_failing_table_does_not_abort_pull() {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        remote.seed(Table::Contexts, [json!({"id": "ctx", "name": "Trip"})]);
        // Categories are pulled first and take the injected failure.
        remote.fail_next(RemoteError::rejected("42501", "permission denied"));

        let report = reconciler(&repo, &remote).pull(PullMode::Full).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Table::Categories);
        assert!(repo.table(Table::Contexts).get("ctx").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_records_are_not_overwritten() {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        remote.seed(Table::Contexts, [json!({"id": "c1", "name": "Remote"})]);

        repo.table(Table::Contexts)
            .put(&json!({"id": "c1", "name": "Local", "pending_sync": true}))
            .await
            .unwrap();
        repo.enqueue_operation(Table::Contexts, QueueOperation::Update, "c1", None, None)
            .await
            .unwrap();

        let pulled = reconciler(&repo, &remote)
            .pull_table(Table::Contexts, PullMode::Full)
            .await
            .unwrap();

        assert_eq!(pulled.kept_local, 1);
        let row = repo.table(Table::Contexts).get("c1").await.unwrap().unwrap();
        assert_eq!(row["name"], "Local");
    }

    #[tokio::test]
    async fn test_delta_pull_is_last_write_wins() {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        remote.seed(
            Table::Contexts,
            [
                json!({"id": "old", "name": "Remote old", "updated_at": "2024-03-01T00:00:00Z"}),
                json!({"id": "new", "name": "Remote new", "updated_at": "2024-03-05T00:00:00Z"}),
                json!({"id": "stale", "name": "Remote stale", "updated_at": "2024-01-01T00:00:00Z"}),
            ],
        );
        repo.table(Table::Contexts)
            .put(&json!({"id": "old", "name": "Local newer", "updated_at": "2024-03-02T00:00:00Z"}))
            .await
            .unwrap();
        repo.table(Table::Contexts)
            .put(&json!({"id": "new", "name": "Local older", "updated_at": "2024-03-04T00:00:00Z"}))
            .await
            .unwrap();

        let since: DateTime<Utc> = "2024-02-01T00:00:00Z".parse().unwrap();
        let pulled = reconciler(&repo, &remote)
            .pull_table(Table::Contexts, PullMode::Since(since))
            .await
            .unwrap();

        assert_eq!(pulled.fetched, 2);
        let store = repo.table(Table::Contexts);
        assert_eq!(store.get("old").await.unwrap().unwrap()["name"], "Local newer");
        assert_eq!(store.get("new").await.unwrap().unwrap()["name"], "Remote new");
        assert!(store.get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_settings_mapping_and_defaults() {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        remote.seed(
            Table::UserSettings,
            [json!({"id": "user-1", "default_currency": "USD", "locale": null, "month_start_day": 40})],
        );

        let settings = reconciler(&repo, &remote)
            .pull_user_settings(&Actor::new("user-1", "token"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(settings.currency, "USD");
        assert_eq!(settings.language, DEFAULT_LANGUAGE);
        assert_eq!(settings.month_start_day, 1);

        let stored = repo.records::<UserSettings>().get("user-1").await.unwrap().unwrap();
        assert_eq!(stored, settings);

        let missing = reconciler(&repo, &remote)
            .pull_user_settings(&Actor::new("user-2", "token"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
