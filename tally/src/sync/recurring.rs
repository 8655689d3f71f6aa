//! Recurring materializer
//!
//! Expands recurring templates into concrete transactions up to a given day.
//! Occurrences are counted from `start_date` rather than chained from the
//! previous one, so a template starting on the 31st lands on the last day of
//! short months and returns to the 31st afterwards.

use super::write_path::WritePath;
use crate::database::{Frequency, RecurringTransaction, Repository, Table};
use crate::error::{AppError, Result};
use crate::session::Actor;
use chrono::{Days, Months, NaiveDate};
use serde_json::json;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Templates that were due at least once
    pub templates: usize,
    pub generated: usize,
    /// Template id and error for templates that stopped early
    pub failed: Vec<(String, String)>,
}

/// Date of the `n`th occurrence of a template, the first being `start`
pub fn occurrence(start: NaiveDate, frequency: Frequency, n: u32) -> Option<NaiveDate> {
    match frequency {
        Frequency::Daily => start.checked_add_days(Days::new(u64::from(n))),
        Frequency::Weekly => start.checked_add_days(Days::new(u64::from(n) * 7)),
        Frequency::Monthly => start.checked_add_months(Months::new(n)),
        Frequency::Yearly => n
            .checked_mul(12)
            .and_then(|months| start.checked_add_months(Months::new(months))),
    }
}

/// Index of the first occurrence strictly after `last_generated`
fn next_index(template: &RecurringTransaction) -> Option<u32> {
    let Some(last) = template.last_generated else {
        return Some(0);
    };

    let mut n = 0;
    loop {
        let date = occurrence(template.start_date, template.frequency, n)?;
        if date > last {
            return Some(n);
        }
        n = n.checked_add(1)?;
    }
}

/// Occurrences of `template` due on or before `today`, oldest first
pub fn due_dates(template: &RecurringTransaction, today: NaiveDate) -> Vec<NaiveDate> {
    let Some(mut n) = next_index(template) else {
        return Vec::new();
    };

    let mut dates = Vec::new();
    while let Some(date) = occurrence(template.start_date, template.frequency, n) {
        if date > today || template.end_date.is_some_and(|end| date > end) {
            break;
        }
        dates.push(date);
        n += 1;
    }
    dates
}

#[derive(Clone)]
pub struct RecurringMaterializer {
    repo: Repository,
    writes: WritePath,
}

impl RecurringMaterializer {
    pub fn new(repo: Repository, writes: WritePath) -> Self {
        Self { repo, writes }
    }

    /// Catch up every active template to `today`
    pub async fn materialize_due(&self, today: NaiveDate, actor: &Actor) -> Result<MaterializeReport> {
        let templates = self.repo.records::<RecurringTransaction>().list().await?;
        let mut report = MaterializeReport::default();

        for template in templates.iter().filter(|t| t.active && t.deleted_at.is_none()) {
            let dates = due_dates(template, today);
            if dates.is_empty() {
                continue;
            }

            report.templates += 1;
            match self.materialize(template, &dates, actor).await {
                Ok(count) => report.generated += count,
                Err((count, e)) => {
                    tracing::warn!(
                        "Recurring template {} stopped after {} transaction(s): {}",
                        template.id,
                        count,
                        e
                    );
                    report.generated += count;
                    report.failed.push((template.id.clone(), e.to_string()));
                }
            }
        }

        if report.generated > 0 {
            tracing::info!(
                "Materialized {} transaction(s) from {} template(s)",
                report.generated,
                report.templates
            );
        }
        Ok(report)
    }

    async fn materialize(
        &self,
        template: &RecurringTransaction,
        dates: &[NaiveDate],
        actor: &Actor,
    ) -> std::result::Result<usize, (usize, AppError)> {
        let mut generated = 0;

        for date in dates {
            let transaction = json!({
                "user_id": template.user_id,
                "group_id": template.group_id,
                "category_id": template.category_id,
                "context_id": template.context_id,
                "recurring_id": template.id,
                "type": template.kind,
                "amount": template.amount,
                "description": template.description,
                "date": date.to_string(),
            });

            self.writes
                .insert(Table::Transactions, &transaction, actor)
                .await
                .map_err(|e| (generated, e))?;

            self.writes
                .update(
                    Table::RecurringTransactions,
                    &template.id,
                    &json!({ "last_generated": date.to_string() }),
                    actor,
                )
                .await
                .map_err(|e| (generated + 1, e))?;

            generated += 1;
            tracing::debug!("Materialized {} for template {}", date, template.id);
        }

        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{test_repository, Transaction, TransactionType};
    use crate::remote::InMemoryRemote;
    use crate::session::Session;
    use crate::sync::connectivity::Connectivity;
    use crate::sync::queue::RetryQueue;
    use crate::sync::status::SyncStatusHub;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn template(id: &str, frequency: Frequency, start: &str) -> RecurringTransaction {
        RecurringTransaction {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            group_id: None,
            category_id: Some("cat-rent".to_string()),
            context_id: None,
            kind: TransactionType::Expense,
            amount: dec!(850.00),
            description: "Rent".to_string(),
            frequency,
            start_date: date(start),
            end_date: None,
            last_generated: None,
            active: true,
            updated_at: None,
            deleted_at: None,
            sync_token: None,
            pending_sync: false,
        }
    }

    async fn materializer() -> (RecurringMaterializer, Repository, InMemoryRemote) {
        let repo = test_repository().await;
        let remote = InMemoryRemote::new();
        let queue = RetryQueue::new(
            repo.clone(),
            Arc::new(remote.clone()),
            Session::new(),
            Connectivity::new(false),
            SyncStatusHub::new(),
        );
        let writes = WritePath::new(repo.clone(), Arc::new(remote.clone()), queue);
        (RecurringMaterializer::new(repo.clone(), writes), repo, remote)
    }

    #[test]
    fn test_month_end_does_not_drift() {
        let t = template("r", Frequency::Monthly, "2024-01-31");
        let dates = due_dates(&t, date("2024-04-30"));
        assert_eq!(
            dates,
            vec![date("2024-01-31"), date("2024-02-29"), date("2024-03-31"), date("2024-04-30")]
        );

        let mut t = t;
        t.last_generated = Some(date("2024-02-29"));
        assert_eq!(due_dates(&t, date("2024-04-30"))[0], date("2024-03-31"));
    }

    #[test]
    fn test_end_date_stops_generation() {
        let mut t = template("r", Frequency::Weekly, "2024-05-01");
        t.end_date = Some(date("2024-05-15"));
        assert_eq!(due_dates(&t, date("2024-06-30")).len(), 3);
    }

    #[test]
    fn test_future_start_is_not_due() {
        let t = template("r", Frequency::Daily, "2024-07-01");
        assert!(due_dates(&t, date("2024-06-30")).is_empty());
    }

    #[test]
    fn test_yearly_from_leap_day() {
        assert_eq!(
            occurrence(date("2024-02-29"), Frequency::Yearly, 1),
            Some(date("2025-02-28"))
        );
        assert_eq!(
            occurrence(date("2024-02-29"), Frequency::Yearly, 4),
            Some(date("2028-02-29"))
        );
    }

    #[tokio::test]
    async fn test_monthly_catch_up_generates_three() {
        let (materializer, repo, remote) = materializer().await;
        let actor = Actor::new("user-1", "token");
        let rent = template("rent", Frequency::Monthly, "2024-04-15");
        remote.seed(Table::RecurringTransactions, [serde_json::to_value(&rent).unwrap()]);
        repo.records::<RecurringTransaction>().put(&rent).await.unwrap();

        let report = materializer
            .materialize_due(date("2024-06-15"), &actor)
            .await
            .unwrap();
        assert_eq!(report.generated, 3);

        let mut txs = repo.records::<Transaction>().list().await.unwrap();
        txs.sort_by_key(|t| t.date);
        let dates: Vec<NaiveDate> = txs.iter().map(|t| t.date).collect();
        assert_eq!(dates, vec![date("2024-04-15"), date("2024-05-15"), date("2024-06-15")]);
        assert!(txs.iter().all(|t| t.recurring_id.as_deref() == Some("rent")));
        assert!(txs.iter().all(|t| t.amount == dec!(850)));

        let stored = repo
            .records::<RecurringTransaction>()
            .get("rent")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_generated, Some(date("2024-06-15")));

        // Running again on the same day generates nothing.
        let again = materializer
            .materialize_due(date("2024-06-15"), &actor)
            .await
            .unwrap();
        assert_eq!(again.generated, 0);
    }

    #[tokio::test]
    async fn test_inactive_and_deleted_templates_are_skipped() {
        let (materializer, repo, _remote) = materializer().await;
        let mut paused = template("paused", Frequency::Daily, "2024-06-01");
        paused.active = false;
        let mut gone = template("gone", Frequency::Daily, "2024-06-01");
        gone.deleted_at = Some(chrono::Utc::now());

        let store = repo.records::<RecurringTransaction>();
        store.put(&paused).await.unwrap();
        store.put(&gone).await.unwrap();

        let report = materializer
            .materialize_due(date("2024-06-10"), &Actor::new("user-1", "token"))
            .await
            .unwrap();

        assert_eq!(report, MaterializeReport::default());
    }
}
