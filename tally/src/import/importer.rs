//! Batch importer
//!
//! Applies a bundle in dependency order: categories, contexts, recurring
//! templates, transactions. Every record goes through the write path, so an
//! import made offline is queued like any other edit.

use super::categories::plan_categories;
use super::contexts::plan_contexts;
use super::matcher::normalize_name;
use super::recurring::{find_conflicts, ConflictChoice, MergeCandidate, Resolution};
use super::{ImportBundle, ImportedRecurring, ImportedTransaction};
use crate::config::{DEFAULT_MATCH_THRESHOLD, FALLBACK_CATEGORY_NAME};
use crate::database::{Category, Context, RecurringTransaction, Repository, Table, TransactionType};
use crate::error::{AppError, Result};
use crate::session::Actor;
use crate::sync::WritePath;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub categories_created: usize,
    pub categories_merged: usize,
    pub contexts_created: usize,
    pub contexts_merged: usize,
    pub recurring_created: usize,
    pub recurring_merged: usize,
    pub recurring_skipped: usize,
    pub transactions_imported: usize,
    /// Transactions attached to the fallback category
    pub uncategorized: usize,
    /// Transactions the remote refused; the rest of the import went ahead
    pub failed: Vec<FailedRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRow {
    pub source_id: String,
    pub message: String,
}

/// Unsigned magnitude plus direction.
///
/// An explicit type wins; otherwise a negative amount is an expense.
pub fn normalize_amount(amount: Decimal, kind: Option<TransactionType>) -> (Decimal, TransactionType) {
    let kind = kind.unwrap_or(if amount.is_sign_negative() {
        TransactionType::Expense
    } else {
        TransactionType::Income
    });
    (amount.abs(), kind)
}

pub struct BatchImporter {
    repo: Repository,
    writes: WritePath,
    threshold: usize,
}

/// Local ids assigned during one import, keyed by source id
#[derive(Default)]
struct IdMaps {
    categories: HashMap<String, String>,
    contexts: HashMap<String, String>,
    recurring: HashMap<String, String>,
    fallback: HashMap<TransactionType, String>,
}

impl BatchImporter {
    pub fn new(repo: Repository, writes: WritePath) -> Self {
        Self {
            repo,
            writes,
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Recurring templates in `bundle` that need a merge decision
    pub async fn conflicts(&self, bundle: &ImportBundle) -> Result<Vec<MergeCandidate>> {
        let existing = self.repo.records::<RecurringTransaction>().list().await?;
        Ok(find_conflicts(&bundle.recurring, &existing, self.threshold))
    }

    pub async fn import(
        &self,
        bundle: &ImportBundle,
        resolution: &Resolution,
        actor: &Actor,
    ) -> Result<ImportReport> {
        bundle.validate()?;
        tracing::info!(
            "Importing {} categories, {} contexts, {} recurring, {} transactions",
            bundle.categories.len(),
            bundle.contexts.len(),
            bundle.recurring.len(),
            bundle.transactions.len()
        );

        let mut report = ImportReport::default();
        let mut ids = IdMaps::default();

        self.import_categories(bundle, actor, &mut ids, &mut report)
            .await?;
        self.import_contexts(bundle, actor, &mut ids, &mut report)
            .await?;
        self.import_recurring(bundle, resolution, actor, &mut ids, &mut report)
            .await?;

        for transaction in &bundle.transactions {
            match self
                .import_transaction(transaction, actor, &mut ids, &mut report)
                .await
            {
                Ok(()) => {}
                Err(AppError::Remote(err)) => {
                    tracing::warn!("Skipping imported transaction {}: {}", transaction.id, err);
                    report.failed.push(FailedRow {
                        source_id: transaction.id.clone(),
                        message: err.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!("Import finished: {:?}", report);
        Ok(report)
    }

    async fn import_categories(
        &self,
        bundle: &ImportBundle,
        actor: &Actor,
        ids: &mut IdMaps,
        report: &mut ImportReport,
    ) -> Result<()> {
        let existing = self.repo.records::<Category>().list().await?;
        let plan = plan_categories(&bundle.categories, &existing, self.threshold);

        for category in &plan.to_create {
            self.writes
                .insert(
                    Table::Categories,
                    &json!({
                        "id": category.id,
                        "name": category.name,
                        "type": category.kind,
                        "parent_id": category.parent_id,
                        "icon": category.icon,
                        "color": category.color,
                        "active": true,
                    }),
                    actor,
                )
                .await?;
        }

        report.categories_created = plan.to_create.len();
        report.categories_merged = plan.merged.len();
        ids.categories = plan.id_map;
        Ok(())
    }

    async fn import_contexts(
        &self,
        bundle: &ImportBundle,
        actor: &Actor,
        ids: &mut IdMaps,
        report: &mut ImportReport,
    ) -> Result<()> {
        let existing = self.repo.records::<Context>().list().await?;
        let plan = plan_contexts(&bundle.contexts, &existing, self.threshold);

        for context in &plan.to_create {
            self.writes
                .insert(
                    Table::Contexts,
                    &json!({
                        "id": context.id,
                        "name": context.name,
                        "description": context.description,
                        "active": true,
                    }),
                    actor,
                )
                .await?;
        }

        report.contexts_created = plan.to_create.len();
        report.contexts_merged = plan.merged;
        ids.contexts = plan.id_map;
        Ok(())
    }

    async fn import_recurring(
        &self,
        bundle: &ImportBundle,
        resolution: &Resolution,
        actor: &Actor,
        ids: &mut IdMaps,
        report: &mut ImportReport,
    ) -> Result<()> {
        let existing = self.repo.records::<RecurringTransaction>().list().await?;
        let conflicts: HashMap<String, String> =
            find_conflicts(&bundle.recurring, &existing, self.threshold)
                .into_iter()
                .map(|c| (c.imported.id, c.existing.id))
                .collect();

        for template in &bundle.recurring {
            if resolution.is_skipped(&template.id) {
                report.recurring_skipped += 1;
                continue;
            }

            if let Some(existing_id) = conflicts.get(&template.id) {
                if resolution.choice_for(&template.id) == ConflictChoice::Merge {
                    ids.recurring.insert(template.id.clone(), existing_id.clone());
                    report.recurring_merged += 1;
                    continue;
                }
            }

            let id = self.create_recurring(template, actor, ids).await?;
            ids.recurring.insert(template.id.clone(), id);
            report.recurring_created += 1;
        }

        Ok(())
    }

    async fn create_recurring(
        &self,
        template: &ImportedRecurring,
        actor: &Actor,
        ids: &mut IdMaps,
    ) -> Result<String> {
        let (amount, kind) = normalize_amount(template.amount, template.kind);
        let (category_id, _) = self
            .resolve_category(template.category_id.as_deref(), kind, actor, ids)
            .await?;
        let id = Uuid::new_v4().to_string();

        self.writes
            .insert(
                Table::RecurringTransactions,
                &json!({
                    "id": id,
                    "type": kind,
                    "amount": amount,
                    "description": template.description.trim(),
                    "frequency": template.frequency,
                    "start_date": template.start_date.to_string(),
                    "end_date": template.end_date.map(|d| d.to_string()),
                    "category_id": category_id,
                    "context_id": lookup(&ids.contexts, template.context_id.as_deref()),
                    "active": true,
                }),
                actor,
            )
            .await?;

        Ok(id)
    }

    async fn import_transaction(
        &self,
        transaction: &ImportedTransaction,
        actor: &Actor,
        ids: &mut IdMaps,
        report: &mut ImportReport,
    ) -> Result<()> {
        let (amount, kind) = normalize_amount(transaction.amount, transaction.kind);
        let (category_id, fell_back) = self
            .resolve_category(transaction.category_id.as_deref(), kind, actor, ids)
            .await?;

        self.writes
            .insert(
                Table::Transactions,
                &json!({
                    "id": Uuid::new_v4().to_string(),
                    "type": kind,
                    "amount": amount,
                    "description": transaction.description.trim(),
                    "date": transaction.date.to_string(),
                    "category_id": category_id,
                    "context_id": lookup(&ids.contexts, transaction.context_id.as_deref()),
                    "recurring_id": lookup(&ids.recurring, transaction.recurring_id.as_deref()),
                }),
                actor,
            )
            .await?;

        report.transactions_imported += 1;
        if fell_back {
            report.uncategorized += 1;
        }
        Ok(())
    }

    /// Local category for a source category id, or the fallback category
    /// for `kind` when the source id is missing or unknown
    async fn resolve_category(
        &self,
        source_id: Option<&str>,
        kind: TransactionType,
        actor: &Actor,
        ids: &mut IdMaps,
    ) -> Result<(String, bool)> {
        if let Some(id) = lookup(&ids.categories, source_id) {
            return Ok((id, false));
        }

        if let Some(id) = ids.fallback.get(&kind) {
            return Ok((id.clone(), true));
        }

        let id = self.ensure_fallback_category(kind, actor).await?;
        ids.fallback.insert(kind, id.clone());
        Ok((id, true))
    }

    /// Find the fallback category by name or create it
    async fn ensure_fallback_category(&self, kind: TransactionType, actor: &Actor) -> Result<String> {
        let wanted = normalize_name(FALLBACK_CATEGORY_NAME);
        let existing = self.repo.records::<Category>().list().await?;

        if let Some(category) = existing
            .iter()
            .find(|c| c.kind == kind && normalize_name(&c.name) == wanted)
        {
            return Ok(category.id.clone());
        }

        tracing::info!("Creating fallback category for {} transactions", kind.as_str());
        let row = self
            .writes
            .insert(
                Table::Categories,
                &json!({
                    "name": FALLBACK_CATEGORY_NAME,
                    "type": kind,
                    "active": true,
                }),
                actor,
            )
            .await?;

        row.get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| AppError::invalid(Table::Categories, "fallback category has no id"))
    }
}

fn lookup(map: &HashMap<String, String>, source_id: Option<&str>) -> Option<String> {
    source_id.and_then(|id| map.get(id).cloned())
}
