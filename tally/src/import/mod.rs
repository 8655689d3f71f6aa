//! Import pipeline
//!
//! Brings entities from an external export into the local data set.
//! Matching produces plans and conflict sets; the [`BatchImporter`] applies
//! them through the write path.

pub mod categories;
pub mod contexts;
pub mod importer;
pub mod matcher;
pub mod recurring;

pub use categories::{plan_categories, CategoryPlan, PlannedCategory};
pub use contexts::{plan_contexts, ContextPlan, PlannedContext};
pub use importer::{normalize_amount, BatchImporter, FailedRow, ImportReport};
pub use recurring::{find_conflicts, ConflictChoice, MergeCandidate, Resolution};

use crate::database::{Frequency, TransactionType};
use crate::error::{AppError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Category as found in the source; `id` and `parent_id` are source ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedCategory {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<TransactionType>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedContext {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Recurring template from the source. `amount` may be signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedRecurring {
    pub id: String,
    pub description: String,
    pub amount: Decimal,
    #[serde(rename = "type", default)]
    pub kind: Option<TransactionType>,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
}

/// Transaction from the source. `amount` may be signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedTransaction {
    pub id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    #[serde(rename = "type", default)]
    pub kind: Option<TransactionType>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub recurring_id: Option<String>,
}

/// Everything read from one external export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportBundle {
    #[serde(default)]
    pub categories: Vec<ImportedCategory>,
    #[serde(default)]
    pub contexts: Vec<ImportedContext>,
    #[serde(default)]
    pub recurring: Vec<ImportedRecurring>,
    #[serde(default)]
    pub transactions: Vec<ImportedTransaction>,
}

impl ImportBundle {
    pub fn from_json(json: &str) -> Result<Self> {
        let bundle: Self = serde_json::from_str(json)
            .map_err(|e| AppError::Import(format!("Unreadable import file: {}", e)))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Reject bundles with blank names or repeated source ids
    pub fn validate(&self) -> Result<()> {
        check_ids("category", self.categories.iter().map(|c| c.id.as_str()))?;
        check_ids("context", self.contexts.iter().map(|c| c.id.as_str()))?;
        check_ids("recurring", self.recurring.iter().map(|r| r.id.as_str()))?;

        if let Some(c) = self.categories.iter().find(|c| c.name.trim().is_empty()) {
            return Err(AppError::Import(format!("Category {} has no name", c.id)));
        }
        if let Some(c) = self.contexts.iter().find(|c| c.name.trim().is_empty()) {
            return Err(AppError::Import(format!("Context {} has no name", c.id)));
        }

        Ok(())
    }
}

fn check_ids<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(AppError::Import(format!("A {} has an empty id", kind)));
        }
        if !seen.insert(id) {
            return Err(AppError::Import(format!("Duplicate {} id: {}", kind, id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bundle() {
        let bundle = ImportBundle::from_json(
            r#"{
                "categories": [{"id": "1", "name": "Food", "type": "expense"}],
                "transactions": [{"id": "t", "date": "2024-01-05", "amount": -12.5, "category_id": "1"}]
            }"#,
        )
        .unwrap();

        assert_eq!(bundle.categories[0].kind, Some(TransactionType::Expense));
        assert!(bundle.contexts.is_empty());
        assert!(bundle.transactions[0].amount.is_sign_negative());
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let result = ImportBundle::from_json(
            r#"{"categories": [{"id": "1", "name": "A"}, {"id": "1", "name": "B"}]}"#,
        );
        assert!(matches!(result, Err(AppError::Import(_))));
    }

    #[test]
    fn test_blank_name_is_rejected() {
        let result = ImportBundle::from_json(r#"{"contexts": [{"id": "1", "name": "  "}]}"#);
        assert!(matches!(result, Err(AppError::Import(_))));
    }
}
