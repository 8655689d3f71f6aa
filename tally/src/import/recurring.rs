//! Recurring template conflicts
//!
//! Imported templates that look like existing ones are proposed as merge
//! candidates. The caller decides each one; nothing here picks a side.

use super::matcher::find_best_match;
use super::ImportedRecurring;
use crate::database::RecurringTransaction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeCandidate {
    pub imported: ImportedRecurring,
    pub existing: RecurringTransaction,
    /// Edit distance between the descriptions; 0 is an exact match
    pub score: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Reuse the existing template's id
    Merge,
    /// Import as a new template next to the existing one
    KeepBoth,
}

/// The caller's answers, keyed by imported template id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(default)]
    pub choices: HashMap<String, ConflictChoice>,
    /// Imported templates not to import at all
    #[serde(default)]
    pub skip: HashSet<String>,
}

impl Resolution {
    /// Merge every proposed candidate
    pub fn merge_all(candidates: &[MergeCandidate]) -> Self {
        Self {
            choices: candidates
                .iter()
                .map(|c| (c.imported.id.clone(), ConflictChoice::Merge))
                .collect(),
            skip: HashSet::new(),
        }
    }

    pub fn choose(&mut self, imported_id: impl Into<String>, choice: ConflictChoice) {
        self.choices.insert(imported_id.into(), choice);
    }

    pub fn skip(&mut self, imported_id: impl Into<String>) {
        self.skip.insert(imported_id.into());
    }

    /// Undecided conflicts import as new templates.
    pub fn choice_for(&self, imported_id: &str) -> ConflictChoice {
        self.choices
            .get(imported_id)
            .copied()
            .unwrap_or(ConflictChoice::KeepBoth)
    }

    pub fn is_skipped(&self, imported_id: &str) -> bool {
        self.skip.contains(imported_id)
    }
}

/// Pair each imported template with its closest live existing template of
/// the same frequency, when the descriptions are within `threshold`.
pub fn find_conflicts(
    imported: &[ImportedRecurring],
    existing: &[RecurringTransaction],
    threshold: usize,
) -> Vec<MergeCandidate> {
    imported
        .iter()
        .filter_map(|template| {
            let candidates: Vec<&RecurringTransaction> = existing
                .iter()
                .filter(|e| e.deleted_at.is_none() && e.frequency == template.frequency)
                .collect();

            find_best_match(
                &template.description,
                &candidates,
                |e| e.description.as_str(),
                threshold,
            )
            .map(|hit| MergeCandidate {
                imported: template.clone(),
                existing: (*hit.candidate).clone(),
                score: hit.score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Frequency, TransactionType};
    use rust_decimal_macros::dec;

    fn imported(id: &str, description: &str, frequency: Frequency) -> ImportedRecurring {
        ImportedRecurring {
            id: id.to_string(),
            description: description.to_string(),
            amount: dec!(-9.99),
            kind: None,
            frequency,
            start_date: "2024-01-01".parse().unwrap(),
            end_date: None,
            category_id: None,
            context_id: None,
        }
    }

    fn existing(id: &str, description: &str) -> RecurringTransaction {
        RecurringTransaction {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            group_id: None,
            category_id: None,
            context_id: None,
            kind: TransactionType::Expense,
            amount: dec!(9.99),
            description: description.to_string(),
            frequency: Frequency::Monthly,
            start_date: "2023-06-01".parse().unwrap(),
            end_date: None,
            last_generated: None,
            active: true,
            updated_at: None,
            deleted_at: None,
            sync_token: None,
            pending_sync: false,
        }
    }

    #[test]
    fn test_conflicts_are_proposed_not_decided() {
        let conflicts = find_conflicts(
            &[
                imported("i1", "Netflix", Frequency::Monthly),
                imported("i2", "Gym", Frequency::Monthly),
                imported("i3", "netflix", Frequency::Yearly),
            ],
            &[existing("r1", "NETFLIX ")],
            2,
        );

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].imported.id, "i1");
        assert_eq!(conflicts[0].existing.id, "r1");
        assert_eq!(conflicts[0].score, 0);
    }

    #[test]
    fn test_resolution_defaults_to_keep_both() {
        let conflicts = find_conflicts(
            &[imported("i1", "Netflix", Frequency::Monthly)],
            &[existing("r1", "Netflix")],
            2,
        );

        let mut resolution = Resolution::default();
        assert_eq!(resolution.choice_for("i1"), ConflictChoice::KeepBoth);

        resolution = Resolution::merge_all(&conflicts);
        assert_eq!(resolution.choice_for("i1"), ConflictChoice::Merge);

        resolution.choose("i1", ConflictChoice::KeepBoth);
        resolution.skip("i9");
        assert_eq!(resolution.choice_for("i1"), ConflictChoice::KeepBoth);
        assert!(resolution.is_skipped("i9"));
    }
}
