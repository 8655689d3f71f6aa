//! Category import planning
//!
//! Two passes. The first assigns every imported category a local id, either
//! the id of a matching existing category or a fresh one. The second builds
//! the categories to create with `parent_id` resolved through the same map,
//! so the source's declaration order does not matter.

use super::matcher::find_best_match;
use super::ImportedCategory;
use crate::database::{Category, TransactionType};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCategory {
    pub id: String,
    pub name: String,
    pub kind: TransactionType,
    pub parent_id: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CategoryPlan {
    /// Source id to local id, for every imported category
    pub id_map: HashMap<String, String>,
    /// New categories, each listed after its parent
    pub to_create: Vec<PlannedCategory>,
    /// Source id, existing id and match score of merged categories
    pub merged: Vec<(String, String, usize)>,
}

pub fn plan_categories(
    imported: &[ImportedCategory],
    existing: &[Category],
    threshold: usize,
) -> CategoryPlan {
    let mut plan = CategoryPlan::default();
    let live: Vec<&Category> = existing.iter().filter(|c| c.deleted_at.is_none()).collect();
    // Names already planned for creation, so repeats inside one import collapse.
    let mut planned: Vec<(String, TransactionType, String)> = Vec::new();
    let mut fresh: Vec<&ImportedCategory> = Vec::new();

    for category in imported {
        let kind = category.kind.unwrap_or(TransactionType::Expense);

        let candidates: Vec<&Category> = live
            .iter()
            .copied()
            .filter(|c| category.kind.map_or(true, |k| k == c.kind))
            .collect();

        if let Some(hit) = find_best_match(&category.name, &candidates, |c| c.name.as_str(), threshold) {
            tracing::debug!(
                "Category '{}' merges into '{}' (score {})",
                category.name,
                hit.candidate.name,
                hit.score
            );
            plan.id_map.insert(category.id.clone(), hit.candidate.id.clone());
            plan.merged
                .push((category.id.clone(), hit.candidate.id.clone(), hit.score));
            continue;
        }

        let repeat = {
            let same_kind: Vec<&(String, TransactionType, String)> =
                planned.iter().filter(|(_, k, _)| *k == kind).collect();
            find_best_match(&category.name, &same_kind, |p| p.0.as_str(), threshold)
                .map(|hit| hit.candidate.2.clone())
        };
        if let Some(id) = repeat {
            plan.id_map.insert(category.id.clone(), id);
            continue;
        }

        let id = Uuid::new_v4().to_string();
        plan.id_map.insert(category.id.clone(), id.clone());
        planned.push((category.name.clone(), kind, id));
        fresh.push(category);
    }

    let creations: Vec<PlannedCategory> = fresh
        .iter()
        .map(|category| {
            let parent_id = category.parent_id.as_ref().and_then(|source| {
                let mapped = plan.id_map.get(source).cloned();
                if mapped.is_none() {
                    tracing::warn!(
                        "Category '{}' references unknown parent {}",
                        category.name,
                        source
                    );
                }
                mapped
            });

            PlannedCategory {
                id: plan.id_map[&category.id].clone(),
                name: category.name.trim().to_string(),
                kind: category.kind.unwrap_or(TransactionType::Expense),
                parent_id,
                icon: category.icon.clone(),
                color: category.color.clone(),
            }
        })
        .collect();

    plan.to_create = parents_first(creations);
    plan
}

/// Order categories so a parent created in the same batch comes first.
/// A parent cycle is broken by dropping the parent of the remaining members.
fn parents_first(mut pending: Vec<PlannedCategory>) -> Vec<PlannedCategory> {
    let new_ids: HashSet<String> = pending.iter().map(|c| c.id.clone()).collect();
    let mut emitted: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|c| {
            c.parent_id
                .as_ref()
                .map_or(true, |p| !new_ids.contains(p) || emitted.contains(p))
        });

        if ready.is_empty() {
            tracing::warn!("Category parent cycle detected, flattening {} categories", blocked.len());
            for mut category in blocked {
                category.parent_id = None;
                ordered.push(category);
            }
            break;
        }

        for category in ready {
            emitted.insert(category.id.clone());
            ordered.push(category);
        }
        pending = blocked;
    }

    ordered
}
