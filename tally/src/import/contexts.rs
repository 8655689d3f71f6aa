//! Context import planning
//!
//! Contexts are flat, so a single pass maps each imported context onto a
//! matching existing one or a fresh id.

use super::matcher::find_best_match;
use super::ImportedContext;
use crate::database::Context;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedContext {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContextPlan {
    pub id_map: HashMap<String, String>,
    pub to_create: Vec<PlannedContext>,
    pub merged: usize,
}

pub fn plan_contexts(
    imported: &[ImportedContext],
    existing: &[Context],
    threshold: usize,
) -> ContextPlan {
    let mut plan = ContextPlan::default();
    let live: Vec<&Context> = existing.iter().filter(|c| c.deleted_at.is_none()).collect();

    for context in imported {
        if let Some(hit) = find_best_match(&context.name, &live, |c| c.name.as_str(), threshold) {
            plan.id_map.insert(context.id.clone(), hit.candidate.id.clone());
            plan.merged += 1;
            continue;
        }

        let repeat = find_best_match(&context.name, &plan.to_create, |c| c.name.as_str(), threshold)
            .map(|hit| hit.candidate.id.clone());
        if let Some(id) = repeat {
            plan.id_map.insert(context.id.clone(), id);
            continue;
        }

        let id = Uuid::new_v4().to_string();
        plan.id_map.insert(context.id.clone(), id.clone());
        plan.to_create.push(PlannedContext {
            id,
            name: context.name.trim().to_string(),
            description: context.description.clone(),
        });
    }

    plan
}
