use crate::error::{Result, SkillDbError};
use crate::query::{find_unique_record, UniqueWhere};
use crate::schema::OnDeletePolicy;
use crate::storage::DataSource;
use crate::value::Value;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Rows whose foreign key restricts a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blocker {
    pub entity: String,
    pub field: String,
    pub count: u64,
}

/// Everything a delete of one row would touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletePlan {
    /// `(entity, id)` in deletion order: dependents before their parents,
    /// the requested row last.
    pub deletes: Vec<(String, String)>,
    /// `(entity, id, foreign key)` rows that survive with the key cleared.
    pub nullify: Vec<(String, String, String)>,
    pub blockers: Vec<Blocker>,
}

impl DeletePlan {
    /// Fail with the first restricting relation, if any.
    pub fn check(&self) -> Result<()> {
        match self.blockers.first() {
            Some(b) => Err(SkillDbError::integrity(&b.entity, &b.field)),
            None => Ok(()),
        }
    }

    fn is_deleted(&self, entity: &str, id: &str) -> bool {
        self.deletes.iter().any(|(e, i)| e == entity && i == id)
    }
}

/// Walk incoming foreign keys from one row and plan the cascade.
pub fn plan_delete<S: DataSource>(source: &S, entity: &str, id: &str) -> Result<DeletePlan> {
    let mut plan = DeletePlan::default();
    let mut visited = BTreeSet::new();
    visit(source, entity, id, &mut plan, &mut visited)?;

    // A row reached both for nulling and for deletion is only deleted
    let nullify = std::mem::take(&mut plan.nullify);
    plan.nullify = nullify
        .into_iter()
        .filter(|(e, i, _)| !plan.is_deleted(e, i))
        .collect();
    Ok(plan)
}

fn visit<S: DataSource>(
    source: &S,
    entity: &str,
    id: &str,
    plan: &mut DeletePlan,
    visited: &mut BTreeSet<(String, String)>,
) -> Result<()> {
    if !visited.insert((entity.to_string(), id.to_string())) {
        return Ok(());
    }
    let key = Value::String(id.to_string());
    for incoming in source.registry().incoming_relations(entity) {
        let fk = incoming.foreign_key();
        let children = source.scan(&incoming.entity, Some((fk, &key)))?;
        if children.is_empty() {
            continue;
        }
        match incoming.on_delete().unwrap_or_default() {
            OnDeletePolicy::Cascade => {
                for child in &children {
                    visit(source, &incoming.entity, child.id(), plan, visited)?;
                }
            }
            OnDeletePolicy::SetNull => {
                for child in &children {
                    plan.nullify.push((
                        incoming.entity.clone(),
                        child.id().to_string(),
                        fk.to_string(),
                    ));
                }
            }
            OnDeletePolicy::Restrict => plan.blockers.push(Blocker {
                entity: incoming.entity.clone(),
                field: fk.to_string(),
                count: children.len() as u64,
            }),
        }
    }
    plan.deletes.push((entity.to_string(), id.to_string()));
    Ok(())
}

/// Read-only report of what deleting a row would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteImpact {
    pub entity: String,
    pub id: String,
    /// Rows removed per entity, the requested row included.
    pub deletes: BTreeMap<String, u64>,
    pub nullifies: BTreeMap<String, u64>,
    pub blocked_by: Vec<Blocker>,
}

impl DeleteImpact {
    pub fn can_delete(&self) -> bool {
        self.blocked_by.is_empty()
    }

    pub fn total_deletes(&self) -> u64 {
        self.deletes.values().sum()
    }
}

pub fn deletion_impact<S: DataSource>(
    source: &S,
    entity: &str,
    key: &UniqueWhere,
) -> Result<DeleteImpact> {
    let record = find_unique_record(source, entity, key)?.ok_or_else(|| SkillDbError::NotFound {
        entity: entity.to_string(),
        key: key.to_string(),
    })?;
    let plan = plan_delete(source, entity, record.id())?;

    let mut deletes = BTreeMap::new();
    for (e, _) in &plan.deletes {
        *deletes.entry(e.clone()).or_insert(0) += 1;
    }
    let mut nullifies = BTreeMap::new();
    for (e, _, _) in &plan.nullify {
        *nullifies.entry(e.clone()).or_insert(0) += 1;
    }
    Ok(DeleteImpact {
        entity: entity.to_string(),
        id: record.id().to_string(),
        deletes,
        nullifies,
        blocked_by: plan.blockers,
    })
}
