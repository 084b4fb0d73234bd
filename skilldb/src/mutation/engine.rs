use super::validate::{apply_updates, prepare_create};
use super::{BatchResult, FieldUpdate, NestedWrite, WriteData};
use crate::error::{ErrorKind, Result, SkillDbError};
use crate::filter::{CompiledFilter, Filter};
use crate::query::{find_unique_record, UniqueWhere};
use crate::record::Record;
use crate::relation::plan_delete;
use crate::schema::{EntityDescriptor, RelationDescriptor, SchemaRegistry, ID_FIELD};
use crate::storage::{composite_key, DataSource};
use crate::transaction::{LockKey, Transaction};
use crate::value::Value;
use std::collections::BTreeMap;

/// Effect of a nested write through an owning relation on the local
/// foreign key.
enum ParentChange {
    Point(String),
    Clear,
    Keep,
}

pub fn create(tx: &mut Transaction, entity: &str, data: &WriteData) -> Result<Record> {
    let registry = tx.registry();
    let descriptor = registry.entity(entity)?;
    let record = create_row(tx, &registry, descriptor, data, None)?;
    log::debug!("staged create {entity} {}", record.id());
    Ok(record)
}

pub fn create_many(
    tx: &mut Transaction,
    entity: &str,
    data: &[WriteData],
    skip_duplicates: bool,
) -> Result<BatchResult> {
    let registry = tx.registry();
    let descriptor = registry.entity(entity)?;
    if data.iter().any(|d| !d.relations.is_empty()) {
        return Err(SkillDbError::Validation(format!(
            "createMany on {entity} does not take nested relation writes"
        )));
    }

    let mut count = 0;
    for item in data {
        if !skip_duplicates {
            create_row(tx, &registry, descriptor, item, None)?;
            count += 1;
            continue;
        }
        match tx.atomic(|tx| create_row(tx, &registry, descriptor, item, None)) {
            Ok(_) => count += 1,
            Err(e) if e.kind() == ErrorKind::UniqueConstraintViolation => {
                log::debug!("createMany skipped duplicate {entity}: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(BatchResult { count })
}

pub fn update(
    tx: &mut Transaction,
    entity: &str,
    key: &UniqueWhere,
    data: &WriteData,
) -> Result<Record> {
    let registry = tx.registry();
    let descriptor = registry.entity(entity)?;
    let existing = find_existing(tx, entity, key)?.ok_or_else(|| not_found(entity, key))?;
    let record = update_row(tx, &registry, descriptor, existing.id(), data)?;
    log::debug!("staged update {entity} {}", record.id());
    Ok(record)
}

pub fn update_many(
    tx: &mut Transaction,
    entity: &str,
    filter: Option<&Filter>,
    data: &WriteData,
    limit: Option<usize>,
) -> Result<BatchResult> {
    let registry = tx.registry();
    let descriptor = registry.entity(entity)?;
    if !data.relations.is_empty() {
        return Err(SkillDbError::Validation(format!(
            "updateMany on {entity} does not take nested relation writes"
        )));
    }
    let compiled = CompiledFilter::compile_opt(&registry, entity, filter)?;

    let mut count = 0;
    for id in matching_ids(tx, entity, &compiled)? {
        if limit.is_some_and(|l| count as usize >= l) {
            break;
        }
        if !still_matches(tx, entity, &id, &compiled)? {
            continue;
        }
        update_row(tx, &registry, descriptor, &id, data)?;
        count += 1;
    }
    Ok(BatchResult { count })
}

pub fn upsert(
    tx: &mut Transaction,
    entity: &str,
    key: &UniqueWhere,
    create: &WriteData,
    update: &WriteData,
) -> Result<Record> {
    let registry = tx.registry();
    let descriptor = registry.entity(entity)?;
    let key = key.resolve(descriptor)?;

    // Hold the key so a concurrent upsert of the same key waits for us
    tx.lock(key_lock(descriptor, &key)?)?;
    match find_existing(tx, entity, &key)? {
        Some(existing) => update_row(tx, &registry, descriptor, existing.id(), update),
        None => {
            create_row(tx, &registry, descriptor, &with_key(create, &key), None)
        }
    }
}

pub fn delete(tx: &mut Transaction, entity: &str, key: &UniqueWhere) -> Result<Record> {
    let registry = tx.registry();
    let existing = find_existing(tx, entity, key)?.ok_or_else(|| not_found(entity, key))?;
    let record = delete_row(tx, &registry, entity, existing.id())?;
    log::debug!("staged delete {entity} {}", record.id());
    Ok(record)
}

pub fn delete_many(
    tx: &mut Transaction,
    entity: &str,
    filter: Option<&Filter>,
    limit: Option<usize>,
) -> Result<BatchResult> {
    let registry = tx.registry();
    let compiled = CompiledFilter::compile_opt(&registry, entity, filter)?;

    let mut count = 0;
    for id in matching_ids(tx, entity, &compiled)? {
        if limit.is_some_and(|l| count as usize >= l) {
            break;
        }
        // Rows removed by an earlier cascade in this batch are skipped
        if !still_matches(tx, entity, &id, &compiled)? {
            continue;
        }
        delete_row(tx, &registry, entity, &id)?;
        count += 1;
    }
    Ok(BatchResult { count })
}

fn not_found(entity: &str, key: &UniqueWhere) -> SkillDbError {
    SkillDbError::NotFound {
        entity: entity.to_string(),
        key: key.to_string(),
    }
}

fn find_existing(tx: &Transaction, entity: &str, key: &UniqueWhere) -> Result<Option<Record>> {
    let view = tx.latest_view()?;
    find_unique_record(&view, entity, key)
}

fn matching_ids(tx: &Transaction, entity: &str, filter: &CompiledFilter) -> Result<Vec<String>> {
    let view = tx.latest_view()?;
    let mut ids = Vec::new();
    for record in view.scan(entity, filter.equality_hint())? {
        if filter.matches(&record, &view)? {
            ids.push(record.id().to_string());
        }
    }
    Ok(ids)
}

/// Lock a row found by a multi-row scan and re-check the filter against its
/// locked state.
fn still_matches(
    tx: &mut Transaction,
    entity: &str,
    id: &str,
    filter: &CompiledFilter,
) -> Result<bool> {
    let Some(current) = tx.lock_row(entity, id)? else {
        return Ok(false);
    };
    let view = tx.latest_view()?;
    filter.matches(&current, &view)
}

/// Lock guarding one value of a unique key.
fn key_lock(entity: &EntityDescriptor, key: &UniqueWhere) -> Result<LockKey> {
    if key.is_id() {
        let id = key.fields()[0].1.as_str().unwrap_or_default();
        return Ok(LockKey::row(&entity.name, id));
    }
    let names: Vec<&str> = key.fields().iter().map(|(n, _)| n.as_str()).collect();
    let constraint = entity.unique_constraint_for(&names).ok_or_else(|| {
        SkillDbError::Configuration(format!(
            "({}) is not a unique key of {}",
            names.join(", "),
            entity.name
        ))
    })?;
    let values: Vec<&Value> = constraint
        .fields
        .iter()
        .filter_map(|f| key.fields().iter().find(|(n, _)| n == f).map(|(_, v)| v))
        .collect();
    let composite = composite_key(&values).unwrap_or_default();
    Ok(LockKey::unique(&entity.name, &constraint.name, composite))
}

fn create_row(
    tx: &mut Transaction,
    registry: &SchemaRegistry,
    entity: &EntityDescriptor,
    data: &WriteData,
    parent: Option<(&str, &str)>,
) -> Result<Record> {
    for (name, writes) in &data.relations {
        entity.relation(name)?;
        if let Some(write) = writes.iter().find(|w| !w.allowed_in_create()) {
            return Err(SkillDbError::Validation(format!(
                "'{}' through {}.{name} is only allowed in updates",
                write.name(),
                entity.name
            )));
        }
    }

    let mut fields = data.fields.clone();
    if let Some((fk, parent_id)) = parent {
        fields.insert(fk.to_string(), FieldUpdate::Set(Value::from(parent_id)));
    }
    for (name, writes) in &data.relations {
        let relation = entity.relation(name)?;
        if !relation.is_owning() {
            continue;
        }
        for write in writes {
            apply_parent_change(
                &mut fields,
                relation,
                resolve_parent(tx, registry, relation, write, &Value::Null)?,
            );
        }
    }

    let record = prepare_create(entity, &fields)?;
    insert_row(tx, entity, record.clone())?;
    write_children(tx, registry, entity, record.id(), data)?;
    Ok(record)
}

fn update_row(
    tx: &mut Transaction,
    registry: &SchemaRegistry,
    entity: &EntityDescriptor,
    id: &str,
    data: &WriteData,
) -> Result<Record> {
    let current = tx
        .lock_row(&entity.name, id)?
        .ok_or_else(|| not_found(&entity.name, &UniqueWhere::id(id)))?;

    let mut fields = data.fields.clone();
    for (name, writes) in &data.relations {
        let relation = entity.relation(name)?;
        if !relation.is_owning() {
            continue;
        }
        for write in writes {
            let current_fk = current.get(relation.foreign_key()).clone();
            apply_parent_change(
                &mut fields,
                relation,
                resolve_parent(tx, registry, relation, write, &current_fk)?,
            );
        }
    }

    let mut next = current.clone();
    apply_updates(entity, &mut next, &fields)?;
    lock_unique_keys(tx, entity, &next, Some(&current))?;
    check_parents(tx, entity, &next)?;
    tx.stage(&entity.name, id, Some(next.clone()));
    write_children(tx, registry, entity, id, data)?;
    Ok(next)
}

fn delete_row(
    tx: &mut Transaction,
    registry: &SchemaRegistry,
    entity: &str,
    id: &str,
) -> Result<Record> {
    let current = tx
        .lock_row(entity, id)?
        .ok_or_else(|| not_found(entity, &UniqueWhere::id(id)))?;
    let plan = {
        let view = tx.latest_view()?;
        plan_delete(&view, entity, id)?
    };
    plan.check()?;

    for (e, i) in &plan.deletes {
        tx.lock_row(e, i)?;
    }
    for (e, i, fk) in &plan.nullify {
        let Some(mut row) = tx.lock_row(e, i)? else {
            continue;
        };
        let mut cleared = BTreeMap::new();
        cleared.insert(fk.clone(), FieldUpdate::Set(Value::Null));
        apply_updates(registry.entity(e)?, &mut row, &cleared)?;
        tx.stage(e, i, Some(row));
    }
    for (e, i) in &plan.deletes {
        tx.stage(e, i, None);
    }
    if plan.deletes.len() > 1 {
        log::debug!(
            "delete of {entity} {id} cascades to {} rows",
            plan.deletes.len() - 1
        );
    }
    Ok(current)
}

fn insert_row(tx: &mut Transaction, entity: &EntityDescriptor, record: Record) -> Result<()> {
    let id = record.id().to_string();
    if tx.lock_row(&entity.name, &id)?.is_some() {
        return Err(SkillDbError::unique(&entity.name, ID_FIELD));
    }
    lock_unique_keys(tx, entity, &record, None)?;
    check_parents(tx, entity, &record)?;
    tx.stage(&entity.name, &id, Some(record));
    Ok(())
}

/// Lock every non-id unique key `record` takes and fail when another row
/// already holds one. Keys unchanged from `previous` are skipped.
fn lock_unique_keys(
    tx: &mut Transaction,
    entity: &EntityDescriptor,
    record: &Record,
    previous: Option<&Record>,
) -> Result<()> {
    for constraint in &entity.unique_constraints {
        if constraint.fields == [ID_FIELD] {
            continue;
        }
        let values: Vec<&Value> = constraint.fields.iter().map(|f| record.get(f)).collect();
        if let Some(previous) = previous {
            if constraint.fields.iter().all(|f| previous.get(f) == record.get(f)) {
                continue;
            }
        }
        let Some(key) = composite_key(&values) else {
            continue;
        };
        tx.lock(LockKey::unique(&entity.name, &constraint.name, key))?;

        let taken = {
            let view = tx.latest_view()?;
            let first = constraint.fields[0].as_str();
            view.scan(&entity.name, Some((first, record.get(first))))?
                .iter()
                .any(|other| {
                    other.id() != record.id()
                        && constraint
                            .fields
                            .iter()
                            .all(|f| other.get(f).matches(record.get(f), false))
                })
        };
        if taken {
            return Err(SkillDbError::unique(&entity.name, &constraint.name));
        }
    }
    Ok(())
}

fn check_parents(tx: &Transaction, entity: &EntityDescriptor, record: &Record) -> Result<()> {
    let view = tx.latest_view()?;
    for relation in entity.owning_relations() {
        let fk = relation.foreign_key();
        if let Some(parent) = record.get(fk).as_str() {
            if view.get(&relation.target, parent)?.is_none() {
                return Err(SkillDbError::integrity(&entity.name, fk));
            }
        }
    }
    Ok(())
}

fn apply_parent_change(
    fields: &mut BTreeMap<String, FieldUpdate>,
    relation: &RelationDescriptor,
    change: ParentChange,
) {
    let fk = relation.foreign_key().to_string();
    match change {
        ParentChange::Point(id) => {
            fields.insert(fk, FieldUpdate::Set(Value::String(id)));
        }
        ParentChange::Clear => {
            fields.insert(fk, FieldUpdate::Set(Value::Null));
        }
        ParentChange::Keep => {}
    }
}

/// Run one nested write through an owning (to-one) relation. The parent
/// row is written before the row holding the key.
fn resolve_parent(
    tx: &mut Transaction,
    registry: &SchemaRegistry,
    relation: &RelationDescriptor,
    write: &NestedWrite,
    current_fk: &Value,
) -> Result<ParentChange> {
    let target = registry.entity(&relation.target)?;
    let fk_field = registry.field_type(&relation.entity, relation.foreign_key())?;
    let current = current_fk.as_str().map(str::to_string);

    match write {
        NestedWrite::Create(data) => {
            let parent = create_row(tx, registry, target, data, None)?;
            Ok(ParentChange::Point(parent.id().to_string()))
        }
        NestedWrite::Connect(key) => {
            let parent = find_existing(tx, &target.name, key)?
                .ok_or_else(|| not_found(&target.name, key))?;
            Ok(ParentChange::Point(parent.id().to_string()))
        }
        NestedWrite::ConnectOrCreate { key, create } => {
            let key = key.resolve(target)?;
            if let Some(parent) = find_existing(tx, &target.name, &key)? {
                return Ok(ParentChange::Point(parent.id().to_string()));
            }
            let parent = create_row(tx, registry, target, &with_key(create, &key), None)?;
            Ok(ParentChange::Point(parent.id().to_string()))
        }
        NestedWrite::Update { data, .. } => {
            let id = current.ok_or_else(|| no_related(relation))?;
            update_row(tx, registry, target, &id, data)?;
            Ok(ParentChange::Keep)
        }
        NestedWrite::Upsert { create, update } => match current {
            Some(id) => {
                update_row(tx, registry, target, &id, update)?;
                Ok(ParentChange::Keep)
            }
            None => {
                let parent = create_row(tx, registry, target, create, None)?;
                Ok(ParentChange::Point(parent.id().to_string()))
            }
        },
        NestedWrite::Disconnect(_) if fk_field.nullable => Ok(ParentChange::Clear),
        NestedWrite::Disconnect(_) => Err(SkillDbError::Validation(format!(
            "Cannot disconnect {}.{}: '{}' is required",
            relation.entity,
            relation.name,
            relation.foreign_key()
        ))),
        NestedWrite::Delete(_) => Err(SkillDbError::Validation(format!(
            "Cannot delete through {}.{}; delete the {} directly",
            relation.entity, relation.name, relation.target
        ))),
        NestedWrite::CreateMany { .. } => Err(to_one_only(relation, write)),
    }
}

/// Run the nested writes of `data` that go through inverse relations, once
/// the row `parent_id` is staged.
fn write_children(
    tx: &mut Transaction,
    registry: &SchemaRegistry,
    entity: &EntityDescriptor,
    parent_id: &str,
    data: &WriteData,
) -> Result<()> {
    for (name, writes) in &data.relations {
        let relation = entity.relation(name)?;
        if relation.is_owning() {
            continue;
        }
        for write in writes {
            write_child(tx, registry, relation, parent_id, write)?;
        }
    }
    Ok(())
}

fn write_child(
    tx: &mut Transaction,
    registry: &SchemaRegistry,
    relation: &RelationDescriptor,
    parent_id: &str,
    write: &NestedWrite,
) -> Result<()> {
    let target = registry.entity(&relation.target)?;
    let fk = relation.foreign_key();
    let link = Some((fk, parent_id));

    match write {
        NestedWrite::Create(data) => {
            create_row(tx, registry, target, data, link)?;
        }
        NestedWrite::CreateMany {
            data,
            skip_duplicates,
        } => {
            if !relation.is_to_many() {
                return Err(to_one_only(relation, write));
            }
            for item in data {
                if !skip_duplicates {
                    create_row(tx, registry, target, item, link)?;
                    continue;
                }
                match tx.atomic(|tx| create_row(tx, registry, target, item, link)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::UniqueConstraintViolation => {}
                    Err(e) => return Err(e),
                }
            }
        }
        NestedWrite::Connect(key) => {
            let child = find_existing(tx, &target.name, key)?
                .ok_or_else(|| not_found(&target.name, key))?;
            relink(tx, registry, target, child.id(), fk, Value::from(parent_id))?;
        }
        NestedWrite::ConnectOrCreate { key, create } => {
            let key = key.resolve(target)?;
            match find_existing(tx, &target.name, &key)? {
                Some(child) => relink(tx, registry, target, child.id(), fk, Value::from(parent_id))?,
                None => {
                    create_row(tx, registry, target, &with_key(create, &key), link)?;
                }
            }
        }
        NestedWrite::Update { filter, data } => {
            let ids = children(tx, registry, relation, parent_id, filter.as_ref())?;
            if ids.is_empty() && !relation.is_to_many() {
                return Err(no_related(relation));
            }
            for id in ids {
                update_row(tx, registry, target, &id, data)?;
            }
        }
        NestedWrite::Upsert { create, update } => {
            if relation.is_to_many() {
                return Err(SkillDbError::Validation(format!(
                    "upsert through {}.{} needs a to-one relation",
                    relation.entity, relation.name
                )));
            }
            match children(tx, registry, relation, parent_id, None)?.first() {
                Some(id) => {
                    update_row(tx, registry, target, id, update)?;
                }
                None => {
                    create_row(tx, registry, target, create, link)?;
                }
            }
        }
        NestedWrite::Delete(filter) => {
            let ids = children(tx, registry, relation, parent_id, filter.as_ref())?;
            if ids.is_empty() && !relation.is_to_many() {
                return Err(no_related(relation));
            }
            for id in ids {
                // A cascade from an earlier sibling may already have removed it
                if tx.lock_row(&target.name, &id)?.is_some() {
                    delete_row(tx, registry, &target.name, &id)?;
                }
            }
        }
        NestedWrite::Disconnect(filter) => {
            if !target.field(fk)?.nullable {
                return Err(SkillDbError::Validation(format!(
                    "Cannot disconnect {}.{}: '{}.{fk}' is required",
                    relation.entity, relation.name, relation.target
                )));
            }
            for id in children(tx, registry, relation, parent_id, filter.as_ref())? {
                relink(tx, registry, target, &id, fk, Value::Null)?;
            }
        }
    }
    Ok(())
}

/// Ids of the rows related to `parent_id` through an inverse relation.
fn children(
    tx: &Transaction,
    registry: &SchemaRegistry,
    relation: &RelationDescriptor,
    parent_id: &str,
    filter: Option<&Filter>,
) -> Result<Vec<String>> {
    let compiled = CompiledFilter::compile_opt(registry, &relation.target, filter)?;
    let view = tx.latest_view()?;
    let key = Value::from(parent_id);
    let mut ids = Vec::new();
    for record in view.scan(&relation.target, Some((relation.foreign_key(), &key)))? {
        if compiled.matches(&record, &view)? {
            ids.push(record.id().to_string());
        }
    }
    Ok(ids)
}

/// Point the foreign key `fk` of an existing row at a new parent, or clear it.
fn relink(
    tx: &mut Transaction,
    registry: &SchemaRegistry,
    entity: &EntityDescriptor,
    id: &str,
    fk: &str,
    parent: Value,
) -> Result<()> {
    update_row(tx, registry, entity, id, &WriteData::new().set(fk, parent))?;
    Ok(())
}

/// A create payload with the fields of `key` filled in where absent.
fn with_key(create: &WriteData, key: &UniqueWhere) -> WriteData {
    let mut data = create.clone();
    for (field, value) in key.fields() {
        data.fields
            .entry(field.clone())
            .or_insert_with(|| FieldUpdate::Set(value.clone()));
    }
    data
}

fn no_related(relation: &RelationDescriptor) -> SkillDbError {
    SkillDbError::NotFound {
        entity: relation.target.clone(),
        key: format!("{}.{}", relation.entity, relation.name),
    }
}

fn to_one_only(relation: &RelationDescriptor, write: &NestedWrite) -> SkillDbError {
    SkillDbError::Validation(format!(
        "'{}' through {}.{} needs a to-many relation",
        write.name(),
        relation.entity,
        relation.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FindManyArgs;
    use crate::relation::Include;
    use crate::store::Store;
    use pretty_assertions::assert_eq;

    fn skill(name: &str, score: i64) -> WriteData {
        WriteData::new()
            .set("name", name)
            .set("level", "beginner")
            .set("source", "manual")
            .set("category", "backend")
            .set("levelScore", score)
    }

    fn count(store: &Store, entity: &str) -> u64 {
        store.count(entity, &FindManyArgs::new()).unwrap()
    }

    fn user_with_set(store: &Store, email: &str) -> (String, String) {
        let user = store
            .create(
                "User",
                WriteData::new()
                    .set("email", email)
                    .create("skillSets", WriteData::new()),
            )
            .unwrap();
        let set = store
            .find_first(
                "SkillSet",
                &FindManyArgs::new().filter(Filter::eq("userId", user.id())),
            )
            .unwrap()
            .unwrap();
        (user.id().to_string(), set.id().to_string())
    }

    #[test]
    fn test_nested_create_links_children() {
        let store = Store::in_memory().unwrap();
        let created = store
            .create(
                "User",
                WriteData::new().set("email", "a@x.com").create(
                    "skillSets",
                    WriteData::new()
                        .create("skills", skill("Go", 60))
                        .nested(
                            "skills",
                            NestedWrite::CreateMany {
                                data: vec![skill("SQL", 40), skill("Rust", 90)],
                                skip_duplicates: false,
                            },
                        ),
                ),
            )
            .unwrap();

        let row = store
            .find_unique(
                "User",
                crate::query::FindUniqueArgs::new(UniqueWhere::id(created.id())).include(
                    Include::new().with(
                        "skillSets",
                        FindManyArgs::new().include(Include::new().relation("skills")),
                    ),
                ),
            )
            .unwrap()
            .unwrap();
        let sets = row.many("skillSets");
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].many("skills").len(), 3);
        for skill in sets[0].many("skills") {
            assert_eq!(skill.get("skillSetId"), &Value::from(sets[0].id()));
        }
    }

    #[test]
    fn test_failed_nested_create_stages_nothing() {
        let store = Store::in_memory().unwrap();
        let err = store
            .create(
                "User",
                WriteData::new()
                    .set("email", "a@x.com")
                    .create("profile", WriteData::new())
                    .create("profile", WriteData::new()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueConstraintViolation);
        assert_eq!(count(&store, "User"), 0);
        assert_eq!(count(&store, "Profile"), 0);
    }

    #[test]
    fn test_connect_through_owning_relation() {
        let store = Store::in_memory().unwrap();
        let (_, set_id) = user_with_set(&store, "a@x.com");
        let created = store
            .create(
                "Skill",
                skill("Go", 50).connect("skillSet", UniqueWhere::id(set_id.as_str())),
            )
            .unwrap();
        assert_eq!(created.get("skillSetId"), &Value::from(set_id.as_str()));

        let err = store
            .create(
                "Skill",
                skill("Go", 50).connect("skillSet", UniqueWhere::id("missing")),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = store
            .create("Skill", skill("Go", 50).set("skillSetId", "missing"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReferentialIntegrity);
    }

    #[test]
    fn test_connect_moves_child_between_parents() {
        let store = Store::in_memory().unwrap();
        let (_, first) = user_with_set(&store, "a@x.com");
        let (_, second) = user_with_set(&store, "b@x.com");
        let go = store
            .create("Skill", skill("Go", 50).set("skillSetId", first.as_str()))
            .unwrap();

        store
            .update(
                "SkillSet",
                &UniqueWhere::id(second.as_str()),
                WriteData::new().connect("skills", UniqueWhere::id(go.id())),
            )
            .unwrap();
        let moved = store
            .find_unique_or_throw("Skill", UniqueWhere::id(go.id()))
            .unwrap();
        assert_eq!(moved.get("skillSetId"), &Value::from(second.as_str()));
    }

    #[test]
    fn test_nested_update_with_filter() {
        let store = Store::in_memory().unwrap();
        let (_, set_id) = user_with_set(&store, "a@x.com");
        for (name, score) in [("Go", 40), ("SQL", 70), ("CSS", 20)] {
            store
                .create("Skill", skill(name, score).set("skillSetId", set_id.as_str()))
                .unwrap();
        }

        store
            .update(
                "SkillSet",
                &UniqueWhere::id(set_id.as_str()),
                WriteData::new().nested(
                    "skills",
                    NestedWrite::Update {
                        filter: Some(Filter::lt("levelScore", 50)),
                        data: WriteData::new().increment("levelScore", 5).set("verified", true),
                    },
                ),
            )
            .unwrap();

        let verified = store
            .find_many(
                "Skill",
                &FindManyArgs::new()
                    .filter(Filter::eq("verified", true))
                    .order_by(crate::query::OrderBy::asc("levelScore")),
            )
            .unwrap();
        let scores: Vec<&Value> = verified.iter().map(|r| r.get("levelScore")).collect();
        assert_eq!(scores, vec![&Value::Int(25), &Value::Int(45)]);
    }

    #[test]
    fn test_nested_delete_and_required_disconnect() {
        let store = Store::in_memory().unwrap();
        let (user_id, set_id) = user_with_set(&store, "a@x.com");
        store
            .create("Skill", skill("Go", 40).set("skillSetId", set_id.as_str()))
            .unwrap();
        let key = UniqueWhere::id(user_id.as_str());

        let err = store
            .update(
                "User",
                &key,
                WriteData::new().nested("skillSets", NestedWrite::Disconnect(None)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = store
            .update("Skill", &UniqueWhere::field("name", "Go"), WriteData::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        store
            .update(
                "User",
                &key,
                WriteData::new().nested("skillSets", NestedWrite::Delete(None)),
            )
            .unwrap();
        assert_eq!(count(&store, "SkillSet"), 0);
        assert_eq!(count(&store, "Skill"), 0);
        assert_eq!(count(&store, "User"), 1);
    }

    #[test]
    fn test_delete_through_owning_relation_is_rejected() {
        let store = Store::in_memory().unwrap();
        let (_, set_id) = user_with_set(&store, "a@x.com");
        let go = store
            .create("Skill", skill("Go", 40).set("skillSetId", set_id.as_str()))
            .unwrap();
        let err = store
            .update(
                "Skill",
                &UniqueWhere::id(go.id()),
                WriteData::new().nested("skillSet", NestedWrite::Delete(None)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(count(&store, "SkillSet"), 1);
    }

    #[test]
    fn test_update_only_operations_rejected_in_create() {
        let store = Store::in_memory().unwrap();
        let err = store
            .create(
                "User",
                WriteData::new()
                    .set("email", "a@x.com")
                    .nested("skillSets", NestedWrite::Delete(None)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_update_into_taken_unique_value() {
        let store = Store::in_memory().unwrap();
        store
            .create("User", WriteData::new().set("email", "a@x.com"))
            .unwrap();
        let b = store
            .create("User", WriteData::new().set("email", "b@x.com"))
            .unwrap();
        let err = store
            .update(
                "User",
                &UniqueWhere::id(b.id()),
                WriteData::new().set("email", "a@x.com"),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueConstraintViolation);

        let err = store
            .update(
                "User",
                &UniqueWhere::field("email", "nobody@x.com"),
                WriteData::new().set("name", "X"),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_create_many_skips_duplicates() {
        let store = Store::in_memory().unwrap();
        store
            .create("User", WriteData::new().set("email", "a@x.com"))
            .unwrap();
        let rows = ["a@x.com", "b@x.com", "b@x.com", "c@x.com"]
            .iter()
            .map(|email| WriteData::new().set("email", *email))
            .collect::<Vec<_>>();

        let err = store.create_many("User", rows.clone(), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueConstraintViolation);
        assert_eq!(count(&store, "User"), 1);

        let result = store.create_many("User", rows, true).unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(count(&store, "User"), 3);
    }

    #[test]
    fn test_update_many_and_delete_many_limits() {
        let store = Store::in_memory().unwrap();
        let (_, set_id) = user_with_set(&store, "a@x.com");
        for (name, score) in [("Go", 40), ("SQL", 70), ("CSS", 20), ("Vue", 55)] {
            store
                .create("Skill", skill(name, score).set("skillSetId", set_id.as_str()))
                .unwrap();
        }

        let filter = Filter::gte("levelScore", 40);
        let updated = store
            .update_many("Skill", Some(&filter), WriteData::new().set("verified", true), Some(2))
            .unwrap();
        assert_eq!(updated.count, 2);
        let all = store
            .update_many("Skill", None, WriteData::new().multiply("levelScore", 2), None)
            .unwrap();
        assert_eq!(all.count, 4);

        let removed = store
            .delete_many("Skill", Some(&Filter::eq("verified", false)), None)
            .unwrap();
        assert_eq!(removed.count, 2);
        assert_eq!(
            store.delete_many("Skill", None, Some(0)).unwrap().count,
            0
        );
        assert_eq!(count(&store, "Skill"), 2);
    }

    #[test]
    fn test_upsert_by_unique_field() {
        let store = Store::in_memory().unwrap();
        let key = UniqueWhere::field("githubId", "octo");
        let created = store
            .upsert(
                "User",
                &key,
                WriteData::new().set("email", "octo@x.com"),
                WriteData::new().set("name", "Octo"),
            )
            .unwrap();
        assert_eq!(created.get("githubId"), &Value::from("octo"));
        assert_eq!(created.get("name"), &Value::Null);

        let updated = store
            .upsert(
                "User",
                &key,
                WriteData::new().set("email", "other@x.com"),
                WriteData::new().set("name", "Octo"),
            )
            .unwrap();
        assert_eq!(updated.id(), created.id());
        assert_eq!(updated.get("name"), &Value::from("Octo"));

        let err = store
            .upsert(
                "User",
                &UniqueWhere::field("name", "Octo"),
                WriteData::new(),
                WriteData::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_profile_upsert_through_user() {
        let store = Store::in_memory().unwrap();
        let user = store
            .create("User", WriteData::new().set("email", "a@x.com"))
            .unwrap();
        let key = UniqueWhere::id(user.id());
        let upsert = || {
            WriteData::new().nested(
                "profile",
                NestedWrite::Upsert {
                    create: WriteData::new().set("githubUrl", "https://github.com/a"),
                    update: WriteData::new().push("additionalSkills", "rust"),
                },
            )
        };

        store.update("User", &key, upsert()).unwrap();
        store.update("User", &key, upsert()).unwrap();
        let profile = store.find_first("Profile", &FindManyArgs::new()).unwrap().unwrap();
        assert_eq!(profile.get("additionalSkills"), &Value::from(vec!["rust"]));
        assert_eq!(count(&store, "Profile"), 1);
    }
}
