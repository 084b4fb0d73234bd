use super::FieldUpdate;
use crate::error::{Result, SkillDbError};
use crate::record::Record;
use crate::schema::{DefaultValue, EntityDescriptor, FieldDescriptor, FieldType, ID_FIELD};
use crate::value::Value;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::BTreeMap;

/// Current time at the precision rows are stamped with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Modification stamp for a row last stamped at `previous`: the current
/// time, but always strictly later than `previous`.
pub fn next_timestamp(previous: &Value) -> DateTime<Utc> {
    let now = now();
    match previous.as_datetime() {
        Some(prev) if *prev >= now => *prev + Duration::microseconds(1),
        _ => now,
    }
}

/// Build a complete new row from a create payload: validate and coerce the
/// given fields, then fill ids, stamps and defaults.
pub fn prepare_create(
    entity: &EntityDescriptor,
    fields: &BTreeMap<String, FieldUpdate>,
) -> Result<Record> {
    let mut record = Record::new();
    for (name, update) in fields {
        let field = entity.field(name)?;
        let FieldUpdate::Set(value) = update else {
            return Err(SkillDbError::Validation(format!(
                "'{}' on {}.{name} is only allowed in updates",
                update.name(),
                entity.name
            )));
        };
        if field.is_managed() {
            return Err(managed(entity, name));
        }
        if field.primary && value.is_null() {
            continue;
        }
        record.set(name.clone(), field.coerce(&entity.name, value.clone())?);
    }

    let stamp = now();
    for field in entity.fields.values() {
        if record.fields().contains_key(&field.name) {
            continue;
        }
        let value = if field.primary {
            Value::String(entity.generate_id())
        } else if field.updated_at {
            Value::DateTime(stamp)
        } else {
            match &field.default {
                Some(DefaultValue::Now) => Value::DateTime(stamp),
                Some(DefaultValue::Literal(value)) => value.clone(),
                None if field.list => Value::List(Vec::new()),
                None if field.nullable => Value::Null,
                None => {
                    return Err(SkillDbError::Validation(format!(
                        "Missing required field '{}.{}'",
                        entity.name, field.name
                    )))
                }
            }
        };
        record.set(field.name.clone(), value);
    }
    Ok(record)
}

/// Apply field updates to `record` in place and refresh its modification
/// stamps.
pub fn apply_updates(
    entity: &EntityDescriptor,
    record: &mut Record,
    fields: &BTreeMap<String, FieldUpdate>,
) -> Result<()> {
    for (name, update) in fields {
        let field = entity.field(name)?;
        if name == ID_FIELD {
            return Err(SkillDbError::Validation(format!(
                "The id of {} cannot be changed",
                entity.name
            )));
        }
        if field.is_managed() {
            return Err(managed(entity, name));
        }
        let current = record.get(name).clone();
        let next = match update {
            FieldUpdate::Set(value) => field.coerce(&entity.name, value.clone())?,
            FieldUpdate::Push(value) => push(entity, field, current, value)?,
            op => arithmetic(entity, field, current, op)?,
        };
        record.set(name.clone(), next);
    }

    for field in entity.fields.values().filter(|f| f.updated_at) {
        let stamp = next_timestamp(record.get(&field.name));
        record.set(field.name.clone(), stamp);
    }
    Ok(())
}

fn managed(entity: &EntityDescriptor, field: &str) -> SkillDbError {
    SkillDbError::Validation(format!(
        "'{}.{field}' is maintained by the engine and cannot be written",
        entity.name
    ))
}

fn push(
    entity: &EntityDescriptor,
    field: &FieldDescriptor,
    current: Value,
    value: &Value,
) -> Result<Value> {
    if !field.list {
        return Err(SkillDbError::Validation(format!(
            "push needs a list field, '{}.{}' is a {}",
            entity.name,
            field.name,
            field.ty.name()
        )));
    }
    let mut items = match current {
        Value::List(items) => items,
        _ => Vec::new(),
    };
    match value {
        Value::List(more) => {
            for item in more {
                items.push(field.coerce_element(&entity.name, item.clone())?);
            }
        }
        single => items.push(field.coerce_element(&entity.name, single.clone())?),
    }
    Ok(Value::List(items))
}

fn arithmetic(
    entity: &EntityDescriptor,
    field: &FieldDescriptor,
    current: Value,
    op: &FieldUpdate,
) -> Result<Value> {
    let operand = match op {
        FieldUpdate::Increment(v)
        | FieldUpdate::Decrement(v)
        | FieldUpdate::Multiply(v)
        | FieldUpdate::Divide(v) => v,
        FieldUpdate::Set(_) | FieldUpdate::Push(_) => {
            return Err(SkillDbError::Validation(format!(
                "'{}' is not an arithmetic update",
                op.name()
            )))
        }
    };
    if !field.is_numeric() {
        return Err(SkillDbError::type_mismatch(
            &entity.name,
            &field.name,
            format!("{} needs a numeric field", op.name()),
        ));
    }
    let operand = field.coerce_element(&entity.name, operand.clone())?;
    if current.is_null() {
        return Ok(Value::Null);
    }
    let overflow = || {
        SkillDbError::Validation(format!(
            "{} overflows '{}.{}'",
            op.name(),
            entity.name,
            field.name
        ))
    };
    let by_zero = || {
        SkillDbError::Validation(format!(
            "Division by zero on '{}.{}'",
            entity.name, field.name
        ))
    };

    match field.ty {
        FieldType::Int => {
            let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) else {
                return Err(SkillDbError::type_mismatch(
                    &entity.name,
                    &field.name,
                    format!("stored value {current} is not an int"),
                ));
            };
            let result = match op {
                FieldUpdate::Increment(_) => a.checked_add(b),
                FieldUpdate::Decrement(_) => a.checked_sub(b),
                FieldUpdate::Multiply(_) => a.checked_mul(b),
                _ if b == 0 => return Err(by_zero()),
                _ => a.checked_div(b),
            };
            result.map(Value::Int).ok_or_else(overflow)
        }
        _ => {
            let (Some(a), Some(b)) = (current.as_f64(), operand.as_f64()) else {
                return Err(SkillDbError::type_mismatch(
                    &entity.name,
                    &field.name,
                    format!("stored value {current} is not a float"),
                ));
            };
            let result = match op {
                FieldUpdate::Increment(_) => a + b,
                FieldUpdate::Decrement(_) => a - b,
                FieldUpdate::Multiply(_) => a * b,
                _ if b == 0.0 => return Err(by_zero()),
                _ => a / b,
            };
            if result.is_finite() {
                Ok(Value::Float(result))
            } else {
                Err(overflow())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::SchemaRegistry;
    use pretty_assertions::assert_eq;

    fn sets(pairs: Vec<(&str, Value)>) -> BTreeMap<String, FieldUpdate> {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), FieldUpdate::Set(v)))
            .collect()
    }

    fn skill_fields() -> BTreeMap<String, FieldUpdate> {
        sets(vec![
            ("name", "Rust".into()),
            ("level", "advanced".into()),
            ("source", "github".into()),
            ("category", "backend".into()),
            ("levelScore", 80.into()),
            ("skillSetId", "s1".into()),
        ])
    }

    #[test]
    fn test_prepare_create_fills_defaults_and_stamps() {
        let registry = SchemaRegistry::builtin().unwrap();
        let skill = registry.entity("Skill").unwrap();
        let record = prepare_create(skill, &skill_fields()).unwrap();

        assert!(!record.id().is_empty());
        assert_eq!(record.get("verified"), &Value::Bool(false));
        assert_eq!(record.get("description"), &Value::Null);
        assert_eq!(record.get("createdAt"), record.get("updatedAt"));
        assert!(record.get("createdAt").as_datetime().is_some());

        let profile = registry.entity("Profile").unwrap();
        let record = prepare_create(profile, &sets(vec![("userId", "u1".into())])).unwrap();
        assert_eq!(record.get("additionalSkills"), &Value::List(Vec::new()));
    }

    #[test]
    fn test_prepare_create_rejects_bad_payloads() {
        let registry = SchemaRegistry::builtin().unwrap();
        let skill = registry.entity("Skill").unwrap();

        let mut missing = skill_fields();
        missing.remove("level");
        let err = prepare_create(skill, &missing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut stamped = skill_fields();
        stamped.insert("createdAt".into(), FieldUpdate::Set(Value::DateTime(now())));
        assert_eq!(prepare_create(skill, &stamped).unwrap_err().kind(), ErrorKind::Validation);

        let mut wrong = skill_fields();
        wrong.insert("levelScore".into(), FieldUpdate::Set("high".into()));
        assert_eq!(prepare_create(skill, &wrong).unwrap_err().kind(), ErrorKind::TypeMismatch);

        let mut incremented = skill_fields();
        incremented.insert("levelScore".into(), FieldUpdate::Increment(1.into()));
        assert_eq!(
            prepare_create(skill, &incremented).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_apply_updates_arithmetic_and_push() {
        let registry = SchemaRegistry::builtin().unwrap();
        let skill = registry.entity("Skill").unwrap();
        let mut record = prepare_create(skill, &skill_fields()).unwrap();
        let created = record.get("updatedAt").clone();

        let mut ops = BTreeMap::new();
        ops.insert("levelScore".to_string(), FieldUpdate::Increment(5.into()));
        apply_updates(skill, &mut record, &ops).unwrap();
        assert_eq!(record.get("levelScore"), &Value::Int(85));
        assert!(record.get("updatedAt").compare(&created) == Some(std::cmp::Ordering::Greater));

        ops.insert("levelScore".to_string(), FieldUpdate::Divide(0.into()));
        let err = apply_updates(skill, &mut record, &ops).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        ops.clear();
        ops.insert("name".to_string(), FieldUpdate::Multiply(2.into()));
        let err = apply_updates(skill, &mut record, &ops).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let profile = registry.entity("Profile").unwrap();
        let mut record = prepare_create(profile, &sets(vec![("userId", "u1".into())])).unwrap();
        let mut ops = BTreeMap::new();
        ops.insert(
            "additionalSkills".to_string(),
            FieldUpdate::Push(Value::from(vec!["rust", "sql"])),
        );
        apply_updates(profile, &mut record, &ops).unwrap();
        ops.insert("additionalSkills".to_string(), FieldUpdate::Push("go".into()));
        apply_updates(profile, &mut record, &ops).unwrap();
        assert_eq!(record.get("additionalSkills"), &Value::from(vec!["rust", "sql", "go"]));
    }

    #[test]
    fn test_apply_updates_protects_id_and_stamps() {
        let registry = SchemaRegistry::builtin().unwrap();
        let user = registry.entity("User").unwrap();
        let mut record = prepare_create(user, &sets(vec![("email", "a@x.com".into())])).unwrap();

        let err = apply_updates(user, &mut record, &sets(vec![("id", "other".into())])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = apply_updates(user, &mut record, &sets(vec![("updatedAt", Value::DateTime(now()))]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_next_timestamp_is_strictly_later() {
        let future = now() + Duration::seconds(10);
        let next = next_timestamp(&Value::DateTime(future));
        assert_eq!(next, future + Duration::microseconds(1));
        assert!(next_timestamp(&Value::Null) <= now());
    }
}
