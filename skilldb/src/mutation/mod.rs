//! Mutation engine: create, update, upsert and delete with nested writes
//! through declared relations.
//!
//! Every write runs inside a [`Transaction`](crate::transaction::Transaction).
//! Payloads are validated against the schema before anything is staged, and
//! constraint checks run again at commit, so a failed write never leaves a
//! partial result behind.

mod engine;
mod validate;

pub use engine::{create, create_many, delete, delete_many, update, update_many, upsert};
pub use validate::{apply_updates, next_timestamp, prepare_create};

use crate::error::{Result, SkillDbError};
use crate::filter::Filter;
use crate::query::UniqueWhere;
use crate::schema::{EntityDescriptor, SchemaRegistry};
use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;

/// How one field changes.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set(Value),
    /// Append to a list field; a list value appends each element in order.
    Push(Value),
    Increment(Value),
    Decrement(Value),
    Multiply(Value),
    Divide(Value),
}

impl FieldUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            FieldUpdate::Set(_) => "set",
            FieldUpdate::Push(_) => "push",
            FieldUpdate::Increment(_) => "increment",
            FieldUpdate::Decrement(_) => "decrement",
            FieldUpdate::Multiply(_) => "multiply",
            FieldUpdate::Divide(_) => "divide",
        }
    }

    fn from_op(op: &str, value: Value) -> Option<Self> {
        Some(match op {
            "set" => FieldUpdate::Set(value),
            "push" => FieldUpdate::Push(value),
            "increment" => FieldUpdate::Increment(value),
            "decrement" => FieldUpdate::Decrement(value),
            "multiply" => FieldUpdate::Multiply(value),
            "divide" => FieldUpdate::Divide(value),
            _ => return None,
        })
    }
}

/// A write through one relation, nested in a create or update payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedWrite {
    Create(WriteData),
    CreateMany {
        data: Vec<WriteData>,
        skip_duplicates: bool,
    },
    Connect(UniqueWhere),
    ConnectOrCreate {
        key: UniqueWhere,
        create: WriteData,
    },
    /// Update related rows; to-many relations may narrow with a filter.
    Update {
        filter: Option<Filter>,
        data: WriteData,
    },
    Upsert {
        create: WriteData,
        update: WriteData,
    },
    Delete(Option<Filter>),
    /// Clear the foreign key of related rows. Needs a nullable key.
    Disconnect(Option<Filter>),
}

impl NestedWrite {
    pub fn name(&self) -> &'static str {
        match self {
            NestedWrite::Create(_) => "create",
            NestedWrite::CreateMany { .. } => "createMany",
            NestedWrite::Connect(_) => "connect",
            NestedWrite::ConnectOrCreate { .. } => "connectOrCreate",
            NestedWrite::Update { .. } => "update",
            NestedWrite::Upsert { .. } => "upsert",
            NestedWrite::Delete(_) => "delete",
            NestedWrite::Disconnect(_) => "disconnect",
        }
    }

    /// Whether the operation is allowed inside a create payload.
    pub fn allowed_in_create(&self) -> bool {
        matches!(
            self,
            NestedWrite::Create(_)
                | NestedWrite::CreateMany { .. }
                | NestedWrite::Connect(_)
                | NestedWrite::ConnectOrCreate { .. }
        )
    }
}

/// Payload of a create or update: field changes plus nested relation writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteData {
    pub fields: BTreeMap<String, FieldUpdate>,
    pub relations: BTreeMap<String, Vec<NestedWrite>>,
}

impl WriteData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldUpdate::Set(value.into()));
        self
    }

    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldUpdate::Push(value.into()));
        self
    }

    pub fn increment(mut self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldUpdate::Increment(by.into()));
        self
    }

    pub fn decrement(mut self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldUpdate::Decrement(by.into()));
        self
    }

    pub fn multiply(mut self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldUpdate::Multiply(by.into()));
        self
    }

    pub fn divide(mut self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldUpdate::Divide(by.into()));
        self
    }

    /// Add a nested write through `relation`.
    pub fn nested(mut self, relation: impl Into<String>, write: NestedWrite) -> Self {
        self.relations.entry(relation.into()).or_default().push(write);
        self
    }

    pub fn create(self, relation: impl Into<String>, data: WriteData) -> Self {
        self.nested(relation, NestedWrite::Create(data))
    }

    pub fn connect(self, relation: impl Into<String>, key: UniqueWhere) -> Self {
        self.nested(relation, NestedWrite::Connect(key))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.relations.is_empty()
    }

    /// Decode a JSON payload for `entity`.
    ///
    /// Field keys take a plain value (`set`) or an operation object such as
    /// `{"push": "rust"}` or `{"increment": 5}`. Relation keys take an object
    /// of nested operations: `create` (object or array), `connect` (unique
    /// key object), `connectOrCreate` (`{"where": .., "create": ..}`),
    /// `update`, `delete` and `disconnect`.
    pub fn from_json(
        registry: &SchemaRegistry,
        entity: &str,
        json: &serde_json::Value,
    ) -> Result<WriteData> {
        let descriptor = registry.entity(entity)?;
        let object = json.as_object().ok_or_else(|| {
            SkillDbError::Validation(format!("{entity} payload must be a JSON object"))
        })?;

        let mut data = WriteData::new();
        for (key, raw) in object {
            if let Some(relation) = descriptor.relations.get(key) {
                let writes = nested_from_json(registry, &relation.target, key, raw)?;
                data.relations.insert(key.clone(), writes);
                continue;
            }
            let field = descriptor.field(key)?;
            let update = match raw.as_object() {
                Some(ops) => {
                    let (op, operand) = single_entry(entity, key, ops)?;
                    let list = field.list && op == "set";
                    let value = decode(descriptor, key, operand, list || operand.is_array())?;
                    FieldUpdate::from_op(op, value).ok_or_else(|| {
                        SkillDbError::Validation(format!(
                            "Unknown update operation '{op}' on {entity}.{key}"
                        ))
                    })?
                }
                None => FieldUpdate::Set(decode(descriptor, key, raw, field.list)?),
            };
            data.fields.insert(key.clone(), update);
        }
        Ok(data)
    }
}

fn single_entry<'a>(
    entity: &str,
    field: &str,
    ops: &'a serde_json::Map<String, serde_json::Value>,
) -> Result<(&'a str, &'a serde_json::Value)> {
    let mut entries = ops.iter();
    match (entries.next(), entries.next()) {
        (Some((op, value)), None) => Ok((op.as_str(), value)),
        _ => Err(SkillDbError::Validation(format!(
            "Update of {entity}.{field} must name exactly one operation"
        ))),
    }
}

fn decode(
    entity: &EntityDescriptor,
    field: &str,
    raw: &serde_json::Value,
    list: bool,
) -> Result<Value> {
    let descriptor = entity.field(field)?;
    Value::from_json(raw, descriptor.ty, list).ok_or_else(|| {
        SkillDbError::type_mismatch(
            &entity.name,
            field,
            format!("{raw} does not fit {}", descriptor.ty.name()),
        )
    })
}

fn unique_from_json(
    registry: &SchemaRegistry,
    entity: &str,
    raw: &serde_json::Value,
) -> Result<UniqueWhere> {
    let descriptor = registry.entity(entity)?;
    let object = raw.as_object().ok_or_else(|| {
        SkillDbError::Configuration(format!("Unique key for {entity} must be an object"))
    })?;
    let mut pairs = Vec::new();
    for (name, value) in object {
        pairs.push((name.clone(), decode(descriptor, name, value, false)?));
    }
    Ok(UniqueWhere::compound(pairs))
}

fn nested_from_json(
    registry: &SchemaRegistry,
    target: &str,
    relation: &str,
    raw: &serde_json::Value,
) -> Result<Vec<NestedWrite>> {
    let ops = raw.as_object().ok_or_else(|| {
        SkillDbError::Validation(format!(
            "Nested write through '{relation}' must be an object of operations"
        ))
    })?;
    let mut writes = Vec::new();
    for (op, body) in ops {
        match op.as_str() {
            "create" => match body.as_array() {
                Some(items) => {
                    for item in items {
                        writes.push(NestedWrite::Create(WriteData::from_json(
                            registry, target, item,
                        )?));
                    }
                }
                None => writes.push(NestedWrite::Create(WriteData::from_json(
                    registry, target, body,
                )?)),
            },
            "connect" => writes.push(NestedWrite::Connect(unique_from_json(
                registry, target, body,
            )?)),
            "connectOrCreate" => {
                let key = body.get("where").ok_or_else(|| {
                    SkillDbError::Validation(format!("connectOrCreate on '{relation}' needs where"))
                })?;
                let create = body.get("create").ok_or_else(|| {
                    SkillDbError::Validation(format!("connectOrCreate on '{relation}' needs create"))
                })?;
                writes.push(NestedWrite::ConnectOrCreate {
                    key: unique_from_json(registry, target, key)?,
                    create: WriteData::from_json(registry, target, create)?,
                });
            }
            "update" => writes.push(NestedWrite::Update {
                filter: None,
                data: WriteData::from_json(registry, target, body)?,
            }),
            "delete" if body.as_bool() == Some(true) => writes.push(NestedWrite::Delete(None)),
            "disconnect" if body.as_bool() == Some(true) => {
                writes.push(NestedWrite::Disconnect(None))
            }
            other => {
                return Err(SkillDbError::Validation(format!(
                    "Unsupported nested write '{other}' through '{relation}'"
                )))
            }
        }
    }
    Ok(writes)
}

/// Number of rows a multi-row mutation affected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_from_json_fields_and_operations() {
        let registry = SchemaRegistry::builtin().unwrap();
        let data = WriteData::from_json(
            &registry,
            "Profile",
            &json!({
                "githubUrl": "https://github.com/ann",
                "additionalSkills": { "push": ["rust", "sql"] },
            }),
        )
        .unwrap();
        assert_eq!(
            data.fields["githubUrl"],
            FieldUpdate::Set(Value::from("https://github.com/ann"))
        );
        assert_eq!(
            data.fields["additionalSkills"],
            FieldUpdate::Push(Value::from(vec!["rust", "sql"]))
        );

        let skill = WriteData::from_json(&registry, "Skill", &json!({ "levelScore": { "increment": 5 } }))
            .unwrap();
        assert_eq!(skill.fields["levelScore"], FieldUpdate::Increment(Value::Int(5)));
    }

    #[test]
    fn test_from_json_nested_writes() {
        let registry = SchemaRegistry::builtin().unwrap();
        let data = WriteData::from_json(
            &registry,
            "User",
            &json!({
                "email": "a@x.com",
                "skillSets": { "create": [{}, {}] },
                "profile": { "create": { "additionalSkills": ["go"] } },
            }),
        )
        .unwrap();
        assert_eq!(data.relations["skillSets"].len(), 2);
        match &data.relations["profile"][0] {
            NestedWrite::Create(profile) => assert_eq!(
                profile.fields["additionalSkills"],
                FieldUpdate::Set(Value::from(vec!["go"]))
            ),
            other => panic!("unexpected nested write {other:?}"),
        }

        let skill = WriteData::from_json(
            &registry,
            "Skill",
            &json!({ "skillSet": { "connect": { "id": "s1" } } }),
        )
        .unwrap();
        assert_eq!(
            skill.relations["skillSet"],
            vec![NestedWrite::Connect(UniqueWhere::id("s1"))]
        );
    }

    #[test]
    fn test_from_json_rejects_bad_payloads() {
        let registry = SchemaRegistry::builtin().unwrap();
        let err = WriteData::from_json(&registry, "Skill", &json!({ "levelScore": "high" }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let err = WriteData::from_json(&registry, "Skill", &json!({ "nickname": "x" })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);

        let err = WriteData::from_json(
            &registry,
            "Skill",
            &json!({ "levelScore": { "increment": 1, "decrement": 2 } }),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
