use super::parser::{hash_schema, parse_schema_str, BUILTIN_SCHEMA};
use super::types::{
    AutoIdStrategy, EntityDefinition, FieldDefinition, FieldType, OnDeletePolicy,
    SchemaDefinition,
};
use crate::error::{Result, SkillDbError};
use crate::value::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Name of the implicit primary key present on every entity.
pub const ID_FIELD: &str = "id";

/// Immutable, validated view of the schema. Built once at startup and shared
/// by reference with every other component.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, EntityDescriptor>,
    incoming: BTreeMap<String, Vec<RelationDescriptor>>,
    hash: String,
}

#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub name: String,
    pub id_strategy: AutoIdStrategy,
    pub fields: BTreeMap<String, FieldDescriptor>,
    pub relations: BTreeMap<String, RelationDescriptor>,
    pub unique_constraints: Vec<UniqueConstraint>,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub list: bool,
    pub nullable: bool,
    pub unique: bool,
    pub primary: bool,
    pub default: Option<DefaultValue>,
    pub updated_at: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Now,
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSide {
    /// The declaring entity stores `foreign_key`, pointing at the target id.
    Owning {
        foreign_key: String,
        on_delete: OnDeletePolicy,
    },
    /// The target stores `foreign_key`; `mapped_by` is its owning relation.
    Inverse {
        foreign_key: String,
        mapped_by: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub name: String,
    pub entity: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub side: RelationSide,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::DateTime => "datetime",
        }
    }
}

impl FieldDescriptor {
    /// Fields the engine writes itself: `createdAt`-style creation stamps
    /// and `updatedAt`-style modification stamps.
    pub fn is_managed(&self) -> bool {
        self.updated_at || self.default == Some(DefaultValue::Now)
    }

    pub fn is_numeric(&self) -> bool {
        !self.list && matches!(self.ty, FieldType::Int | FieldType::Float)
    }

    pub fn is_orderable(&self) -> bool {
        !self.list
    }

    /// Coerce a complete field value (list or scalar) to this field's type.
    pub fn coerce(&self, entity: &str, value: Value) -> Result<Value> {
        if value.is_null() {
            if self.nullable {
                return Ok(Value::Null);
            }
            return Err(SkillDbError::Validation(format!(
                "Field '{entity}.{}' cannot be null",
                self.name
            )));
        }
        if !self.list {
            return self.coerce_element(entity, value);
        }
        match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| self.coerce_element(entity, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => Err(SkillDbError::type_mismatch(
                entity,
                &self.name,
                format!("expected list of {}, got {}", self.ty.name(), other.type_name()),
            )),
        }
    }

    /// Coerce one non-null scalar (or list element) to this field's type.
    pub fn coerce_element(&self, entity: &str, value: Value) -> Result<Value> {
        let got = value.type_name();
        if value.is_null() {
            return Err(SkillDbError::type_mismatch(
                entity,
                &self.name,
                format!("expected {}, got null", self.ty.name()),
            ));
        }
        value.coerce_scalar(self.ty).ok_or_else(|| {
            SkillDbError::type_mismatch(
                entity,
                &self.name,
                format!("expected {}, got {got}", self.ty.name()),
            )
        })
    }
}

impl RelationDescriptor {
    pub fn foreign_key(&self) -> &str {
        match &self.side {
            RelationSide::Owning { foreign_key, .. } => foreign_key,
            RelationSide::Inverse { foreign_key, .. } => foreign_key,
        }
    }

    pub fn is_owning(&self) -> bool {
        matches!(self.side, RelationSide::Owning { .. })
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    pub fn on_delete(&self) -> Option<OnDeletePolicy> {
        match &self.side {
            RelationSide::Owning { on_delete, .. } => Some(*on_delete),
            RelationSide::Inverse { .. } => None,
        }
    }
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.fields.get(name).ok_or_else(|| {
            SkillDbError::Schema(format!("Unknown field '{}.{name}'", self.name))
        })
    }

    pub fn relation(&self, name: &str) -> Result<&RelationDescriptor> {
        self.relations.get(name).ok_or_else(|| {
            SkillDbError::Schema(format!("Unknown relation '{}.{name}'", self.name))
        })
    }

    /// Find the unique constraint covering exactly this set of fields.
    pub fn unique_constraint_for(&self, fields: &[&str]) -> Option<&UniqueConstraint> {
        self.unique_constraints.iter().find(|c| {
            c.fields.len() == fields.len() && fields.iter().all(|f| c.fields.iter().any(|cf| cf == f))
        })
    }

    /// Owning relations declared on this entity (those holding a foreign key).
    pub fn owning_relations(&self) -> impl Iterator<Item = &RelationDescriptor> {
        self.relations.values().filter(|r| r.is_owning())
    }

    pub fn generate_id(&self) -> String {
        match self.id_strategy {
            AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            AutoIdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

impl SchemaRegistry {
    /// Registry for the built-in User / Profile / SkillSet / Skill /
    /// LearningPath / LearningResource / File schema.
    pub fn builtin() -> Result<Arc<Self>> {
        Self::from_yaml(BUILTIN_SCHEMA).map(Arc::new)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition = parse_schema_str(content)?;
        let mut registry = Self::from_definition(&definition)?;
        registry.hash = hash_schema(content);
        Ok(registry)
    }

    /// Registry for a schema YAML file of the same shape as the built-in one.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_definition(definition: &SchemaDefinition) -> Result<Self> {
        let mut entities = BTreeMap::new();

        for (name, entity_def) in &definition.entities {
            let fields = build_fields(name, entity_def)?;
            let unique_constraints = build_unique_constraints(name, entity_def, &fields)?;
            entities.insert(
                name.clone(),
                EntityDescriptor {
                    name: name.clone(),
                    id_strategy: entity_def.id.auto,
                    fields,
                    relations: BTreeMap::new(),
                    unique_constraints,
                },
            );
        }

        // Relations need every entity's fields in place first
        let mut incoming: BTreeMap<String, Vec<RelationDescriptor>> = BTreeMap::new();
        for (name, entity_def) in &definition.entities {
            let mut relations = BTreeMap::new();
            for (rel_name, rel_def) in &entity_def.relations {
                let descriptor = build_relation(definition, &entities, name, rel_name)?;
                if descriptor.is_owning() {
                    incoming
                        .entry(rel_def.target.clone())
                        .or_default()
                        .push(descriptor.clone());
                }
                relations.insert(rel_name.clone(), descriptor);
            }
            if let Some(entity) = entities.get_mut(name) {
                entity.relations = relations;
            }
        }

        Ok(SchemaRegistry {
            entities,
            incoming,
            hash: hash_schema(&serde_yaml::to_string(definition)?),
        })
    }

    pub fn entity(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entities
            .get(name)
            .ok_or_else(|| SkillDbError::Schema(format!("Unknown entity '{name}'")))
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn field_type(&self, entity: &str, field: &str) -> Result<&FieldDescriptor> {
        self.entity(entity)?.field(field)
    }

    pub fn relation(&self, entity: &str, name: &str) -> Result<&RelationDescriptor> {
        self.entity(entity)?.relation(name)
    }

    /// Owning relations on any entity whose target is `entity`, i.e. the
    /// foreign keys that point at rows of `entity`.
    pub fn incoming_relations(&self, entity: &str) -> &[RelationDescriptor] {
        self.incoming.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn schema_hash(&self) -> &str {
        &self.hash
    }
}

fn build_fields(
    entity: &str,
    definition: &EntityDefinition,
) -> Result<BTreeMap<String, FieldDescriptor>> {
    let mut fields = BTreeMap::new();
    fields.insert(
        ID_FIELD.to_string(),
        FieldDescriptor {
            name: ID_FIELD.to_string(),
            ty: FieldType::String,
            list: false,
            nullable: false,
            unique: true,
            primary: true,
            default: None,
            updated_at: false,
        },
    );

    for (name, field_def) in &definition.fields {
        if name == ID_FIELD {
            return Err(SkillDbError::Schema(format!(
                "Entity '{entity}' must not declare the reserved field 'id'"
            )));
        }
        let default = build_default(entity, name, field_def)?;
        if field_def.updated_at && field_def.field_type != FieldType::DateTime {
            return Err(SkillDbError::Schema(format!(
                "Field '{entity}.{name}' uses updated_at but is not a datetime"
            )));
        }
        fields.insert(
            name.clone(),
            FieldDescriptor {
                name: name.clone(),
                ty: field_def.field_type,
                list: field_def.list,
                nullable: field_def.optional,
                unique: field_def.unique,
                primary: false,
                default,
                updated_at: field_def.updated_at,
            },
        );
    }
    Ok(fields)
}

fn build_default(
    entity: &str,
    name: &str,
    field_def: &FieldDefinition,
) -> Result<Option<DefaultValue>> {
    let Some(raw) = &field_def.default else {
        return Ok(None);
    };
    if raw.as_str() == Some("now()") {
        if field_def.field_type != FieldType::DateTime || field_def.list {
            return Err(SkillDbError::Schema(format!(
                "Field '{entity}.{name}' defaults to now() but is not a datetime"
            )));
        }
        return Ok(Some(DefaultValue::Now));
    }
    let json = serde_json::to_value(raw)?;
    Value::from_json(&json, field_def.field_type, field_def.list)
        .map(|v| Some(DefaultValue::Literal(v)))
        .ok_or_else(|| {
            SkillDbError::Schema(format!(
                "Default for '{entity}.{name}' does not match type {}",
                field_def.field_type.name()
            ))
        })
}

fn build_unique_constraints(
    entity: &str,
    definition: &EntityDefinition,
    fields: &BTreeMap<String, FieldDescriptor>,
) -> Result<Vec<UniqueConstraint>> {
    let mut constraints: Vec<UniqueConstraint> = fields
        .values()
        .filter(|f| f.unique)
        .map(|f| UniqueConstraint {
            name: f.name.clone(),
            fields: vec![f.name.clone()],
        })
        .collect();

    for group in &definition.unique_together {
        if group.is_empty() {
            return Err(SkillDbError::Schema(format!(
                "Entity '{entity}' declares an empty unique_together group"
            )));
        }
        for field in group {
            match fields.get(field) {
                Some(f) if !f.list => {}
                Some(_) => {
                    return Err(SkillDbError::Schema(format!(
                        "List field '{entity}.{field}' cannot be part of a unique key"
                    )))
                }
                None => {
                    return Err(SkillDbError::Schema(format!(
                        "unique_together references unknown field '{entity}.{field}'"
                    )))
                }
            }
        }
        constraints.push(UniqueConstraint {
            name: group.join("_"),
            fields: group.clone(),
        });
    }
    Ok(constraints)
}

fn build_relation(
    definition: &SchemaDefinition,
    entities: &BTreeMap<String, EntityDescriptor>,
    entity: &str,
    rel_name: &str,
) -> Result<RelationDescriptor> {
    let rel_def = &definition.entities[entity].relations[rel_name];
    let target = entities.get(&rel_def.target).ok_or_else(|| {
        SkillDbError::Schema(format!(
            "Relation '{entity}.{rel_name}' targets unknown entity '{}'",
            rel_def.target
        ))
    })?;

    match (&rel_def.foreign_key, &rel_def.mapped_by) {
        (Some(foreign_key), None) => {
            let fk = entities[entity].fields.get(foreign_key).ok_or_else(|| {
                SkillDbError::Schema(format!(
                    "Relation '{entity}.{rel_name}' uses unknown foreign key '{foreign_key}'"
                ))
            })?;
            if fk.ty != FieldType::String || fk.list {
                return Err(SkillDbError::Schema(format!(
                    "Foreign key '{entity}.{foreign_key}' must be a scalar string"
                )));
            }
            let on_delete = rel_def.on_delete.unwrap_or_default();
            if on_delete == OnDeletePolicy::SetNull && !fk.nullable {
                return Err(SkillDbError::Schema(format!(
                    "Relation '{entity}.{rel_name}' uses set_null on required key '{foreign_key}'"
                )));
            }
            Ok(RelationDescriptor {
                name: rel_name.to_string(),
                entity: entity.to_string(),
                target: target.name.clone(),
                cardinality: Cardinality::One,
                side: RelationSide::Owning {
                    foreign_key: foreign_key.clone(),
                    on_delete,
                },
            })
        }
        (None, Some(mapped_by)) => {
            let owning = definition.entities[&rel_def.target]
                .relations
                .get(mapped_by)
                .ok_or_else(|| {
                    SkillDbError::Schema(format!(
                        "Relation '{entity}.{rel_name}' is mapped by unknown '{}.{mapped_by}'",
                        rel_def.target
                    ))
                })?;
            let foreign_key = match (&owning.foreign_key, owning.target == entity) {
                (Some(fk), true) => fk.clone(),
                _ => {
                    return Err(SkillDbError::Schema(format!(
                        "'{}.{mapped_by}' is not an owning relation pointing back at '{entity}'",
                        rel_def.target
                    )))
                }
            };
            let unique_fk = target.unique_constraint_for(&[foreign_key.as_str()]).is_some();
            Ok(RelationDescriptor {
                name: rel_name.to_string(),
                entity: entity.to_string(),
                target: target.name.clone(),
                cardinality: if unique_fk {
                    Cardinality::One
                } else {
                    Cardinality::Many
                },
                side: RelationSide::Inverse {
                    foreign_key,
                    mapped_by: mapped_by.clone(),
                },
            })
        }
        _ => Err(SkillDbError::Schema(format!(
            "Relation '{entity}.{rel_name}' must declare exactly one of foreign_key or mapped_by"
        ))),
    }
}
