use super::{FieldOp, Filter, Logical, QueryMode, RelationQuantifier};
use crate::error::{Result, SkillDbError};
use crate::schema::{FieldDescriptor, FieldType, RelationDescriptor, SchemaRegistry};
use crate::value::Value;

/// A filter whose field and relation references were resolved against the
/// schema registry and whose literals were coerced to the field types.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledFilter {
    Field {
        field: String,
        op: CompiledFieldOp,
    },
    Relation {
        relation: RelationDescriptor,
        quantifier: RelationQuantifier,
        inner: Box<CompiledFilter>,
    },
    And(Vec<CompiledFilter>),
    Or(Vec<CompiledFilter>),
    Not(Box<CompiledFilter>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFieldOp {
    pub op: FieldOp,
    pub insensitive: bool,
}

impl CompiledFilter {
    pub fn compile(registry: &SchemaRegistry, entity: &str, filter: &Filter) -> Result<Self> {
        match filter {
            Filter::Field(f) => {
                let field = registry.field_type(entity, &f.field)?;
                Ok(CompiledFilter::Field {
                    field: f.field.clone(),
                    op: compile_field_op(entity, field, &f.op, f.mode)?,
                })
            }
            Filter::Relation(r) => {
                let relation = registry.relation(entity, &r.relation)?;
                let to_many_quantifier = matches!(
                    r.quantifier,
                    RelationQuantifier::Some | RelationQuantifier::Every | RelationQuantifier::None
                );
                if to_many_quantifier != relation.is_to_many() {
                    return Err(SkillDbError::Configuration(format!(
                        "Quantifier {:?} cannot be used on {} relation '{entity}.{}'",
                        r.quantifier,
                        if relation.is_to_many() { "to-many" } else { "to-one" },
                        r.relation
                    )));
                }
                let inner = Self::compile(registry, &relation.target, &r.filter)?;
                Ok(CompiledFilter::Relation {
                    relation: relation.clone(),
                    quantifier: r.quantifier,
                    inner: Box::new(inner),
                })
            }
            Filter::Logical(Logical::And(children)) => children
                .iter()
                .map(|c| Self::compile(registry, entity, c))
                .collect::<Result<Vec<_>>>()
                .map(CompiledFilter::And),
            Filter::Logical(Logical::Or(children)) => children
                .iter()
                .map(|c| Self::compile(registry, entity, c))
                .collect::<Result<Vec<_>>>()
                .map(CompiledFilter::Or),
            Filter::Logical(Logical::Not(inner)) => Ok(CompiledFilter::Not(Box::new(
                Self::compile(registry, entity, inner)?,
            ))),
        }
    }

    /// Compile an optional filter; a missing filter matches everything.
    pub fn compile_opt(
        registry: &SchemaRegistry,
        entity: &str,
        filter: Option<&Filter>,
    ) -> Result<Self> {
        match filter {
            Some(f) => Self::compile(registry, entity, f),
            None => Ok(CompiledFilter::And(Vec::new())),
        }
    }

    /// A case-sensitive equality on a scalar field that must hold for every
    /// match, usable to narrow a scan through an index.
    pub fn equality_hint(&self) -> Option<(&str, &Value)> {
        match self {
            CompiledFilter::Field {
                field,
                op:
                    CompiledFieldOp {
                        op: FieldOp::Equals(value),
                        insensitive: false,
                    },
            } if !value.is_null() && value.as_list().is_none() => Some((field.as_str(), value)),
            CompiledFilter::And(children) => children.iter().find_map(Self::equality_hint),
            _ => None,
        }
    }

    pub fn is_trivial(&self) -> bool {
        matches!(self, CompiledFilter::And(children) if children.is_empty())
    }
}

/// Validate one field operator against the field's declared type and coerce
/// its literals.
pub fn compile_field_op(
    entity: &str,
    field: &FieldDescriptor,
    op: &FieldOp,
    mode: QueryMode,
) -> Result<CompiledFieldOp> {
    let insensitive = mode == QueryMode::Insensitive;
    if insensitive && field.ty != FieldType::String {
        return Err(SkillDbError::type_mismatch(
            entity,
            &field.name,
            "insensitive mode requires a string field",
        ));
    }

    let mismatch = |message: &str| SkillDbError::type_mismatch(entity, &field.name, message);
    let scalar = |value: &Value| field.coerce_element(entity, value.clone());
    let scalars = |values: &[Value]| {
        values
            .iter()
            .map(|v| field.coerce_element(entity, v.clone()))
            .collect::<Result<Vec<_>>>()
    };

    let compiled = match op {
        FieldOp::Equals(value) | FieldOp::Not(value) => {
            let coerced = if value.is_null() {
                if !field.nullable {
                    return Err(mismatch("field is not nullable"));
                }
                Value::Null
            } else if field.list {
                match value {
                    Value::List(items) => Value::List(scalars(items)?),
                    _ => return Err(mismatch("list field compared against a scalar")),
                }
            } else {
                scalar(value)?
            };
            if matches!(op, FieldOp::Equals(_)) {
                FieldOp::Equals(coerced)
            } else {
                FieldOp::Not(coerced)
            }
        }
        FieldOp::In(values) | FieldOp::NotIn(values) => {
            if field.list {
                return Err(mismatch("in/notIn require a scalar field"));
            }
            let coerced = scalars(values)?;
            if matches!(op, FieldOp::In(_)) {
                FieldOp::In(coerced)
            } else {
                FieldOp::NotIn(coerced)
            }
        }
        FieldOp::Lt(value) | FieldOp::Lte(value) | FieldOp::Gt(value) | FieldOp::Gte(value) => {
            if field.list || field.ty == FieldType::Boolean {
                return Err(mismatch("range comparison requires an orderable scalar field"));
            }
            let coerced = scalar(value)?;
            match op {
                FieldOp::Lt(_) => FieldOp::Lt(coerced),
                FieldOp::Lte(_) => FieldOp::Lte(coerced),
                FieldOp::Gt(_) => FieldOp::Gt(coerced),
                _ => FieldOp::Gte(coerced),
            }
        }
        FieldOp::Contains(_) | FieldOp::StartsWith(_) | FieldOp::EndsWith(_) => {
            if field.list || field.ty != FieldType::String {
                return Err(mismatch("string matching requires a scalar string field"));
            }
            op.clone()
        }
        FieldOp::IsNull(_) => {
            if !field.nullable {
                return Err(mismatch("field is not nullable"));
            }
            op.clone()
        }
        FieldOp::Has(value) => {
            if !field.list {
                return Err(mismatch("has requires a list field"));
            }
            FieldOp::Has(scalar(value)?)
        }
        FieldOp::HasEvery(values) | FieldOp::HasSome(values) => {
            if !field.list {
                return Err(mismatch("hasEvery/hasSome require a list field"));
            }
            let coerced = scalars(values)?;
            if matches!(op, FieldOp::HasEvery(_)) {
                FieldOp::HasEvery(coerced)
            } else {
                FieldOp::HasSome(coerced)
            }
        }
        FieldOp::IsEmpty(_) => {
            if !field.list {
                return Err(mismatch("isEmpty requires a list field"));
            }
            op.clone()
        }
    };

    Ok(CompiledFieldOp {
        op: compiled,
        insensitive,
    })
}
