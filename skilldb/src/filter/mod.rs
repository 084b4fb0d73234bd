//! Filter predicates over entity fields and relations.
//!
//! A [`Filter`] is a small closed tree: field comparisons, relation
//! quantifiers and logical combinators. Filters are compiled against the
//! schema registry before touching storage (see [`compile`]) and evaluated
//! against records without side effects.

mod compile;
mod eval;

pub use compile::{compile_field_op, CompiledFieldOp, CompiledFilter};
pub use eval::RelatedRows;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Field(FieldFilter),
    Relation(RelationFilter),
    Logical(Logical),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Logical {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

/// String comparison mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryMode {
    #[default]
    Default,
    Insensitive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub op: FieldOp,
    pub mode: QueryMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Equals(Value),
    Not(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    IsNull(bool),
    /// List field contains the element
    Has(Value),
    HasEvery(Vec<Value>),
    HasSome(Vec<Value>),
    IsEmpty(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationQuantifier {
    /// At least one related row matches (to-many)
    Some,
    /// Every related row matches; true when there are none (to-many)
    Every,
    /// No related row matches (to-many)
    None,
    /// The related row exists and matches (to-one)
    Is,
    /// The related row is absent or does not match (to-one)
    IsNot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationFilter {
    pub relation: String,
    pub quantifier: RelationQuantifier,
    pub filter: Box<Filter>,
}

impl Filter {
    pub fn field(field: impl Into<String>, op: FieldOp) -> Self {
        Filter::Field(FieldFilter {
            field: field.into(),
            op,
            mode: QueryMode::Default,
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Equals(value.into()))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Not(value.into()))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Gt(value.into()))
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Gte(value.into()))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Lt(value.into()))
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Lte(value.into()))
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: Vec<V>) -> Self {
        Self::field(field, FieldOp::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::field(field, FieldOp::Contains(needle.into()))
    }

    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::field(field, FieldOp::StartsWith(prefix.into()))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::field(field, FieldOp::IsNull(true))
    }

    pub fn has(field: impl Into<String>, element: impl Into<Value>) -> Self {
        Self::field(field, FieldOp::Has(element.into()))
    }

    pub fn relation(
        relation: impl Into<String>,
        quantifier: RelationQuantifier,
        filter: Filter,
    ) -> Self {
        Filter::Relation(RelationFilter {
            relation: relation.into(),
            quantifier,
            filter: Box::new(filter),
        })
    }

    pub fn some(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationQuantifier::Some, filter)
    }

    pub fn every(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationQuantifier::Every, filter)
    }

    pub fn none(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationQuantifier::None, filter)
    }

    pub fn is(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationQuantifier::Is, filter)
    }

    pub fn is_not(relation: impl Into<String>, filter: Filter) -> Self {
        Self::relation(relation, RelationQuantifier::IsNot, filter)
    }

    /// Matches every record.
    pub fn all() -> Self {
        Filter::Logical(Logical::And(Vec::new()))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Logical(Logical::And(filters))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Logical(Logical::Or(filters))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Logical(Logical::Not(Box::new(filter)))
    }

    /// Switch a field filter to case-insensitive string matching.
    /// Other filter kinds are returned unchanged.
    pub fn insensitive(self) -> Self {
        match self {
            Filter::Field(mut f) => {
                f.mode = QueryMode::Insensitive;
                Filter::Field(f)
            }
            other => other,
        }
    }
}
