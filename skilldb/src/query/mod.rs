//! Read operations over one entity: unique lookups, filtered and paginated
//! listings, counts, aggregates and group-by.
//!
//! Every operation runs against a [`DataSource`](crate::storage::DataSource),
//! so the same code serves committed snapshots and open transactions.

mod aggregate;
mod executor;

pub use aggregate::{
    aggregate, group_by, AggregateArgs, AggregateField, AggregateFn, AggregateResult,
    GroupByArgs, GroupOrderBy, GroupRow, Having,
};
pub use executor::{
    count, find_first, find_first_or_throw, find_many, find_records, find_unique,
    find_unique_or_throw, find_unique_record,
};
pub(crate) use executor::{compare_values, select_records};

use crate::error::{Result, SkillDbError};
use crate::filter::Filter;
use crate::record::Record;
use crate::relation::Include;
use crate::schema::{EntityDescriptor, ID_FIELD};
use crate::value::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub order: SortOrder,
    /// Defaults to nulls last when ascending and nulls first when descending.
    pub nulls: Option<NullsOrder>,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            order: SortOrder::Asc,
            nulls: None,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            order: SortOrder::Desc,
            nulls: None,
        }
    }

    pub fn with_nulls(mut self, nulls: NullsOrder) -> Self {
        self.nulls = Some(nulls);
        self
    }

    pub fn puts_nulls_first(&self) -> bool {
        match self.nulls {
            Some(NullsOrder::First) => true,
            Some(NullsOrder::Last) => false,
            None => self.order == SortOrder::Desc,
        }
    }
}

/// Values for a declared unique key: the id, a unique field or a compound
/// unique constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueWhere {
    fields: Vec<(String, Value)>,
}

impl UniqueWhere {
    pub fn id(id: impl Into<String>) -> Self {
        Self::field(ID_FIELD, Value::String(id.into()))
    }

    pub fn field(name: impl Into<String>, value: impl Into<Value>) -> Self {
        UniqueWhere {
            fields: vec![(name.into(), value.into())],
        }
    }

    pub fn compound<K: Into<String>, V: Into<Value>>(pairs: Vec<(K, V)>) -> Self {
        UniqueWhere {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn is_id(&self) -> bool {
        self.fields.len() == 1 && self.fields[0].0 == ID_FIELD
    }

    /// Check the key names a declared unique constraint and coerce its
    /// values to the field types.
    pub fn resolve(&self, entity: &EntityDescriptor) -> Result<UniqueWhere> {
        if self.fields.is_empty() {
            return Err(SkillDbError::Configuration(format!(
                "Empty unique key for {}",
                entity.name
            )));
        }
        let names: Vec<&str> = self.fields.iter().map(|(n, _)| n.as_str()).collect();
        if entity.unique_constraint_for(&names).is_none() {
            return Err(SkillDbError::Configuration(format!(
                "({}) is not a unique key of {}",
                names.join(", "),
                entity.name
            )));
        }
        let mut resolved = Vec::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            if value.is_null() {
                return Err(SkillDbError::Configuration(format!(
                    "Unique key value for '{}.{name}' cannot be null",
                    entity.name
                )));
            }
            let field = entity.field(name)?;
            resolved.push((name.clone(), field.coerce_element(&entity.name, value.clone())?));
        }
        Ok(UniqueWhere { fields: resolved })
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.fields
            .iter()
            .all(|(name, value)| record.get(name).matches(value, false))
    }

    pub fn to_filter(&self) -> Filter {
        Filter::and(
            self.fields
                .iter()
                .map(|(name, value)| Filter::eq(name.clone(), value.clone()))
                .collect(),
        )
    }
}

impl fmt::Display for UniqueWhere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect();
        write!(f, "{}", parts.join(" and "))
    }
}

/// Arguments of `findMany`, also used per relation inside an [`Include`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindManyArgs {
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    /// The cursor row is part of the page; skip one to page past it.
    pub cursor: Option<UniqueWhere>,
    /// Negative values take from the end, counting back from the cursor.
    pub take: Option<i64>,
    pub skip: Option<usize>,
    pub distinct: Vec<String>,
    pub include: Include,
    pub select: Option<Vec<String>>,
}

impl FindManyArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn cursor(mut self, cursor: UniqueWhere) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn take(mut self, take: i64) -> Self {
        self.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn distinct<S: Into<String>>(mut self, fields: Vec<S>) -> Self {
        self.distinct = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }

    pub fn select<S: Into<String>>(mut self, fields: Vec<S>) -> Self {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Whether anything beyond the filter shapes the result.
    pub fn is_windowed(&self) -> bool {
        !self.order_by.is_empty()
            || self.cursor.is_some()
            || self.take.is_some()
            || self.skip.is_some()
            || !self.distinct.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindUniqueArgs {
    pub key: UniqueWhere,
    pub include: Include,
    pub select: Option<Vec<String>>,
}

impl FindUniqueArgs {
    pub fn new(key: UniqueWhere) -> Self {
        FindUniqueArgs {
            key,
            include: Include::default(),
            select: None,
        }
    }

    pub fn include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }

    pub fn select<S: Into<String>>(mut self, fields: Vec<S>) -> Self {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

impl From<UniqueWhere> for FindUniqueArgs {
    fn from(key: UniqueWhere) -> Self {
        FindUniqueArgs::new(key)
    }
}
