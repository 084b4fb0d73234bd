use super::executor::find_records;
use super::{compare_values, FindManyArgs, OrderBy, SortOrder};
use crate::error::{Result, SkillDbError};
use crate::filter::{compile_field_op, CompiledFieldOp, FieldFilter, FieldOp, Filter, QueryMode};
use crate::record::Record;
use crate::schema::{EntityDescriptor, FieldDescriptor, FieldType};
use crate::storage::DataSource;
use crate::value::Value;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

const ALL: &str = "_all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AggregateFn {
    Count,
    Avg,
    Sum,
    Min,
    Max,
}

impl AggregateFn {
    /// Key of this function in results, e.g. `_avg`.
    pub fn key(&self) -> &'static str {
        match self {
            AggregateFn::Count => "_count",
            AggregateFn::Avg => "_avg",
            AggregateFn::Sum => "_sum",
            AggregateFn::Min => "_min",
            AggregateFn::Max => "_max",
        }
    }
}

/// One aggregate selection. `field` is `None` only for `_count` over all rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateField {
    pub func: AggregateFn,
    pub field: Option<String>,
}

impl AggregateField {
    pub fn count_all() -> Self {
        AggregateField {
            func: AggregateFn::Count,
            field: None,
        }
    }

    pub fn count(field: impl Into<String>) -> Self {
        Self::of(AggregateFn::Count, field)
    }

    pub fn avg(field: impl Into<String>) -> Self {
        Self::of(AggregateFn::Avg, field)
    }

    pub fn sum(field: impl Into<String>) -> Self {
        Self::of(AggregateFn::Sum, field)
    }

    pub fn min(field: impl Into<String>) -> Self {
        Self::of(AggregateFn::Min, field)
    }

    pub fn max(field: impl Into<String>) -> Self {
        Self::of(AggregateFn::Max, field)
    }

    pub fn of(func: AggregateFn, field: impl Into<String>) -> Self {
        AggregateField {
            func,
            field: Some(field.into()),
        }
    }

    pub fn label(&self) -> &str {
        self.field.as_deref().unwrap_or(ALL)
    }

    /// Check the function applies to the field and return the field's
    /// descriptor (`None` for `_count._all`).
    fn validate<'e>(&self, entity: &'e EntityDescriptor) -> Result<Option<&'e FieldDescriptor>> {
        let Some(name) = &self.field else {
            if self.func == AggregateFn::Count {
                return Ok(None);
            }
            return Err(SkillDbError::Configuration(format!(
                "{} on {} needs a field",
                self.func.key(),
                entity.name
            )));
        };
        let field = entity.field(name)?;
        match self.func {
            AggregateFn::Count => {}
            AggregateFn::Avg | AggregateFn::Sum if !field.is_numeric() => {
                return Err(SkillDbError::type_mismatch(
                    &entity.name,
                    name,
                    format!("{} requires a numeric field", self.func.key()),
                ));
            }
            AggregateFn::Min | AggregateFn::Max if !field.is_orderable() => {
                return Err(SkillDbError::type_mismatch(
                    &entity.name,
                    name,
                    format!("{} requires a scalar field", self.func.key()),
                ));
            }
            _ => {}
        }
        Ok(Some(field))
    }

    /// Type of the aggregate's result, used to compile `having` operators.
    fn result_descriptor(&self, field: Option<&FieldDescriptor>) -> FieldDescriptor {
        let ty = match (self.func, field) {
            (AggregateFn::Count, _) => FieldType::Int,
            (AggregateFn::Avg, _) => FieldType::Float,
            (_, Some(f)) => f.ty,
            (_, None) => FieldType::Int,
        };
        FieldDescriptor {
            name: format!("{}.{}", self.func.key(), self.label()),
            ty,
            list: false,
            nullable: self.func != AggregateFn::Count,
            unique: false,
            primary: false,
            default: None,
            updated_at: false,
        }
    }

    fn compute(&self, entity: &str, records: &[&Record]) -> Result<Value> {
        let Some(name) = &self.field else {
            return Ok(Value::Int(records.len() as i64));
        };
        let values = records.iter().map(|r| r.get(name)).filter(|v| !v.is_null());
        match self.func {
            AggregateFn::Count => Ok(Value::Int(values.count() as i64)),
            AggregateFn::Sum => sum(entity, name, values),
            AggregateFn::Avg => {
                let numbers: Vec<f64> = values.filter_map(Value::as_f64).collect();
                if numbers.is_empty() {
                    return Ok(Value::Null);
                }
                Ok(Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64))
            }
            AggregateFn::Min => Ok(extreme(values, Ordering::Less)),
            AggregateFn::Max => Ok(extreme(values, Ordering::Greater)),
        }
    }
}

fn sum<'v>(entity: &str, field: &str, values: impl Iterator<Item = &'v Value>) -> Result<Value> {
    let mut total: Option<Value> = None;
    for value in values {
        total = Some(match (total, value) {
            (None, v) => v.clone(),
            (Some(Value::Int(a)), Value::Int(b)) => {
                Value::Int(a.checked_add(*b).ok_or_else(|| {
                    SkillDbError::Validation(format!("_sum of {entity}.{field} overflows"))
                })?)
            }
            (Some(acc), v) => Value::Float(acc.as_f64().unwrap_or(0.0) + v.as_f64().unwrap_or(0.0)),
        });
    }
    Ok(total.unwrap_or(Value::Null))
}

fn extreme<'v>(values: impl Iterator<Item = &'v Value>, wanted: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for value in values {
        best = match best {
            Some(current) if value.compare(current) != Some(wanted) => Some(current),
            _ => Some(value),
        };
    }
    best.cloned().unwrap_or(Value::Null)
}

/// Aggregate values keyed by function then field, e.g.
/// `{"_avg": {"levelScore": 65.0}, "_count": {"_all": 4}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AggregateResult(BTreeMap<String, BTreeMap<String, Value>>);

impl AggregateResult {
    pub fn get(&self, func: AggregateFn, field: &str) -> Option<&Value> {
        self.0.get(func.key()).and_then(|fields| fields.get(field))
    }

    pub fn count_all(&self) -> Option<u64> {
        self.get(AggregateFn::Count, ALL)
            .and_then(Value::as_i64)
            .map(|n| n as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn insert(&mut self, aggregate: &AggregateField, value: Value) {
        self.0
            .entry(aggregate.func.key().to_string())
            .or_default()
            .insert(aggregate.label().to_string(), value);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateArgs {
    /// Rows to aggregate over; relations and projections are ignored.
    pub query: FindManyArgs,
    pub fields: Vec<AggregateField>,
}

impl AggregateArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.query.filter = Some(filter);
        self
    }

    pub fn query(mut self, query: FindManyArgs) -> Self {
        self.query = query;
        self
    }

    pub fn select(mut self, aggregate: AggregateField) -> Self {
        self.fields.push(aggregate);
        self
    }
}

pub fn aggregate<S: DataSource>(
    source: &S,
    entity: &str,
    args: &AggregateArgs,
) -> Result<AggregateResult> {
    let descriptor = source.registry().entity(entity)?;
    for field in &args.fields {
        field.validate(descriptor)?;
    }
    let records = find_records(source, entity, &args.query)?;
    let refs: Vec<&Record> = records.iter().collect();

    let mut result = AggregateResult::default();
    for field in &args.fields {
        result.insert(field, field.compute(entity, &refs)?);
    }
    Ok(result)
}

/// Condition on a group: either a grouped field or an aggregate of the group.
#[derive(Debug, Clone, PartialEq)]
pub enum Having {
    Field(FieldFilter),
    Aggregate {
        aggregate: AggregateField,
        op: FieldOp,
    },
    And(Vec<Having>),
    Or(Vec<Having>),
    Not(Box<Having>),
}

impl Having {
    pub fn field(field: impl Into<String>, op: FieldOp) -> Self {
        Having::Field(FieldFilter {
            field: field.into(),
            op,
            mode: QueryMode::Default,
        })
    }

    pub fn aggregate(aggregate: AggregateField, op: FieldOp) -> Self {
        Having::Aggregate { aggregate, op }
    }

    pub fn and(conditions: Vec<Having>) -> Self {
        Having::And(conditions)
    }

    pub fn or(conditions: Vec<Having>) -> Self {
        Having::Or(conditions)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Having) -> Self {
        Having::Not(Box::new(condition))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupOrderBy {
    Field(OrderBy),
    Aggregate {
        aggregate: AggregateField,
        order: SortOrder,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupByArgs {
    pub by: Vec<String>,
    pub filter: Option<Filter>,
    pub having: Option<Having>,
    pub order_by: Vec<GroupOrderBy>,
    pub take: Option<usize>,
    pub skip: Option<usize>,
    pub aggregates: Vec<AggregateField>,
}

impl GroupByArgs {
    pub fn new<S: Into<String>>(by: Vec<S>) -> Self {
        GroupByArgs {
            by: by.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn having(mut self, having: Having) -> Self {
        self.having = Some(having);
        self
    }

    pub fn order_by(mut self, order: GroupOrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn select(mut self, aggregate: AggregateField) -> Self {
        self.aggregates.push(aggregate);
        self
    }
}

/// One group: the grouped field values flattened next to the aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupRow {
    #[serde(flatten)]
    pub key: Record,
    #[serde(flatten)]
    pub aggregates: AggregateResult,
}

impl GroupRow {
    pub fn get(&self, field: &str) -> &Value {
        self.key.get(field)
    }

    pub fn aggregate(&self, func: AggregateFn, field: &str) -> Option<&Value> {
        self.aggregates.get(func, field)
    }
}

enum CompiledHaving {
    Field {
        field: String,
        op: CompiledFieldOp,
    },
    Aggregate {
        aggregate: AggregateField,
        op: CompiledFieldOp,
    },
    And(Vec<CompiledHaving>),
    Or(Vec<CompiledHaving>),
    Not(Box<CompiledHaving>),
}

impl CompiledHaving {
    fn compile(entity: &EntityDescriptor, by: &[String], having: &Having) -> Result<Self> {
        match having {
            Having::Field(f) => {
                if !by.contains(&f.field) {
                    return Err(SkillDbError::InvalidGroupBy(format!(
                        "having on '{}' requires it in by",
                        f.field
                    )));
                }
                let field = entity.field(&f.field)?;
                Ok(CompiledHaving::Field {
                    field: f.field.clone(),
                    op: compile_field_op(&entity.name, field, &f.op, f.mode)?,
                })
            }
            Having::Aggregate { aggregate, op } => {
                let field = aggregate.validate(entity)?;
                let result = aggregate.result_descriptor(field);
                Ok(CompiledHaving::Aggregate {
                    aggregate: aggregate.clone(),
                    op: compile_field_op(&entity.name, &result, op, QueryMode::Default)?,
                })
            }
            Having::And(children) => children
                .iter()
                .map(|c| Self::compile(entity, by, c))
                .collect::<Result<Vec<_>>>()
                .map(CompiledHaving::And),
            Having::Or(children) => children
                .iter()
                .map(|c| Self::compile(entity, by, c))
                .collect::<Result<Vec<_>>>()
                .map(CompiledHaving::Or),
            Having::Not(inner) => Ok(CompiledHaving::Not(Box::new(Self::compile(
                entity, by, inner,
            )?))),
        }
    }

    fn matches(&self, entity: &str, key: &Record, rows: &[&Record]) -> Result<bool> {
        match self {
            CompiledHaving::Field { field, op } => Ok(op.test(key.get(field))),
            CompiledHaving::Aggregate { aggregate, op } => {
                Ok(op.test(&aggregate.compute(entity, rows)?))
            }
            CompiledHaving::And(children) => {
                for child in children {
                    if !child.matches(entity, key, rows)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CompiledHaving::Or(children) => {
                for child in children {
                    if child.matches(entity, key, rows)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CompiledHaving::Not(inner) => Ok(!inner.matches(entity, key, rows)?),
        }
    }
}

struct Group<'r> {
    key: Record,
    rows: Vec<&'r Record>,
    sort_keys: Vec<Value>,
}

pub fn group_by<S: DataSource>(
    source: &S,
    entity: &str,
    args: &GroupByArgs,
) -> Result<Vec<GroupRow>> {
    let descriptor = source.registry().entity(entity)?;
    if args.by.is_empty() {
        return Err(SkillDbError::InvalidGroupBy(format!(
            "groupBy on {entity} needs at least one field"
        )));
    }
    for name in &args.by {
        if !descriptor.field(name)?.is_orderable() {
            return Err(SkillDbError::InvalidGroupBy(format!(
                "cannot group by list field '{entity}.{name}'"
            )));
        }
    }
    for aggregate in &args.aggregates {
        aggregate.validate(descriptor)?;
    }
    let having = args
        .having
        .as_ref()
        .map(|h| CompiledHaving::compile(descriptor, &args.by, h))
        .transpose()?;
    for order in &args.order_by {
        match order {
            GroupOrderBy::Field(o) if !args.by.contains(&o.field) => {
                return Err(SkillDbError::InvalidGroupBy(format!(
                    "orderBy on '{}' requires it in by",
                    o.field
                )));
            }
            GroupOrderBy::Field(_) => {}
            GroupOrderBy::Aggregate { aggregate, .. } => {
                aggregate.validate(descriptor)?;
            }
        }
    }

    let query = FindManyArgs {
        filter: args.filter.clone(),
        ..FindManyArgs::default()
    };
    let records = find_records(source, entity, &query)?;

    let mut groups: Vec<Group<'_>> = Vec::new();
    let mut positions: HashMap<Vec<String>, usize> = HashMap::new();
    for record in &records {
        let index_key: Vec<String> = args.by.iter().map(|f| record.get(f).index_key()).collect();
        let pos = *positions.entry(index_key).or_insert_with(|| {
            let key = args
                .by
                .iter()
                .map(|f| (f.clone(), record.get(f).clone()))
                .collect();
            groups.push(Group {
                key,
                rows: Vec::new(),
                sort_keys: Vec::new(),
            });
            groups.len() - 1
        });
        groups[pos].rows.push(record);
    }

    let mut kept = Vec::with_capacity(groups.len());
    for mut group in groups {
        if let Some(having) = &having {
            if !having.matches(entity, &group.key, &group.rows)? {
                continue;
            }
        }
        for order in &args.order_by {
            let value = match order {
                GroupOrderBy::Field(o) => group.key.get(&o.field).clone(),
                GroupOrderBy::Aggregate { aggregate, .. } => {
                    aggregate.compute(entity, &group.rows)?
                }
            };
            group.sort_keys.push(value);
        }
        kept.push(group);
    }

    kept.sort_by(|a, b| {
        for (i, order) in args.order_by.iter().enumerate() {
            let (direction, nulls_first) = match order {
                GroupOrderBy::Field(o) => (o.order, o.puts_nulls_first()),
                GroupOrderBy::Aggregate { order, .. } => (*order, *order == SortOrder::Desc),
            };
            let ord = compare_values(&a.sort_keys[i], &b.sort_keys[i], direction, nulls_first);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        for field in &args.by {
            let ord = compare_values(a.key.get(field), b.key.get(field), SortOrder::Asc, false);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    let skip = args.skip.unwrap_or(0);
    let take = args.take.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    for group in kept.into_iter().skip(skip).take(take) {
        let mut aggregates = AggregateResult::default();
        for aggregate in &args.aggregates {
            aggregates.insert(aggregate, aggregate.compute(entity, &group.rows)?);
        }
        out.push(GroupRow {
            key: group.key,
            aggregates,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::SchemaRegistry;
    use crate::storage::{ChangeSet, Overlay, Storage, View};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn skill(id: &str, category: &str, score: i64, description: Option<&str>) -> Record {
        let mut r = Record::new();
        r.set("id", id);
        r.set("name", id);
        r.set("category", category);
        r.set("levelScore", score);
        r.set("description", description);
        r.set("skillSetId", "s1");
        r
    }

    fn storage_with(skills: Vec<Record>) -> Storage {
        let storage = Storage::in_memory(SchemaRegistry::builtin().unwrap()).unwrap();
        let mut overlay = Overlay::new();
        let mut user = Record::new();
        user.set("id", "u1");
        user.set("email", "a@x.com");
        overlay.entry("User".into()).or_default().insert("u1".into(), Some(user));
        let mut set = Record::new();
        set.set("id", "s1");
        set.set("userId", "u1");
        overlay.entry("SkillSet".into()).or_default().insert("s1".into(), Some(set));
        for s in skills {
            overlay
                .entry("Skill".into())
                .or_default()
                .insert(s.id().to_string(), Some(s));
        }
        storage
            .commit(
                ChangeSet {
                    writes: &overlay,
                    read_tables: &BTreeMap::new(),
                },
                || Ok(()),
            )
            .unwrap();
        storage
    }

    fn sample() -> Storage {
        storage_with(vec![
            skill("k1", "backend", 80, None),
            skill("k2", "backend", 60, Some("systems")),
            skill("k3", "frontend", 40, None),
            skill("k4", "frontend", 50, Some("ui")),
            skill("k5", "data", 90, None),
        ])
    }

    #[test]
    fn test_aggregate_numeric_field() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = AggregateArgs::new()
            .select(AggregateField::count_all())
            .select(AggregateField::count("description"))
            .select(AggregateField::avg("levelScore"))
            .select(AggregateField::sum("levelScore"))
            .select(AggregateField::min("levelScore"))
            .select(AggregateField::max("name"));
        let result = aggregate(&view, "Skill", &args).unwrap();

        assert_eq!(result.count_all(), Some(5));
        assert_eq!(result.get(AggregateFn::Count, "description"), Some(&Value::Int(2)));
        assert_eq!(result.get(AggregateFn::Avg, "levelScore"), Some(&Value::Float(64.0)));
        assert_eq!(result.get(AggregateFn::Sum, "levelScore"), Some(&Value::Int(320)));
        assert_eq!(result.get(AggregateFn::Min, "levelScore"), Some(&Value::Int(40)));
        assert_eq!(result.get(AggregateFn::Max, "name"), Some(&Value::from("k5")));

        let json = result.to_json().unwrap();
        assert_eq!(json["_count"]["_all"], 5);
    }

    #[test]
    fn test_aggregate_over_empty_set() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = AggregateArgs::new()
            .filter(Filter::eq("category", "ops"))
            .select(AggregateField::count_all())
            .select(AggregateField::avg("levelScore"))
            .select(AggregateField::sum("levelScore"));
        let result = aggregate(&view, "Skill", &args).unwrap();
        assert_eq!(result.count_all(), Some(0));
        assert_eq!(result.get(AggregateFn::Avg, "levelScore"), Some(&Value::Null));
        assert_eq!(result.get(AggregateFn::Sum, "levelScore"), Some(&Value::Null));
    }

    #[test]
    fn test_aggregate_rejects_non_numeric_average() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = AggregateArgs::new().select(AggregateField::avg("name"));
        let err = aggregate(&view, "Skill", &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_integer_sum_overflow() {
        let storage = storage_with(vec![
            skill("k1", "a", i64::MAX, None),
            skill("k2", "a", 1, None),
        ]);
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = AggregateArgs::new().select(AggregateField::sum("levelScore"));
        let err = aggregate(&view, "Skill", &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_group_by_having_average() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = GroupByArgs::new(vec!["category"])
            .having(Having::aggregate(
                AggregateField::avg("levelScore"),
                FieldOp::Gt(Value::from(50)),
            ))
            .select(AggregateField::avg("levelScore"))
            .select(AggregateField::count_all());
        let rows = group_by(&view, "Skill", &args).unwrap();

        let categories: Vec<&Value> = rows.iter().map(|r| r.get("category")).collect();
        assert_eq!(categories, vec![&Value::from("backend"), &Value::from("data")]);
        assert_eq!(
            rows[0].aggregate(AggregateFn::Avg, "levelScore"),
            Some(&Value::Float(70.0))
        );
        assert_eq!(rows[0].aggregates.count_all(), Some(2));
    }

    #[test]
    fn test_group_by_orders_by_aggregate() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = GroupByArgs::new(vec!["category"])
            .order_by(GroupOrderBy::Aggregate {
                aggregate: AggregateField::sum("levelScore"),
                order: SortOrder::Desc,
            })
            .skip(2)
            .take(1)
            .select(AggregateField::sum("levelScore"));
        let rows = group_by(&view, "Skill", &args).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("category"), &Value::from("frontend"));

        let json = serde_json::to_value(&rows[0]).unwrap();
        assert_eq!(json["category"], "frontend");
        assert_eq!(json["_sum"]["levelScore"], 90);
    }

    #[test]
    fn test_group_by_rejects_invalid_shapes() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());

        let empty = GroupByArgs::new(Vec::<String>::new());
        assert_eq!(
            group_by(&view, "Skill", &empty).unwrap_err().kind(),
            ErrorKind::InvalidGroupBy
        );

        let ungrouped_having = GroupByArgs::new(vec!["category"])
            .having(Having::field("name", FieldOp::Equals(Value::from("k1"))));
        assert_eq!(
            group_by(&view, "Skill", &ungrouped_having).unwrap_err().kind(),
            ErrorKind::InvalidGroupBy
        );

        let ungrouped_order = GroupByArgs::new(vec!["category"])
            .order_by(GroupOrderBy::Field(OrderBy::asc("levelScore")))
            .take(2);
        assert_eq!(
            group_by(&view, "Skill", &ungrouped_order).unwrap_err().kind(),
            ErrorKind::InvalidGroupBy
        );

        let list_field = GroupByArgs::new(vec!["additionalSkills"]);
        assert_eq!(
            group_by(&view, "Profile", &list_field).unwrap_err().kind(),
            ErrorKind::InvalidGroupBy
        );
    }

    #[test]
    fn test_group_by_default_order_and_scalar_having() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = GroupByArgs::new(vec!["category"]).having(Having::not(Having::field(
            "category",
            FieldOp::Equals(Value::from("data")),
        )));
        let rows = group_by(&view, "Skill", &args).unwrap();
        let categories: Vec<&Value> = rows.iter().map(|r| r.get("category")).collect();
        assert_eq!(categories, vec![&Value::from("backend"), &Value::from("frontend")]);
        assert!(rows[0].aggregates.is_empty());
    }
}
