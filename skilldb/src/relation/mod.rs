//! Relation resolution: expanding `include` trees into a dependency-ordered
//! fetch plan, attaching related rows and `_count` projections to query
//! results, and planning cascading deletes.

mod cascade;

pub use cascade::{deletion_impact, plan_delete, Blocker, DeleteImpact, DeletePlan};

use crate::error::{Result, SkillDbError};
use crate::filter::{CompiledFilter, Filter, RelatedRows};
use crate::query::{select_records, FindManyArgs};
use crate::record::{Record, Related, Row};
use crate::schema::{RelationDescriptor, RelationSide, SchemaRegistry};
use crate::storage::DataSource;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Relations to load alongside each result row, and relations to count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Include {
    /// Relation name to the query applied to its rows. To-one relations only
    /// accept nested `include` and `select`.
    pub relations: BTreeMap<String, FindManyArgs>,
    /// Relation name to an optional filter for `_count`. To-many only.
    pub counts: BTreeMap<String, Option<Filter>>,
}

impl Include {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include every related row.
    pub fn relation(self, name: impl Into<String>) -> Self {
        self.with(name, FindManyArgs::default())
    }

    /// Include related rows shaped by a nested query.
    pub fn with(mut self, name: impl Into<String>, args: FindManyArgs) -> Self {
        self.relations.insert(name.into(), args);
        self
    }

    pub fn count(mut self, name: impl Into<String>) -> Self {
        self.counts.insert(name.into(), None);
        self
    }

    pub fn count_where(mut self, name: impl Into<String>, filter: Filter) -> Self {
        self.counts.insert(name.into(), Some(filter));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty() && self.counts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Root,
    ToOne,
    ToMany,
    Count,
}

/// One fetch in a plan. Every step after the root needs the keys produced by
/// the step that loaded its parent path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchStep {
    pub depth: usize,
    /// Dotted relation path from the root, empty for the root itself.
    pub path: String,
    pub entity: String,
    pub kind: StepKind,
    /// Join condition against the parent step, e.g. `Skill.skillSetId = SkillSet.id`.
    pub join: Option<String>,
}

/// Dependency-ordered fetch steps for a query and its include tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub steps: Vec<FetchStep>,
}

impl FetchPlan {
    /// Validate an include tree against the registry and order its fetches
    /// parents first.
    pub fn build(registry: &SchemaRegistry, entity: &str, include: &Include) -> Result<Self> {
        registry.entity(entity)?;
        let mut steps = vec![FetchStep {
            depth: 0,
            path: String::new(),
            entity: entity.to_string(),
            kind: StepKind::Root,
            join: None,
        }];
        let mut level = vec![(String::new(), entity.to_string(), include)];
        let mut depth = 0;
        while !level.is_empty() {
            depth += 1;
            let mut next = Vec::new();
            for (prefix, parent, include) in level {
                for (name, args) in &include.relations {
                    let relation = registry.relation(&parent, name)?;
                    let path = join_path(&prefix, name);
                    if !relation.is_to_many() && !is_plain(args) {
                        return Err(SkillDbError::Configuration(format!(
                            "to-one relation '{parent}.{name}' only accepts include and select"
                        )));
                    }
                    steps.push(FetchStep {
                        depth,
                        path: path.clone(),
                        entity: relation.target.clone(),
                        kind: if relation.is_to_many() {
                            StepKind::ToMany
                        } else {
                            StepKind::ToOne
                        },
                        join: Some(join_condition(&parent, relation)),
                    });
                    next.push((path, relation.target.clone(), &args.include));
                }
                for name in include.counts.keys() {
                    let relation = registry.relation(&parent, name)?;
                    if !relation.is_to_many() {
                        return Err(SkillDbError::Configuration(format!(
                            "_count needs a to-many relation, '{parent}.{name}' is to-one"
                        )));
                    }
                    steps.push(FetchStep {
                        depth,
                        path: join_path(&prefix, &format!("_count.{name}")),
                        entity: relation.target.clone(),
                        kind: StepKind::Count,
                        join: Some(join_condition(&parent, relation)),
                    });
                }
            }
            level = next;
        }
        Ok(FetchPlan { steps })
    }
}

impl fmt::Display for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            let indent = "  ".repeat(step.depth);
            match (&step.kind, &step.join) {
                (StepKind::Root, _) | (_, None) => writeln!(f, "{indent}{}", step.entity)?,
                (kind, Some(join)) => {
                    writeln!(f, "{indent}{} {:?} {} on {join}", step.path, kind, step.entity)?
                }
            }
        }
        Ok(())
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn join_condition(parent: &str, relation: &RelationDescriptor) -> String {
    match &relation.side {
        RelationSide::Owning { foreign_key, .. } => {
            format!("{}.id = {parent}.{foreign_key}", relation.target)
        }
        RelationSide::Inverse { foreign_key, .. } => {
            format!("{}.{foreign_key} = {parent}.id", relation.target)
        }
    }
}

fn is_plain(args: &FindManyArgs) -> bool {
    args.filter.is_none() && !args.is_windowed()
}

/// Turn records into result rows: attach included relations and counts,
/// then apply the `select` projection.
pub fn resolve_rows<S: DataSource>(
    source: &S,
    entity: &str,
    records: Vec<Record>,
    include: &Include,
    select: Option<&[String]>,
) -> Result<Vec<Row>> {
    if !include.is_empty() {
        let plan = FetchPlan::build(source.registry(), entity, include)?;
        log::debug!("fetch plan for {} rows:\n{plan}", records.len());
    }
    resolve_level(source, entity, records, include, select)
}

fn resolve_level<S: DataSource>(
    source: &S,
    entity: &str,
    records: Vec<Record>,
    include: &Include,
    select: Option<&[String]>,
) -> Result<Vec<Row>> {
    let registry = source.registry();

    // Filters are compiled once per level and shared by every parent row
    let mut includes = Vec::with_capacity(include.relations.len());
    for (name, args) in &include.relations {
        let relation = registry.relation(entity, name)?;
        let filter = if relation.is_to_many() {
            Some(CompiledFilter::compile_opt(registry, &relation.target, args.filter.as_ref())?)
        } else {
            None
        };
        includes.push((name, args, relation, filter));
    }
    let mut counted = Vec::with_capacity(include.counts.len());
    for (name, filter) in &include.counts {
        let relation = registry.relation(entity, name)?;
        let filter = CompiledFilter::compile_opt(registry, &relation.target, filter.as_ref())?;
        counted.push((name, relation, filter));
    }
    if let Some(fields) = select {
        let descriptor = registry.entity(entity)?;
        for name in fields {
            descriptor.field(name)?;
        }
    }

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let mut relations = BTreeMap::new();
        for (name, args, relation, filter) in &includes {
            let related = source.related(relation, &record)?;
            let target = relation.target.as_str();
            let resolved = match filter {
                Some(filter) => {
                    let children = select_records(source, target, related, filter, args)?;
                    Related::Many(resolve_level(
                        source,
                        target,
                        children,
                        &args.include,
                        args.select.as_deref(),
                    )?)
                }
                None => match related.into_iter().next() {
                    Some(parent) => {
                        let mut one = resolve_level(
                            source,
                            target,
                            vec![parent],
                            &args.include,
                            args.select.as_deref(),
                        )?;
                        Related::One(one.pop().map(Box::new))
                    }
                    None => Related::One(None),
                },
            };
            relations.insert((*name).clone(), resolved);
        }

        let mut counts = BTreeMap::new();
        for (name, relation, filter) in &counted {
            counts.insert((*name).clone(), count_related(source, relation, &record, filter)?);
        }

        let record = match select {
            Some(fields) => record.project(fields),
            None => record,
        };
        rows.push(Row {
            record,
            relations,
            counts,
        });
    }
    Ok(rows)
}

/// `_count` of a to-many relation for one parent row.
fn count_related<S: DataSource>(
    source: &S,
    relation: &RelationDescriptor,
    record: &Record,
    filter: &CompiledFilter,
) -> Result<u64> {
    match &relation.side {
        RelationSide::Inverse { foreign_key, .. } => {
            let key = Value::String(record.id().to_string());
            source.count_matching(&relation.target, (foreign_key.as_str(), &key), filter)
        }
        RelationSide::Owning { .. } => {
            let mut n = 0;
            for child in source.related(relation, record)? {
                if filter.matches(&child, source)? {
                    n += 1;
                }
            }
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::query::OrderBy;
    use crate::storage::{ChangeSet, Overlay, Storage, View};
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn put(overlay: &mut Overlay, entity: &str, pairs: &[(&str, Value)]) {
        let record: Record = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        overlay
            .entry(entity.to_string())
            .or_default()
            .insert(record.id().to_string(), Some(record));
    }

    /// One user with a profile, two skill sets and three skills.
    fn seeded() -> Storage {
        let storage = Storage::in_memory(SchemaRegistry::builtin().unwrap()).unwrap();
        let mut o = Overlay::new();
        put(&mut o, "User", &[("id", "u1".into()), ("email", "a@x.com".into())]);
        put(&mut o, "User", &[("id", "u2".into()), ("email", "b@x.com".into())]);
        put(
            &mut o,
            "Profile",
            &[
                ("id", "p1".into()),
                ("userId", "u1".into()),
                ("additionalSkills", Value::from(vec!["sql"])),
            ],
        );
        put(&mut o, "SkillSet", &[("id", "s1".into()), ("userId", "u1".into())]);
        put(&mut o, "SkillSet", &[("id", "s2".into()), ("userId", "u1".into())]);
        for (id, set, score) in [("k1", "s1", 80), ("k2", "s1", 30), ("k3", "s2", 60)] {
            put(
                &mut o,
                "Skill",
                &[
                    ("id", id.into()),
                    ("name", id.into()),
                    ("levelScore", score.into()),
                    ("skillSetId", set.into()),
                ],
            );
        }
        storage
            .commit(
                ChangeSet {
                    writes: &o,
                    read_tables: &BTreeMap::new(),
                },
                || Ok(()),
            )
            .unwrap();
        storage
    }

    fn user_rows(storage: &Storage, include: &Include) -> Result<Vec<Row>> {
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let users = view.scan("User", None)?;
        resolve_rows(&view, "User", users, include, None)
    }

    #[test]
    fn test_plan_orders_parents_first() {
        let registry = SchemaRegistry::builtin().unwrap();
        let include = Include::new()
            .relation("profile")
            .with(
                "skillSets",
                FindManyArgs::new().include(Include::new().relation("skills")),
            )
            .count("files");
        let plan = FetchPlan::build(&registry, "User", &include).unwrap();
        let paths: Vec<(usize, &str)> = plan
            .steps
            .iter()
            .map(|s| (s.depth, s.path.as_str()))
            .collect();
        assert_eq!(
            paths,
            vec![
                (0, ""),
                (1, "profile"),
                (1, "skillSets"),
                (1, "_count.files"),
                (2, "skillSets.skills"),
            ]
        );
        assert_eq!(
            plan.steps[4].join.as_deref(),
            Some("Skill.skillSetId = SkillSet.id")
        );
        assert!(plan.to_string().contains("skillSets.skills"));
    }

    #[test]
    fn test_plan_rejects_windowed_to_one() {
        let registry = SchemaRegistry::builtin().unwrap();
        let include = Include::new().with("profile", FindManyArgs::new().take(1));
        let err = FetchPlan::build(&registry, "User", &include).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let count_to_one = Include::new().count("profile");
        let err = FetchPlan::build(&registry, "User", &count_to_one).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let unknown = Include::new().relation("friends");
        let err = FetchPlan::build(&registry, "User", &unknown).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn test_include_nested_relations() {
        let storage = seeded();
        let include = Include::new().relation("profile").with(
            "skillSets",
            FindManyArgs::new().include(Include::new().with(
                "skills",
                FindManyArgs::new().order_by(OrderBy::desc("levelScore")),
            )),
        );
        let rows = user_rows(&storage, &include).unwrap();

        let u1 = &rows[0];
        assert_eq!(u1.one("profile").unwrap().id(), "p1");
        let sets = u1.many("skillSets");
        assert_eq!(sets.len(), 2);
        let skills: Vec<&str> = sets[0].many("skills").iter().map(|r| r.id()).collect();
        assert_eq!(skills, vec!["k1", "k2"]);

        let u2 = &rows[1];
        assert!(u2.one("profile").is_none());
        assert!(u2.many("skillSets").is_empty());
        let json = u2.to_json().unwrap();
        assert!(json["profile"].is_null());
    }

    #[test]
    fn test_include_applies_child_window() {
        let storage = seeded();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let sets = view.scan("SkillSet", None).unwrap();
        let include = Include::new().with(
            "skills",
            FindManyArgs::new()
                .filter(Filter::gt("levelScore", 20))
                .order_by(OrderBy::asc("levelScore"))
                .take(1)
                .select(vec!["name"]),
        );
        let rows = resolve_rows(&view, "SkillSet", sets, &include, None).unwrap();
        let first = &rows[0].many("skills")[0];
        assert_eq!(first.get("name"), &Value::from("k2"));
        assert_eq!(first.record.fields().len(), 1);
    }

    #[test]
    fn test_relation_counts_follow_filter() {
        let storage = seeded();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let sets = view.scan("SkillSet", None).unwrap();
        let include = Include::new().count_where("skills", Filter::gte("levelScore", 60));
        let rows = resolve_rows(&view, "SkillSet", sets, &include, None).unwrap();
        assert_eq!(rows[0].count("skills"), Some(1));
        assert_eq!(rows[1].count("skills"), Some(1));
        assert!(rows[0].many("skills").is_empty());

        let users = user_rows(&storage, &Include::new().count("skillSets")).unwrap();
        assert_eq!(users[0].count("skillSets"), Some(2));
        assert_eq!(users[1].count("skillSets"), Some(0));
    }

    #[test]
    fn test_counts_per_parent_see_staged_writes() {
        let storage = seeded();
        let registry = Arc::clone(storage.registry());
        let mut staged = Overlay::new();
        put(&mut staged, "SkillSet", &[("id", "s3".into()), ("userId", "u2".into())]);
        put(
            &mut staged,
            "Skill",
            &[
                ("id", "k4".into()),
                ("name", "k4".into()),
                ("levelScore", 90.into()),
                ("skillSetId", "s2".into()),
            ],
        );
        staged
            .entry("Skill".to_string())
            .or_default()
            .insert("k1".to_string(), None);

        let view = View::new(&registry, storage.snapshot().unwrap()).with_overlay(&staged);
        let sets = view.scan("SkillSet", None).unwrap();
        let include = Include::new().count_where("skills", Filter::gte("levelScore", 60));
        let rows = resolve_rows(&view, "SkillSet", sets.clone(), &include, None).unwrap();
        let counts: Vec<(&str, Option<u64>)> = rows
            .iter()
            .map(|r| (r.record.id(), r.count("skills")))
            .collect();
        assert_eq!(
            counts,
            vec![("s1", Some(0)), ("s2", Some(2)), ("s3", Some(0))]
        );

        let all = resolve_rows(&view, "SkillSet", sets, &Include::new().count("skills"), None)
            .unwrap();
        let totals: Vec<Option<u64>> = all.iter().map(|r| r.count("skills")).collect();
        assert_eq!(totals, vec![Some(1), Some(2), Some(0)]);

        let committed = View::new(&registry, storage.snapshot().unwrap());
        let s1 = Value::from("s1");
        let low = CompiledFilter::compile(&registry, "Skill", &Filter::lt("levelScore", 50))
            .unwrap();
        assert_eq!(
            committed.count_matching("Skill", ("skillSetId", &s1), &low).unwrap(),
            1
        );
    }
}
