use super::{FindManyArgs, FindUniqueArgs, OrderBy, SortOrder, UniqueWhere};
use crate::error::{Result, SkillDbError};
use crate::filter::CompiledFilter;
use crate::record::{Record, Row};
use crate::relation::resolve_rows;
use crate::schema::{EntityDescriptor, ID_FIELD};
use crate::storage::DataSource;
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Look up one record by a unique key, without relations.
pub fn find_unique_record<S: DataSource>(
    source: &S,
    entity: &str,
    key: &UniqueWhere,
) -> Result<Option<Record>> {
    let descriptor = source.registry().entity(entity)?;
    let key = key.resolve(descriptor)?;
    if key.is_id() {
        let id = key.fields()[0].1.as_str().unwrap_or_default();
        return source.get(entity, id);
    }
    let (field, value) = &key.fields()[0];
    let candidates = source.scan(entity, Some((field.as_str(), value)))?;
    Ok(candidates.into_iter().find(|r| key.matches(r)))
}

pub fn find_unique<S: DataSource>(
    source: &S,
    entity: &str,
    args: &FindUniqueArgs,
) -> Result<Option<Row>> {
    let Some(record) = find_unique_record(source, entity, &args.key)? else {
        return Ok(None);
    };
    let mut rows = resolve_rows(source, entity, vec![record], &args.include, args.select.as_deref())?;
    Ok(rows.pop())
}

pub fn find_unique_or_throw<S: DataSource>(
    source: &S,
    entity: &str,
    args: &FindUniqueArgs,
) -> Result<Row> {
    find_unique(source, entity, args)?.ok_or_else(|| SkillDbError::NotFound {
        entity: entity.to_string(),
        key: args.key.to_string(),
    })
}

/// Filtered, ordered and paginated records of one entity, without relations.
pub fn find_records<S: DataSource>(
    source: &S,
    entity: &str,
    args: &FindManyArgs,
) -> Result<Vec<Record>> {
    let filter = CompiledFilter::compile_opt(source.registry(), entity, args.filter.as_ref())?;
    let candidates = source.scan(entity, filter.equality_hint())?;
    select_records(source, entity, candidates, &filter, args)
}

pub fn find_many<S: DataSource>(
    source: &S,
    entity: &str,
    args: &FindManyArgs,
) -> Result<Vec<Row>> {
    let records = find_records(source, entity, args)?;
    resolve_rows(source, entity, records, &args.include, args.select.as_deref())
}

pub fn find_first<S: DataSource>(
    source: &S,
    entity: &str,
    args: &FindManyArgs,
) -> Result<Option<Row>> {
    let mut first = args.clone();
    first.take = Some(match args.take {
        Some(t) if t < 0 => -1,
        _ => 1,
    });
    Ok(find_many(source, entity, &first)?.pop())
}

pub fn find_first_or_throw<S: DataSource>(
    source: &S,
    entity: &str,
    args: &FindManyArgs,
) -> Result<Row> {
    find_first(source, entity, args)?.ok_or_else(|| SkillDbError::NotFound {
        entity: entity.to_string(),
        key: "first match".to_string(),
    })
}

/// Number of records `find_many` would return for the same arguments.
pub fn count<S: DataSource>(source: &S, entity: &str, args: &FindManyArgs) -> Result<u64> {
    Ok(find_records(source, entity, args)?.len() as u64)
}

/// Apply a compiled filter and the ordering/pagination window of `args` to
/// candidate rows of `entity`.
pub(crate) fn select_records<S: DataSource>(
    source: &S,
    entity: &str,
    candidates: Vec<Record>,
    filter: &CompiledFilter,
    args: &FindManyArgs,
) -> Result<Vec<Record>> {
    let descriptor = source.registry().entity(entity)?;
    validate_window(descriptor, args)?;

    let mut matched = Vec::with_capacity(candidates.len());
    for record in candidates {
        if filter.matches(&record, source)? {
            matched.push(record);
        }
    }
    apply_window(descriptor, matched, args)
}

fn validate_window(entity: &EntityDescriptor, args: &FindManyArgs) -> Result<()> {
    for order in &args.order_by {
        let field = entity.field(&order.field)?;
        if !field.is_orderable() {
            return Err(SkillDbError::type_mismatch(
                &entity.name,
                &order.field,
                "list fields cannot be ordered",
            ));
        }
    }
    for name in &args.distinct {
        entity.field(name)?;
    }
    if let Some(select) = &args.select {
        for name in select {
            entity.field(name)?;
        }
    }
    if let Some(cursor) = &args.cursor {
        cursor.resolve(entity)?;
        // Ordering always ends on id, so an id cursor is positioned without it
        for (name, _) in cursor.fields() {
            if name != ID_FIELD && !args.order_by.iter().any(|o| &o.field == name) {
                return Err(SkillDbError::Configuration(format!(
                    "Cursor field '{}.{name}' must appear in orderBy",
                    entity.name
                )));
            }
        }
    }
    Ok(())
}

fn apply_window(
    entity: &EntityDescriptor,
    mut records: Vec<Record>,
    args: &FindManyArgs,
) -> Result<Vec<Record>> {
    records.sort_by(|a, b| compare_records(a, b, &args.order_by));

    if !args.distinct.is_empty() {
        let mut seen = HashSet::new();
        records.retain(|r| {
            let key: Vec<String> = args
                .distinct
                .iter()
                .map(|f| r.get(f).index_key())
                .collect();
            seen.insert(key)
        });
    }

    let cursor_pos = match &args.cursor {
        Some(cursor) => {
            let cursor = cursor.resolve(entity)?;
            match records.iter().position(|r| cursor.matches(r)) {
                Some(pos) => Some(pos),
                None => return Ok(Vec::new()),
            }
        }
        None => None,
    };

    let len = records.len();
    let skip = args.skip.unwrap_or(0);
    let (start, end) = match args.take {
        Some(take) if take < 0 => {
            let end = cursor_pos.map(|p| p + 1).unwrap_or(len).saturating_sub(skip);
            let start = end.saturating_sub(take.unsigned_abs() as usize);
            (start, end)
        }
        take => {
            let start = (cursor_pos.unwrap_or(0) + skip).min(len);
            let end = match take {
                Some(t) => start.saturating_add(t as usize).min(len),
                None => len,
            };
            (start, end)
        }
    };

    Ok(records.drain(start..end).collect())
}

fn compare_records(a: &Record, b: &Record, order_by: &[OrderBy]) -> Ordering {
    for order in order_by {
        let ord = compare_values(
            a.get(&order.field),
            b.get(&order.field),
            order.order,
            order.puts_nulls_first(),
        );
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id().cmp(b.id())
}

pub(crate) fn compare_values(
    a: &Value,
    b: &Value,
    order: SortOrder,
    nulls_first: bool,
) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let ord = a.compare(b).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::filter::Filter;
    use crate::query::NullsOrder;
    use crate::schema::SchemaRegistry;
    use crate::storage::{ChangeSet, Overlay, Storage, View};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn skill(id: &str, name: &str, category: &str, score: i64, description: Option<&str>) -> Record {
        let mut r = Record::new();
        r.set("id", id);
        r.set("name", name);
        r.set("category", category);
        r.set("levelScore", score);
        r.set("description", description);
        r.set("skillSetId", "s1");
        r
    }

    /// Storage holding one user, one skill set and the given skills.
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

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id()).collect()
    }

    fn sample() -> Storage {
        storage_with(vec![
            skill("k1", "Go", "backend", 80, None),
            skill("k2", "Rust", "backend", 90, Some("systems")),
            skill("k3", "CSS", "frontend", 40, None),
            skill("k4", "React", "frontend", 70, Some("ui")),
            skill("k5", "SQL", "data", 70, None),
        ])
    }

    #[test]
    fn test_order_with_id_tie_break() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new().order_by(OrderBy::desc("levelScore"));
        let records = find_records(&view, "Skill", &args).unwrap();
        assert_eq!(ids(&records), vec!["k2", "k1", "k4", "k5", "k3"]);
    }

    #[test]
    fn test_null_placement_in_ordering() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());

        let asc = FindManyArgs::new().order_by(OrderBy::asc("description"));
        assert_eq!(
            ids(&find_records(&view, "Skill", &asc).unwrap()),
            vec!["k2", "k4", "k1", "k3", "k5"]
        );
        let first = FindManyArgs::new()
            .order_by(OrderBy::asc("description").with_nulls(NullsOrder::First));
        assert_eq!(
            ids(&find_records(&view, "Skill", &first).unwrap()),
            vec!["k1", "k3", "k5", "k2", "k4"]
        );
    }

    #[test]
    fn test_cursor_pages_concatenate_to_full_listing() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let base = FindManyArgs::new()
            .order_by(OrderBy::asc("levelScore"))
            .order_by(OrderBy::asc("id"));
        let full = find_records(&view, "Skill", &base).unwrap();

        let mut paged = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut args = base.clone().take(2);
            if let Some(id) = &cursor {
                args = args.cursor(UniqueWhere::id(id.clone())).skip(1);
            }
            let page = find_records(&view, "Skill", &args).unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|r| r.id().to_string());
            paged.extend(page);
        }
        assert_eq!(ids(&paged), ids(&full));
    }

    #[test]
    fn test_negative_take_reads_backwards_from_cursor() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new()
            .order_by(OrderBy::asc("id"))
            .cursor(UniqueWhere::id("k4"))
            .skip(1)
            .take(-2);
        assert_eq!(ids(&find_records(&view, "Skill", &args).unwrap()), vec!["k2", "k3"]);

        let last_two = FindManyArgs::new().order_by(OrderBy::asc("id")).take(-2);
        assert_eq!(ids(&find_records(&view, "Skill", &last_two).unwrap()), vec!["k4", "k5"]);
    }

    #[test]
    fn test_cursor_requires_ordered_field() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new()
            .cursor(UniqueWhere::field("email", "a@x.com"))
            .take(2);
        let err = find_records(&view, "User", &args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let by_name = args.order_by(OrderBy::asc("name"));
        let err = find_records(&view, "User", &by_name).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let by_email = FindManyArgs::new()
            .order_by(OrderBy::asc("email"))
            .cursor(UniqueWhere::field("email", "a@x.com"));
        assert_eq!(ids(&find_records(&view, "User", &by_email).unwrap()), vec!["u1"]);
    }

    #[test]
    fn test_id_cursor_follows_tie_break_order() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());

        let unordered = FindManyArgs::new().cursor(UniqueWhere::id("k2")).skip(1).take(2);
        assert_eq!(ids(&find_records(&view, "Skill", &unordered).unwrap()), vec!["k3", "k4"]);

        // k4 and k5 tie on levelScore; id decides which page k5 lands on
        let by_score = FindManyArgs::new()
            .order_by(OrderBy::desc("levelScore"))
            .cursor(UniqueWhere::id("k4"))
            .skip(1);
        assert_eq!(ids(&find_records(&view, "Skill", &by_score).unwrap()), vec!["k5", "k3"]);
    }

    #[test]
    fn test_unknown_cursor_yields_empty_page() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new()
            .order_by(OrderBy::asc("id"))
            .cursor(UniqueWhere::id("missing"));
        assert!(find_records(&view, "Skill", &args).unwrap().is_empty());
    }

    #[test]
    fn test_distinct_keeps_first_in_order() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new()
            .order_by(OrderBy::desc("levelScore"))
            .distinct(vec!["category"]);
        let records = find_records(&view, "Skill", &args).unwrap();
        assert_eq!(ids(&records), vec!["k2", "k4", "k5"]);
    }

    #[test]
    fn test_offset_pagination_and_count() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new()
            .filter(Filter::eq("category", "backend").insensitive())
            .order_by(OrderBy::asc("name"));
        assert_eq!(count(&view, "Skill", &args).unwrap(), 2);
        let second = args.clone().skip(1).take(5);
        assert_eq!(ids(&find_records(&view, "Skill", &second).unwrap()), vec!["k2"]);
        let past_end = args.skip(10);
        assert!(find_records(&view, "Skill", &past_end).unwrap().is_empty());
    }

    #[test]
    fn test_find_unique_by_declared_keys() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());

        let user = find_unique_record(&view, "User", &UniqueWhere::field("email", "a@x.com"))
            .unwrap()
            .unwrap();
        assert_eq!(user.id(), "u1");
        assert!(find_unique_record(&view, "User", &UniqueWhere::id("nobody"))
            .unwrap()
            .is_none());

        let err = find_unique_or_throw(&view, "User", &UniqueWhere::id("nobody").into())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = find_unique_record(&view, "Skill", &UniqueWhere::field("name", "Go"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_find_first_respects_order() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new()
            .filter(Filter::eq("category", "frontend"))
            .order_by(OrderBy::desc("levelScore"));
        let first = find_first(&view, "Skill", &args).unwrap().unwrap();
        assert_eq!(first.id(), "k4");

        let none = FindManyArgs::new().filter(Filter::eq("category", "ops"));
        let err = find_first_or_throw(&view, "Skill", &none).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_relation_filter_through_owning_side() {
        let storage = sample();
        let registry = Arc::clone(storage.registry());
        let view = View::new(&registry, storage.snapshot().unwrap());
        let args = FindManyArgs::new()
            .filter(Filter::is("skillSet", Filter::eq("userId", "u1")))
            .order_by(OrderBy::desc("levelScore"))
            .take(1);
        let records = find_records(&view, "Skill", &args).unwrap();
        assert_eq!(ids(&records), vec!["k2"]);
    }
}
