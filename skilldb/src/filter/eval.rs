use super::compile::{CompiledFieldOp, CompiledFilter};
use super::{FieldOp, RelationQuantifier};
use crate::error::Result;
use crate::record::Record;
use crate::schema::RelationDescriptor;
use crate::value::Value;
use std::cmp::Ordering;

/// Source of related rows for relation filters. Implemented by every read
/// view (committed snapshot or open transaction) so evaluation sees the same
/// data as the enclosing query.
pub trait RelatedRows {
    fn related(&self, relation: &RelationDescriptor, record: &Record) -> Result<Vec<Record>>;
}

impl CompiledFilter {
    /// Evaluate against one record. Pure: the only data consulted besides the
    /// record is what `rows` returns for relation filters.
    pub fn matches(&self, record: &Record, rows: &dyn RelatedRows) -> Result<bool> {
        match self {
            CompiledFilter::Field { field, op } => Ok(op.test(record.get(field))),
            CompiledFilter::And(children) => {
                for child in children {
                    if !child.matches(record, rows)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CompiledFilter::Or(children) => {
                for child in children {
                    if child.matches(record, rows)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CompiledFilter::Not(inner) => Ok(!inner.matches(record, rows)?),
            CompiledFilter::Relation {
                relation,
                quantifier,
                inner,
            } => {
                let related = rows.related(relation, record)?;
                match quantifier {
                    RelationQuantifier::Some => any_match(inner, &related, rows),
                    RelationQuantifier::None => Ok(!any_match(inner, &related, rows)?),
                    RelationQuantifier::Every => {
                        for row in &related {
                            if !inner.matches(row, rows)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    RelationQuantifier::Is => match related.first() {
                        Some(row) => inner.matches(row, rows),
                        None => Ok(false),
                    },
                    RelationQuantifier::IsNot => match related.first() {
                        Some(row) => Ok(!inner.matches(row, rows)?),
                        None => Ok(true),
                    },
                }
            }
        }
    }
}

fn any_match(inner: &CompiledFilter, related: &[Record], rows: &dyn RelatedRows) -> Result<bool> {
    for row in related {
        if inner.matches(row, rows)? {
            return Ok(true);
        }
    }
    Ok(false)
}

impl CompiledFieldOp {
    /// Test a single field value. Comparisons against a null field value are
    /// false except for explicit null checks and `not`/`notIn`, which never
    /// match null either.
    pub fn test(&self, value: &Value) -> bool {
        let ci = self.insensitive;
        match &self.op {
            FieldOp::Equals(expected) => value.matches(expected, ci),
            FieldOp::Not(expected) => {
                if expected.is_null() {
                    !value.is_null()
                } else {
                    !value.is_null() && !value.matches(expected, ci)
                }
            }
            FieldOp::In(options) => {
                !value.is_null() && options.iter().any(|o| value.matches(o, ci))
            }
            FieldOp::NotIn(options) => {
                !value.is_null() && !options.iter().any(|o| value.matches(o, ci))
            }
            FieldOp::Lt(bound) => ordering(value, bound, ci) == Some(Ordering::Less),
            FieldOp::Lte(bound) => matches!(
                ordering(value, bound, ci),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FieldOp::Gt(bound) => ordering(value, bound, ci) == Some(Ordering::Greater),
            FieldOp::Gte(bound) => matches!(
                ordering(value, bound, ci),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FieldOp::Contains(needle) => string_test(value, needle, ci, |h, n| h.contains(n)),
            FieldOp::StartsWith(prefix) => {
                string_test(value, prefix, ci, |h, n| h.starts_with(n))
            }
            FieldOp::EndsWith(suffix) => string_test(value, suffix, ci, |h, n| h.ends_with(n)),
            FieldOp::IsNull(expected) => value.is_null() == *expected,
            FieldOp::Has(element) => list(value).iter().any(|v| v.matches(element, ci)),
            FieldOp::HasEvery(elements) => {
                let items = list(value);
                elements
                    .iter()
                    .all(|e| items.iter().any(|v| v.matches(e, ci)))
            }
            FieldOp::HasSome(elements) => {
                let items = list(value);
                elements
                    .iter()
                    .any(|e| items.iter().any(|v| v.matches(e, ci)))
            }
            FieldOp::IsEmpty(expected) => list(value).is_empty() == *expected,
        }
    }
}

fn list(value: &Value) -> &[Value] {
    value.as_list().unwrap_or(&[])
}

fn ordering(value: &Value, bound: &Value, insensitive: bool) -> Option<Ordering> {
    match (value, bound) {
        (Value::String(a), Value::String(b)) if insensitive => {
            Some(a.to_lowercase().cmp(&b.to_lowercase()))
        }
        _ => value.compare(bound),
    }
}

fn string_test(value: &Value, needle: &str, insensitive: bool, f: fn(&str, &str) -> bool) -> bool {
    let Some(haystack) = value.as_str() else {
        return false;
    };
    if insensitive {
        f(&haystack.to_lowercase(), &needle.to_lowercase())
    } else {
        f(haystack, needle)
    }
}
