// Records returned by the engine: flat field maps plus resolved relations

use crate::error::{Result, SkillDbError};
use crate::schema::{EntityDescriptor, ID_FIELD};
use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

static NULL: Value = Value::Null;

/// One stored row: field name to value, always including `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> &str {
        self.get(ID_FIELD).as_str().unwrap_or_default()
    }

    /// Value of a field, `Null` when the field is absent.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Keep only the selected fields.
    pub fn project(&self, select: &[String]) -> Record {
        Record {
            fields: self
                .fields
                .iter()
                .filter(|(name, _)| select.iter().any(|s| s == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }

    /// Decode a JSON object against an entity descriptor. Missing nullable
    /// fields become `Null`, missing list fields become empty lists.
    pub fn from_json(entity: &EntityDescriptor, json: &serde_json::Value) -> Result<Record> {
        let object = json.as_object().ok_or_else(|| {
            SkillDbError::Validation(format!("{} row must be a JSON object", entity.name))
        })?;

        let mut record = Record::new();
        for (name, raw) in object {
            let field = entity.field(name)?;
            let value = Value::from_json(raw, field.ty, field.list).ok_or_else(|| {
                SkillDbError::type_mismatch(
                    &entity.name,
                    name,
                    format!("stored value {raw} does not fit {}", field.ty.name()),
                )
            })?;
            record.set(name.clone(), value);
        }
        for field in entity.fields.values() {
            if !record.fields.contains_key(&field.name) {
                let empty = if field.list {
                    Value::List(Vec::new())
                } else {
                    Value::Null
                };
                record.set(field.name.clone(), empty);
            }
        }
        Ok(record)
    }

    /// Deserialize into a typed model.
    pub fn into_model<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Record {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Related rows attached to a [`Row`] by an include.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Related {
    One(Option<Box<Row>>),
    Many(Vec<Row>),
}

/// A query result: the (possibly projected) record, included relations and
/// `_count` projections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    #[serde(flatten)]
    pub record: Record,
    #[serde(flatten)]
    pub relations: BTreeMap<String, Related>,
    #[serde(rename = "_count", skip_serializing_if = "BTreeMap::is_empty")]
    pub counts: BTreeMap<String, u64>,
}

impl Row {
    pub fn new(record: Record) -> Self {
        Row {
            record,
            relations: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.record.id()
    }

    pub fn get(&self, field: &str) -> &Value {
        self.record.get(field)
    }

    /// Included to-one relation, `None` when absent or not included.
    pub fn one(&self, relation: &str) -> Option<&Row> {
        match self.relations.get(relation) {
            Some(Related::One(Some(row))) => Some(&**row),
            _ => None,
        }
    }

    /// Included to-many relation, empty when not included.
    pub fn many(&self, relation: &str) -> &[Row] {
        match self.relations.get(relation) {
            Some(Related::Many(rows)) => rows.as_slice(),
            _ => &[],
        }
    }

    pub fn count(&self, relation: &str) -> Option<u64> {
        self.counts.get(relation).copied()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize into a typed model; included relations are available to
    /// models that declare them.
    pub fn into_model<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }
}

impl From<Record> for Row {
    fn from(record: Record) -> Self {
        Row::new(record)
    }
}
