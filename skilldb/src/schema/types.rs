use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level schema definition parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub entities: BTreeMap<String, EntityDefinition>,
}

/// Definition of a single entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    #[serde(default)]
    pub id: IdConfig,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationDefinition>,
    /// Compound unique keys, each a list of field names
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
}

/// Configuration for primary id generation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdConfig {
    #[serde(default)]
    pub auto: AutoIdStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    #[default]
    Ulid,
    Uuid,
    Nanoid,
}

/// Definition of a single scalar field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub list: bool,
    /// Literal default, or the string `now()` for datetime fields
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    /// Refreshed by the engine on every successful write of the row
    #[serde(default)]
    pub updated_at: bool,
}

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Boolean,
    #[serde(rename = "datetime")]
    DateTime,
}

/// Definition of a relation. The owning side names the local foreign key;
/// the inverse side names the owning relation on the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub target: String,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub mapped_by: Option<String>,
    #[serde(default)]
    pub on_delete: Option<OnDeletePolicy>,
}

/// On-delete referential integrity policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDeletePolicy {
    #[default]
    Restrict,
    Cascade,
    SetNull,
}
