mod parser;
mod registry;
mod types;

pub use parser::{hash_schema, parse_schema_str, BUILTIN_SCHEMA};
pub use registry::{
    Cardinality, DefaultValue, EntityDescriptor, FieldDescriptor, RelationDescriptor,
    RelationSide, SchemaRegistry, UniqueConstraint, ID_FIELD,
};
pub use types::{
    AutoIdStrategy, EntityDefinition, FieldDefinition, FieldType, IdConfig, OnDeletePolicy,
    RelationDefinition, SchemaDefinition,
};
