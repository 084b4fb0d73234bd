use super::types::SchemaDefinition;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// The built-in schema for users and their skill and learning records
pub const BUILTIN_SCHEMA: &str = include_str!("schema.yaml");

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}

/// Fingerprint of a schema source, recorded in the journal history: the
/// first 8 bytes of its SHA-256, hex encoded.
pub fn hash_schema(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest[..8].iter().fold(String::with_capacity(16), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_schema_hash_is_fixed_across_builds() {
        assert_eq!(hash_schema(""), "e3b0c44298fc1c14");
        assert_eq!(hash_schema("abc"), "ba7816bf8f01cfea");
        assert_ne!(hash_schema(BUILTIN_SCHEMA), hash_schema(&format!("{BUILTIN_SCHEMA}\n")));
    }

    #[test]
    fn test_builtin_schema_parses() {
        let schema = parse_schema_str(BUILTIN_SCHEMA).unwrap();
        assert!(schema.entities.contains_key("User"));
    }
}
