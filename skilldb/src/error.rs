use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkillDbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Type mismatch on {entity}.{field}: {message}")]
    TypeMismatch {
        entity: String,
        field: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid groupBy: {0}")]
    InvalidGroupBy(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record not found: {entity} where {key}")]
    NotFound { entity: String, key: String },

    #[error("Unique constraint violated on {entity}.{field}")]
    UniqueConstraintViolation { entity: String, field: String },

    #[error("Referential integrity violation on {entity}.{field}")]
    ReferentialIntegrity { entity: String, field: String },

    #[error("Transaction timeout: {0}")]
    TransactionTimeout(String),

    #[error("Nested transactions are not supported")]
    NestedTransaction,

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Operation cancelled before it was applied")]
    Cancelled,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fieldless classification of [`SkillDbError`] for callers that map errors
/// onto their own response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Schema,
    TypeMismatch,
    Configuration,
    InvalidGroupBy,
    Validation,
    NotFound,
    UniqueConstraintViolation,
    ReferentialIntegrity,
    TransactionTimeout,
    NestedTransaction,
    TransactionConflict,
    Cancelled,
    StorageUnavailable,
    Serialization,
}

impl SkillDbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SkillDbError::Schema(_) => ErrorKind::Schema,
            SkillDbError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            SkillDbError::Configuration(_) => ErrorKind::Configuration,
            SkillDbError::InvalidGroupBy(_) => ErrorKind::InvalidGroupBy,
            SkillDbError::Validation(_) => ErrorKind::Validation,
            SkillDbError::NotFound { .. } => ErrorKind::NotFound,
            SkillDbError::UniqueConstraintViolation { .. } => {
                ErrorKind::UniqueConstraintViolation
            }
            SkillDbError::ReferentialIntegrity { .. } => ErrorKind::ReferentialIntegrity,
            SkillDbError::TransactionTimeout(_) => ErrorKind::TransactionTimeout,
            SkillDbError::NestedTransaction => ErrorKind::NestedTransaction,
            SkillDbError::TransactionConflict(_) => ErrorKind::TransactionConflict,
            SkillDbError::Cancelled => ErrorKind::Cancelled,
            SkillDbError::StorageUnavailable(_) | SkillDbError::Io(_) => {
                ErrorKind::StorageUnavailable
            }
            SkillDbError::Yaml(_) | SkillDbError::Json(_) => ErrorKind::Serialization,
        }
    }

    /// Whether the whole operation may be attempted again as-is.
    /// Writes that failed with `StorageUnavailable` may still have committed;
    /// callers must check before retrying them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StorageUnavailable
                | ErrorKind::TransactionConflict
                | ErrorKind::TransactionTimeout
        )
    }

    pub(crate) fn type_mismatch(
        entity: &str,
        field: &str,
        message: impl Into<String>,
    ) -> Self {
        SkillDbError::TypeMismatch {
            entity: entity.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn unique(entity: &str, field: &str) -> Self {
        SkillDbError::UniqueConstraintViolation {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }

    pub(crate) fn integrity(entity: &str, field: &str) -> Self {
        SkillDbError::ReferentialIntegrity {
            entity: entity.to_string(),
            field: field.to_string(),
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        SkillDbError::StorageUnavailable(format!("{what} lock poisoned"))
    }
}

impl From<rusqlite::Error> for SkillDbError {
    fn from(e: rusqlite::Error) -> Self {
        SkillDbError::StorageUnavailable(format!("SQLite: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SkillDbError>;
