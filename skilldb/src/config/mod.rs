use crate::error::{Result, SkillDbError};
use crate::transaction::{IsolationLevel, TransactionOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DATABASE_PATH: &str = "SKILLDB_DATABASE_PATH";
pub const ENV_ISOLATION_LEVEL: &str = "SKILLDB_ISOLATION_LEVEL";
pub const ENV_MAX_WAIT_MS: &str = "SKILLDB_MAX_WAIT_MS";
pub const ENV_TIMEOUT_MS: &str = "SKILLDB_TIMEOUT_MS";
pub const ENV_MAX_CONCURRENT_TRANSACTIONS: &str = "SKILLDB_MAX_CONCURRENT_TRANSACTIONS";

/// Store settings, loaded from YAML and overridable from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite journal location; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub isolation_level: IsolationLevel,
    pub max_wait_ms: u64,
    pub timeout_ms: u64,
    pub max_concurrent_transactions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_path: None,
            isolation_level: IsolationLevel::ReadCommitted,
            max_wait_ms: 2000,
            timeout_ms: 5000,
            max_concurrent_transactions: 16,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)
            .map_err(|e| SkillDbError::Configuration(format!("invalid store config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Apply `SKILLDB_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply `SKILLDB_*` overrides read through `lookup`.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup(ENV_DATABASE_PATH) {
            self.database_path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(level) = lookup(ENV_ISOLATION_LEVEL) {
            self.isolation_level = level.parse()?;
        }
        if let Some(ms) = lookup(ENV_MAX_WAIT_MS) {
            self.max_wait_ms = parse_number(ENV_MAX_WAIT_MS, &ms)?;
        }
        if let Some(ms) = lookup(ENV_TIMEOUT_MS) {
            self.timeout_ms = parse_number(ENV_TIMEOUT_MS, &ms)?;
        }
        if let Some(n) = lookup(ENV_MAX_CONCURRENT_TRANSACTIONS) {
            self.max_concurrent_transactions = parse_number(ENV_MAX_CONCURRENT_TRANSACTIONS, &n)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transactions == 0 {
            return Err(SkillDbError::Configuration(
                "max_concurrent_transactions must be at least 1".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(SkillDbError::Configuration(
                "timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Budget applied to transactions that do not bring their own options.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions::new()
            .max_wait(Duration::from_millis(self.max_wait_ms))
            .timeout(Duration::from_millis(self.timeout_ms))
            .isolation_level(self.isolation_level)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| SkillDbError::Configuration(format!("{name}: '{raw}' is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_yaml_with_defaults() {
        let config = StoreConfig::from_yaml(
            "database_path: /var/lib/skilldb/skills.db\nisolation_level: serializable\n",
        )
        .unwrap();
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/skilldb/skills.db"))
        );
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        assert_eq!(config.max_wait_ms, 2000);
        assert_eq!(config.max_concurrent_transactions, 16);

        let options = config.transaction_options();
        assert_eq!(options.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = StoreConfig::from_yaml("max_wait: 10\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DATABASE_PATH, "/tmp/skills.db"),
            (ENV_ISOLATION_LEVEL, "repeatable-read"),
            (ENV_TIMEOUT_MS, "250"),
        ]
        .into_iter()
        .collect();
        let config = StoreConfig::default()
            .apply_env_from(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/skills.db")));
        assert_eq!(config.isolation_level, IsolationLevel::RepeatableRead);
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.max_wait_ms, 2000);
    }

    #[test]
    fn test_bad_env_values() {
        let err = StoreConfig::default()
            .apply_env_from(|name| (name == ENV_MAX_WAIT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = StoreConfig::default()
            .apply_env_from(|name| (name == ENV_MAX_CONCURRENT_TRANSACTIONS).then(|| "0".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
