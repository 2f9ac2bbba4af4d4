//! Configuration file parsing
//!
//! Reads schemalog.toml configuration files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::changelog::{FilterExpression, IncludeAllOrder, IncludeResolution, PathPolicy};
use crate::engine::{RunSettings, TableNames};
use crate::ledger::{DEFAULT_LEDGER_TABLE, DEFAULT_ORDER_TABLE};
use crate::lock::DEFAULT_LOCK_TABLE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub changelog: ChangeLogConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub tables: TablesConfig,

    /// Global changelog parameters, overridden by `<property>` declarations.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    pub default_schema: Option<String>,

    /// How long a statement waits on another connection's write lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            default_schema: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeLogConfig {
    /// Root changelog, relative to `search_path`
    #[serde(default = "default_changelog_file")]
    pub file: String,

    /// Directory changelog paths are resolved against
    #[serde(default = "default_search_path")]
    pub search_path: PathBuf,

    #[serde(default)]
    pub include_resolution: IncludeResolution,

    #[serde(default)]
    pub include_all_order: IncludeAllOrder,

    #[serde(default)]
    pub case_insensitive_paths: bool,
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            file: default_changelog_file(),
            search_path: default_search_path(),
            include_resolution: IncludeResolution::default(),
            include_all_order: IncludeAllOrder::default(),
            case_insensitive_paths: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default)]
    pub contexts: Vec<String>,

    /// Label expression, e.g. `"api and !legacy"`
    #[serde(default)]
    pub labels: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TablesConfig {
    #[serde(default = "default_ledger_table")]
    pub ledger: String,

    #[serde(default = "default_lock_table")]
    pub lock: String,

    #[serde(default = "default_order_table")]
    pub order: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            ledger: default_ledger_table(),
            lock: default_lock_table(),
            order: default_order_table(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("schemalog.db")
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_changelog_file() -> String {
    "changelog.xml".to_string()
}

fn default_search_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_wait_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_ledger_table() -> String {
    DEFAULT_LEDGER_TABLE.to_string()
}

fn default_lock_table() -> String {
    DEFAULT_LOCK_TABLE.to_string()
}

fn default_order_table() -> String {
    DEFAULT_ORDER_TABLE.to_string()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.changelog.file.trim().is_empty() {
            return Err(ConfigError::Validation(
                "changelog.file must not be empty".to_string(),
            ));
        }

        for (key, name) in [
            ("tables.ledger", &self.tables.ledger),
            ("tables.lock", &self.tables.lock),
            ("tables.order", &self.tables.order),
        ] {
            if !is_identifier(name) {
                return Err(ConfigError::Validation(format!(
                    "invalid {} value '{}'. Table names must be plain identifiers",
                    key, name
                )));
            }
        }
        if self.tables.ledger.eq_ignore_ascii_case(&self.tables.lock)
            || self.tables.ledger.eq_ignore_ascii_case(&self.tables.order)
            || self.tables.lock.eq_ignore_ascii_case(&self.tables.order)
        {
            return Err(ConfigError::Validation(
                "tables.ledger, tables.lock and tables.order must be distinct".to_string(),
            ));
        }

        if self.lock.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        if let Some(schema) = &self.database.default_schema
            && !is_identifier(schema)
        {
            return Err(ConfigError::Validation(format!(
                "invalid database.default_schema value '{}'",
                schema
            )));
        }

        FilterExpression::parse(&self.run.labels)
            .map_err(|e| ConfigError::Validation(format!("invalid run.labels: {}", e)))?;
        Ok(())
    }

    /// Engine settings, before any command-line overrides.
    pub fn to_run_settings(&self) -> Result<RunSettings, ConfigError> {
        let labels = FilterExpression::parse(&self.run.labels)
            .map_err(|e| ConfigError::Validation(format!("invalid run.labels: {}", e)))?;
        Ok(RunSettings {
            contexts: self
                .run
                .contexts
                .iter()
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
            labels,
            lock_timeout: Duration::from_secs(self.lock.wait_timeout_secs),
            lock_poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
            tables: TableNames {
                ledger: self.tables.ledger.clone(),
                lock: self.tables.lock.clone(),
                order: self.tables.order.clone(),
            },
            path_policy: PathPolicy {
                case_insensitive: self.changelog.case_insensitive_paths,
                include_resolution: self.changelog.include_resolution,
            },
            include_all_order: self.changelog.include_all_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: parse TOML into Config and run validation.
    fn parse_and_validate(toml_str: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tables.ledger, "DATABASECHANGELOG");
        assert_eq!(config.lock.wait_timeout_secs, 300);
        assert_eq!(config.database.busy_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_busy_timeout_is_configurable() {
        let config = parse_and_validate(
            r#"
            [database]
            busy_timeout_ms = 250
            "#,
        )
        .expect("valid config");
        assert_eq!(config.database.busy_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_full_config_round_trips_into_settings() {
        let config = parse_and_validate(
            r#"
            [database]
            path = "app.db"

            [changelog]
            file = "db/main.xml"
            search_path = "resources"
            include_resolution = "relative_to_changelog"
            include_all_order = "natural"
            case_insensitive_paths = true

            [run]
            contexts = ["Test", " prod "]
            labels = "api and !legacy"

            [lock]
            wait_timeout_secs = 5
            poll_interval_ms = 250

            [tables]
            ledger = "CHANGES"

            [parameters]
            schema = "app"
            "#,
        )
        .expect("valid config");

        let settings = config.to_run_settings().expect("settings");
        assert!(settings.contexts.contains("test"));
        assert!(settings.contexts.contains("prod"));
        assert_eq!(settings.labels.as_str(), "api and !legacy");
        assert_eq!(settings.lock_timeout, Duration::from_secs(5));
        assert_eq!(settings.lock_poll_interval, Duration::from_millis(250));
        assert_eq!(settings.tables.ledger, "CHANGES");
        assert_eq!(settings.tables.lock, "DATABASECHANGELOGLOCK");
        assert!(settings.path_policy.case_insensitive);
        assert_eq!(
            settings.path_policy.include_resolution,
            IncludeResolution::RelativeToChangelog
        );
        assert_eq!(settings.include_all_order, IncludeAllOrder::Natural);
        assert_eq!(config.parameters.get("schema").map(String::as_str), Some("app"));
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let err = parse_and_validate("[tables]\nlock = \"bad name; drop\"").unwrap_err();
        assert!(
            err.to_string().contains("invalid tables.lock"),
            "Expected validation error, got: {}",
            err
        );
    }

    #[test]
    fn test_colliding_table_names_rejected() {
        let err = parse_and_validate("[tables]\nledger = \"x\"\nlock = \"X\"").unwrap_err();
        assert!(err.to_string().contains("must be distinct"));
    }

    #[test]
    fn test_bad_label_expression_rejected() {
        let err = parse_and_validate("[run]\nlabels = \"a and (b\"").unwrap_err();
        assert!(err.to_string().contains("invalid run.labels"));
    }

    #[test]
    fn test_unknown_include_resolution_is_parse_error() {
        let err = parse_and_validate("[changelog]\ninclude_resolution = \"sideways\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = parse_and_validate("[lock]\npoll_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }
}
