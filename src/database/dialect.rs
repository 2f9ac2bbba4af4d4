//! SQL dialect differences between supported database products.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// SQL dialect variant tag, resolved once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
    MsSql,
    Oracle,
    H2,
    Generic,
}

impl Dialect {
    /// Resolve a dialect from the product name a driver reports.
    pub fn from_product_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("sqlite") {
            Dialect::Sqlite
        } else if lower.contains("postgres") {
            Dialect::Postgres
        } else if lower.contains("mysql") || lower.contains("mariadb") {
            Dialect::MySql
        } else if lower.contains("microsoft") || lower.contains("sql server") || lower == "mssql" {
            Dialect::MsSql
        } else if lower.contains("oracle") {
            Dialect::Oracle
        } else if lower == "h2" {
            Dialect::H2
        } else {
            Dialect::Generic
        }
    }

    /// Short lowercase name matched by `dbms` filters and preconditions.
    pub fn type_name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
            Dialect::MsSql => "mssql",
            Dialect::Oracle => "oracle",
            Dialect::H2 => "h2",
            Dialect::Generic => "unknown",
        }
    }

    pub fn supports_ddl_in_transaction(&self) -> bool {
        matches!(self, Dialect::Sqlite | Dialect::Postgres | Dialect::MsSql)
    }

    pub fn quote_identifier(&self, identifier: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", identifier.replace('`', "``")),
            Dialect::MsSql => format!("[{}]", identifier.replace(']', "]]")),
            _ => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    pub fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Quote a value, or emit `NULL` when absent.
    pub fn nullable_literal(&self, value: Option<&str>) -> String {
        match value {
            Some(v) => self.quote_literal(v),
            None => "NULL".to_string(),
        }
    }

    pub fn boolean_type(&self) -> &'static str {
        match self {
            Dialect::Oracle => "NUMBER(1)",
            Dialect::MsSql => "BIT",
            _ => "BOOLEAN",
        }
    }

    pub fn boolean_literal(&self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Postgres | Dialect::H2, true) => "TRUE",
            (Dialect::Postgres | Dialect::H2, false) => "FALSE",
            (_, true) => "1",
            (_, false) => "0",
        }
    }

    pub fn varchar_type(&self, length: u32) -> String {
        match self {
            Dialect::Oracle => format!("VARCHAR2({})", length),
            _ => format!("VARCHAR({})", length),
        }
    }

    pub fn timestamp_type(&self) -> &'static str {
        match self {
            Dialect::MySql | Dialect::MsSql => "DATETIME",
            _ => "TIMESTAMP",
        }
    }

    pub fn timestamp_literal(&self, at: DateTime<Utc>) -> String {
        let text = at.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        match self {
            Dialect::Postgres | Dialect::Oracle | Dialect::H2 => format!("TIMESTAMP '{}'", text),
            _ => format!("'{}'", text),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}
