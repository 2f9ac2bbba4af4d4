//! Database capability
//!
//! The engine talks to the target database only through the narrow
//! [`Database`] trait. Dialect differences (quoting, literal syntax, whether
//! DDL can run inside a transaction) live on [`Dialect`], which each
//! connection resolves once when it is opened.

use thiserror::Error;

pub mod dialect;
pub mod sqlite;

pub use dialect::Dialect;
pub use sqlite::SqliteDatabase;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    #[error("statement failed: {message}\n  statement: {statement}")]
    Statement { statement: String, message: String },

    /// Another connection held a conflicting lock past the busy timeout.
    #[error("database is busy: {message}\n  statement: {statement}")]
    Busy { statement: String, message: String },

    #[error("transaction {operation} failed: {message}")]
    Transaction {
        operation: &'static str,
        message: String,
    },
}

impl DatabaseError {
    pub fn is_busy(&self) -> bool {
        matches!(self, DatabaseError::Busy { .. })
    }
}

/// One result row. Every column is exposed as optional text, which is all
/// the lock and ledger readers need.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn integer(&self, index: usize) -> Option<i64> {
        self.text(index).and_then(|v| v.trim().parse().ok())
    }

    /// Boolean column as stored by any dialect (`1`, `true`, `t`, `y`).
    pub fn boolean(&self, index: usize) -> Option<bool> {
        self.text(index).map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "t" | "y" | "yes"
            )
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Capability object for one open connection to the target database.
pub trait Database {
    /// Dialect resolved at connection time.
    fn dialect(&self) -> Dialect;

    fn product_name(&self) -> &str;

    fn product_version(&self) -> &str;

    /// Schema used when a changeset does not name one.
    fn default_schema(&self) -> Option<&str>;

    /// Execute one statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str) -> Result<usize, DatabaseError>;

    /// Run a query and return every row.
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DatabaseError>;

    fn begin(&mut self) -> Result<(), DatabaseError>;

    fn commit(&mut self) -> Result<(), DatabaseError>;

    fn rollback(&mut self) -> Result<(), DatabaseError>;

    fn table_exists(&mut self, schema: Option<&str>, table: &str) -> Result<bool, DatabaseError>;

    fn supports_ddl_in_transaction(&self) -> bool {
        self.dialect().supports_ddl_in_transaction()
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        self.dialect().quote_identifier(identifier)
    }

    fn quote_literal(&self, value: &str) -> String {
        self.dialect().quote_literal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_accessors() {
        let row = Row::new(vec![
            Some("42".to_string()),
            None,
            Some("t".to_string()),
            Some("0".to_string()),
        ]);
        assert_eq!(row.integer(0), Some(42));
        assert_eq!(row.text(1), None);
        assert_eq!(row.boolean(2), Some(true));
        assert_eq!(row.boolean(3), Some(false));
        assert_eq!(row.text(10), None);
        assert_eq!(row.len(), 4);
    }
}
