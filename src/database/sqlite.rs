//! SQLite implementation of the database capability, backed by `rusqlite`.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use rusqlite::types::ValueRef;
use tracing::debug;

use crate::database::{Database, DatabaseError, Dialect, Row};

/// How long a statement waits on a database locked by another connection
/// before failing with `SQLITE_BUSY`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteDatabase {
    conn: Connection,
    target: String,
    version: String,
    schema: String,
}

impl SqliteDatabase {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let target = path.display().to_string();
        let conn = Connection::open(path).map_err(|e| DatabaseError::Connect {
            target: target.clone(),
            message: e.to_string(),
        })?;
        Self::from_connection(conn, target)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory().map_err(|e| DatabaseError::Connect {
            target: ":memory:".to_string(),
            message: e.to_string(),
        })?;
        Self::from_connection(conn, ":memory:".to_string())
    }

    fn from_connection(conn: Connection, target: String) -> Result<Self, DatabaseError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .map_err(|e| DatabaseError::Connect {
                target: target.clone(),
                message: e.to_string(),
            })?;
        debug!(database = %target, "opened sqlite database");
        Ok(Self {
            conn,
            target,
            version: rusqlite::version().to_string(),
            schema: "main".to_string(),
        })
    }

    /// Report `schema` as the default schema. It must name the main
    /// database or one attached to this connection.
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self, DatabaseError> {
        self.conn
            .busy_timeout(timeout)
            .map_err(|e| DatabaseError::Connect {
                target: self.target.clone(),
                message: e.to_string(),
            })?;
        Ok(self)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn transaction_statement(
        &mut self,
        operation: &'static str,
        sql: &str,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| DatabaseError::Transaction {
                operation,
                message: e.to_string(),
            })
    }
}

fn statement_error(sql: &str, err: rusqlite::Error) -> DatabaseError {
    let statement = sql.to_string();
    let message = err.to_string();
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            DatabaseError::Busy { statement, message }
        }
        _ => DatabaseError::Statement { statement, message },
    }
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).to_string())
        }
    }
}

impl Database for SqliteDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::from_product_name(self.product_name())
    }

    fn product_name(&self) -> &str {
        "SQLite"
    }

    fn product_version(&self) -> &str {
        &self.version
    }

    fn default_schema(&self) -> Option<&str> {
        Some(&self.schema)
    }

    fn execute(&mut self, sql: &str) -> Result<usize, DatabaseError> {
        debug!(statement = sql, "execute");
        match self.conn.execute(sql, []) {
            Ok(affected) => Ok(affected),
            // A statement that yields rows (SELECT, some PRAGMAs) is still a
            // legal changeset statement; run it and discard the rows.
            Err(rusqlite::Error::ExecuteReturnedResults) => {
                self.query(sql)?;
                Ok(0)
            }
            Err(e) => Err(statement_error(sql, e)),
        }
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| statement_error(sql, e))?;
        let column_count = stmt.column_count();

        let mapped = stmt
            .query_map([], |row| {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    values.push(value_to_text(row.get_ref(i)?));
                }
                Ok(Row::new(values))
            })
            .map_err(|e| statement_error(sql, e))?;

        let rows: Result<Vec<Row>, rusqlite::Error> = mapped.collect();
        rows.map_err(|e| statement_error(sql, e))
    }

    fn begin(&mut self) -> Result<(), DatabaseError> {
        // IMMEDIATE takes the write lock up front so a concurrent writer
        // waits on the busy timeout instead of deadlocking on upgrade.
        self.transaction_statement("begin", "BEGIN IMMEDIATE")
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        self.transaction_statement("commit", "COMMIT")
    }

    fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.transaction_statement("rollback", "ROLLBACK")
    }

    fn table_exists(&mut self, schema: Option<&str>, table: &str) -> Result<bool, DatabaseError> {
        let master = match schema {
            Some(s) if !s.eq_ignore_ascii_case("main") => {
                format!("{}.sqlite_master", self.quote_identifier(s))
            }
            _ => "sqlite_master".to_string(),
        };
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE type = 'table' AND lower(name) = lower({})",
            master,
            self.quote_literal(table)
        );
        let rows = self.query(&sql)?;
        Ok(rows.first().and_then(|r| r.integer(0)).unwrap_or(0) > 0)
    }
}
