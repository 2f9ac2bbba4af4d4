//! Changelog ledger
//!
//! One row per executed changeset, stored in the target database. The
//! ledger is the source of truth for what has run. `ORDEREXECUTED` is drawn
//! from a separate high-water-mark table so that numbers are never handed
//! out twice, even after rows are deleted by a rollback.

use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::{debug, info};

use crate::changelog::{ChangeSet, ChangeSetKey, PathPolicy};
use crate::checksum::CheckSum;
use crate::database::{Database, DatabaseError, Dialect, Row};

pub const DEFAULT_LEDGER_TABLE: &str = "DATABASECHANGELOG";
pub const DEFAULT_ORDER_TABLE: &str = "DATABASECHANGELOGORDER";

const COLUMNS: &str = "ID, AUTHOR, FILENAME, DATEEXECUTED, ORDEREXECUTED, EXECTYPE, CHECKSUM, \
     DESCRIPTION, COMMENTS, TAG, CONTEXTS, LABELS, DEPLOYMENT_ID";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger {operation} failed: {source}")]
    Statement {
        operation: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error("tag '{tag}' already exists in the ledger")]
    DuplicateTag { tag: String },

    #[error("cannot tag an empty ledger")]
    EmptyLedger,

    #[error("tag '{tag}' not found in the ledger")]
    UnknownTag { tag: String },

    #[error("unreadable ledger row {key}: {message}")]
    InvalidRow { key: ChangeSetKey, message: String },
}

fn statement(operation: &'static str) -> impl FnOnce(DatabaseError) -> LedgerError {
    move |source| LedgerError::Statement { operation, source }
}

/// How a changeset was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    Executed,
    Reran,
    MarkRan,
    Failed,
    Skipped,
}

/// A row read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeLogRow {
    /// Identity with the path normalized by the deployment's path policy.
    pub key: ChangeSetKey,
    /// `FILENAME` exactly as stored; used to address the row in updates.
    pub stored_path: String,
    pub date_executed: Option<String>,
    pub order_executed: i64,
    pub exec_type: ExecType,
    pub checksum: Option<CheckSum>,
    pub description: Option<String>,
    pub comments: Option<String>,
    pub tag: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub deployment_id: Option<String>,
}

impl ChangeLogRow {
    /// Did the changeset complete, as opposed to a recorded failure?
    pub fn counts_as_ran(&self) -> bool {
        !matches!(self.exec_type, ExecType::Failed | ExecType::Skipped)
    }
}

/// Values written for one changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: ChangeSetKey,
    pub checksum: Option<CheckSum>,
    pub exec_type: ExecType,
    pub description: String,
    pub comments: Option<String>,
    pub tag: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub deployment_id: String,
}

impl LedgerEntry {
    pub fn for_change_set(
        change_set: &ChangeSet,
        exec_type: ExecType,
        deployment_id: &str,
    ) -> Self {
        Self {
            key: change_set.key.clone(),
            checksum: Some(change_set.checksum()),
            exec_type,
            description: change_set.description(),
            comments: change_set.comment.clone(),
            tag: None,
            contexts: change_set.contexts_string(),
            labels: change_set.labels_string(),
            deployment_id: deployment_id.to_string(),
        }
    }
}

pub struct Ledger {
    table: String,
    order_table: String,
    policy: PathPolicy,
}

impl Ledger {
    pub fn new(
        table: impl Into<String>,
        order_table: impl Into<String>,
        policy: PathPolicy,
    ) -> Self {
        Self {
            table: table.into(),
            order_table: order_table.into(),
            policy,
        }
    }

    /// Create the ledger and order tables if absent. Safe on every run.
    pub fn ensure_schema(&self, db: &mut dyn Database) -> Result<(), LedgerError> {
        let dialect = db.dialect();
        let varchar = |n| dialect.varchar_type(n);
        let ledger_ddl = format!(
            "CREATE TABLE {} (ID {} NOT NULL, AUTHOR {} NOT NULL, FILENAME {} NOT NULL, \
             DATEEXECUTED {} NOT NULL, ORDEREXECUTED INTEGER NOT NULL, EXECTYPE {} NOT NULL, \
             CHECKSUM {}, DESCRIPTION {}, COMMENTS {}, TAG {}, CONTEXTS {}, LABELS {}, \
             DEPLOYMENT_ID {})",
            self.table,
            varchar(255),
            varchar(255),
            varchar(255),
            dialect.timestamp_type(),
            varchar(10),
            varchar(80),
            varchar(255),
            varchar(255),
            varchar(255),
            varchar(255),
            varchar(255),
            varchar(10)
        );
        self.create_if_absent(db, &self.table, &ledger_ddl)?;

        let order_ddl = format!(
            "CREATE TABLE {} (ID INTEGER NOT NULL PRIMARY KEY, LASTORDER INTEGER NOT NULL)",
            self.order_table
        );
        self.create_if_absent(db, &self.order_table, &order_ddl)?;

        if self.last_order(db)?.is_none() {
            let max = db
                .query(&format!("SELECT MAX(ORDEREXECUTED) FROM {}", self.table))
                .map_err(statement("read"))?
                .first()
                .and_then(|r| r.integer(0))
                .unwrap_or(0);
            let insert = format!(
                "INSERT INTO {} (ID, LASTORDER) VALUES (1, {})",
                self.order_table, max
            );
            if let Err(e) = db.execute(&insert)
                && self.last_order(db)?.is_none()
            {
                return Err(LedgerError::Statement {
                    operation: "initialize order",
                    source: e,
                });
            }
        }
        Ok(())
    }

    fn create_if_absent(
        &self,
        db: &mut dyn Database,
        table: &str,
        ddl: &str,
    ) -> Result<(), LedgerError> {
        if db.table_exists(None, table).map_err(statement("schema check"))? {
            return Ok(());
        }
        match db.execute(ddl) {
            Ok(_) => {
                info!(table, "created ledger table");
                Ok(())
            }
            Err(e) => {
                if db.table_exists(None, table).map_err(statement("schema check"))? {
                    debug!(table, "ledger table created concurrently");
                    Ok(())
                } else {
                    Err(LedgerError::Statement {
                        operation: "create table",
                        source: e,
                    })
                }
            }
        }
    }

    fn last_order(&self, db: &mut dyn Database) -> Result<Option<i64>, LedgerError> {
        let rows = db
            .query(&format!(
                "SELECT LASTORDER FROM {} WHERE ID = 1",
                self.order_table
            ))
            .map_err(statement("read order"))?;
        Ok(rows.first().and_then(|r| r.integer(0)))
    }

    /// Reserve the next `ORDEREXECUTED` value. Callers hold the lock.
    fn next_order(&self, db: &mut dyn Database) -> Result<i64, LedgerError> {
        db.execute(&format!(
            "UPDATE {} SET LASTORDER = LASTORDER + 1 WHERE ID = 1",
            self.order_table
        ))
        .map_err(statement("advance order"))?;
        Ok(self.last_order(db)?.unwrap_or(1))
    }

    /// Every ledger row in execution order. An absent ledger reads as empty.
    pub fn ran_change_sets(&self, db: &mut dyn Database) -> Result<Vec<ChangeLogRow>, LedgerError> {
        if !db
            .table_exists(None, &self.table)
            .map_err(statement("schema check"))?
        {
            return Ok(Vec::new());
        }
        let rows = db
            .query(&format!(
                "SELECT {} FROM {} ORDER BY ORDEREXECUTED",
                COLUMNS, self.table
            ))
            .map_err(statement("read"))?;
        rows.iter().map(|r| self.row(r)).collect()
    }

    fn row(&self, row: &Row) -> Result<ChangeLogRow, LedgerError> {
        let text = |i: usize| row.text(i).map(str::to_string);
        let stored_path = text(2).unwrap_or_default();
        let key = ChangeSetKey::new(
            text(0).unwrap_or_default(),
            text(1).unwrap_or_default(),
            self.policy.normalize(&stored_path),
        );

        let exec_type = row
            .text(5)
            .unwrap_or("EXECUTED")
            .parse::<ExecType>()
            .map_err(|_| LedgerError::InvalidRow {
                key: key.clone(),
                message: format!("unknown EXECTYPE '{}'", row.text(5).unwrap_or_default()),
            })?;
        let checksum = match row.text(6).map(str::trim).filter(|c| !c.is_empty()) {
            Some(raw) => Some(raw.parse::<CheckSum>().map_err(|e| LedgerError::InvalidRow {
                key: key.clone(),
                message: e.to_string(),
            })?),
            None => None,
        };

        Ok(ChangeLogRow {
            key,
            stored_path,
            date_executed: text(3),
            order_executed: row.integer(4).unwrap_or_default(),
            exec_type,
            checksum,
            description: text(7),
            comments: text(8),
            tag: text(9),
            contexts: text(10),
            labels: text(11),
            deployment_id: text(12),
        })
    }

    /// Ledger row for `key`, if the changeset has been recorded.
    pub fn already_executed(
        &self,
        db: &mut dyn Database,
        key: &ChangeSetKey,
    ) -> Result<Option<ChangeLogRow>, LedgerError> {
        Ok(self
            .ran_change_sets(db)?
            .into_iter()
            .find(|row| &row.key == key))
    }

    /// Keys of every changeset that completed.
    pub fn ran_keys(rows: &[ChangeLogRow]) -> HashSet<ChangeSetKey> {
        rows.iter()
            .filter(|r| r.counts_as_ran())
            .map(|r| r.key.clone())
            .collect()
    }

    /// Append a row, returning its `ORDEREXECUTED`.
    pub fn record(&self, db: &mut dyn Database, entry: &LedgerEntry) -> Result<i64, LedgerError> {
        let dialect = db.dialect();
        let order = self.next_order(db)?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
            self.table,
            COLUMNS,
            dialect.quote_literal(&entry.key.id),
            dialect.quote_literal(&entry.key.author),
            dialect.quote_literal(&entry.key.path),
            dialect.timestamp_literal(Utc::now()),
            order,
            dialect.quote_literal(&entry.exec_type.to_string()),
            checksum_literal(dialect, entry.checksum.as_ref()),
            dialect.quote_literal(&truncate(&entry.description)),
            dialect.nullable_literal(entry.comments.as_deref().map(truncate).as_deref()),
            dialect.nullable_literal(entry.tag.as_deref()),
            dialect.nullable_literal(entry.contexts.as_deref()),
            dialect.nullable_literal(entry.labels.as_deref()),
            dialect.quote_literal(&entry.deployment_id)
        );
        db.execute(&sql).map_err(statement("insert"))?;
        debug!(changeset = %entry.key, exec_type = %entry.exec_type, order, "recorded");
        Ok(order)
    }

    /// Rewrite an existing row after a rerun or a retried failure. The row
    /// moves to a fresh `ORDEREXECUTED`.
    pub fn rewrite(
        &self,
        db: &mut dyn Database,
        existing: &ChangeLogRow,
        entry: &LedgerEntry,
    ) -> Result<i64, LedgerError> {
        let dialect = db.dialect();
        let order = self.next_order(db)?;
        let sql = format!(
            "UPDATE {} SET DATEEXECUTED = {}, ORDEREXECUTED = {}, EXECTYPE = {}, CHECKSUM = {}, \
             DESCRIPTION = {}, DEPLOYMENT_ID = {} WHERE {}",
            self.table,
            dialect.timestamp_literal(Utc::now()),
            order,
            dialect.quote_literal(&entry.exec_type.to_string()),
            checksum_literal(dialect, entry.checksum.as_ref()),
            dialect.quote_literal(&truncate(&entry.description)),
            dialect.quote_literal(&entry.deployment_id),
            row_filter(dialect, existing)
        );
        db.execute(&sql).map_err(statement("update"))?;
        debug!(changeset = %entry.key, exec_type = %entry.exec_type, order, "rewrote");
        Ok(order)
    }

    /// Store `checksum` on an existing row without touching anything else.
    pub fn upgrade_checksum(
        &self,
        db: &mut dyn Database,
        existing: &ChangeLogRow,
        checksum: &CheckSum,
    ) -> Result<(), LedgerError> {
        let dialect = db.dialect();
        let sql = format!(
            "UPDATE {} SET CHECKSUM = {} WHERE {}",
            self.table,
            dialect.quote_literal(&checksum.to_string()),
            row_filter(dialect, existing)
        );
        db.execute(&sql).map_err(statement("update checksum"))?;
        info!(changeset = %existing.key, checksum = %checksum, "updated stored checksum");
        Ok(())
    }

    /// Tag the most recently executed row.
    pub fn tag(&self, db: &mut dyn Database, label: &str) -> Result<(), LedgerError> {
        if self.tag_exists(db, label)? {
            return Err(LedgerError::DuplicateTag {
                tag: label.to_string(),
            });
        }
        let last = self
            .ran_change_sets(db)?
            .into_iter()
            .max_by_key(|r| r.order_executed)
            .ok_or(LedgerError::EmptyLedger)?;
        self.set_tag(db, &last, label)
    }

    /// Tag a specific row, for `tagDatabase` changes.
    pub fn tag_change_set(
        &self,
        db: &mut dyn Database,
        key: &ChangeSetKey,
        label: &str,
    ) -> Result<(), LedgerError> {
        let rows = self.ran_change_sets(db)?;
        if rows
            .iter()
            .any(|r| r.tag.as_deref() == Some(label) && &r.key != key)
        {
            return Err(LedgerError::DuplicateTag {
                tag: label.to_string(),
            });
        }
        match rows.iter().find(|r| &r.key == key) {
            Some(row) => self.set_tag(db, row, label),
            None => Err(LedgerError::EmptyLedger),
        }
    }

    fn set_tag(
        &self,
        db: &mut dyn Database,
        row: &ChangeLogRow,
        label: &str,
    ) -> Result<(), LedgerError> {
        let dialect = db.dialect();
        let sql = format!(
            "UPDATE {} SET TAG = {} WHERE {}",
            self.table,
            dialect.quote_literal(label),
            row_filter(dialect, row)
        );
        db.execute(&sql).map_err(statement("tag"))?;
        info!(tag = label, changeset = %row.key, "tagged ledger");
        Ok(())
    }

    pub fn tag_exists(&self, db: &mut dyn Database, label: &str) -> Result<bool, LedgerError> {
        Ok(self
            .ran_change_sets(db)?
            .iter()
            .any(|r| r.tag.as_deref() == Some(label)))
    }

    /// Rows executed after the row bearing `tag`, most recent first.
    pub fn rows_after_tag(
        &self,
        db: &mut dyn Database,
        tag: &str,
    ) -> Result<Vec<ChangeLogRow>, LedgerError> {
        let rows = self.ran_change_sets(db)?;
        let tagged = rows
            .iter()
            .find(|r| r.tag.as_deref() == Some(tag))
            .map(|r| r.order_executed)
            .ok_or_else(|| LedgerError::UnknownTag {
                tag: tag.to_string(),
            })?;
        let mut after: Vec<ChangeLogRow> = rows
            .into_iter()
            .filter(|r| r.order_executed > tagged)
            .collect();
        after.sort_by(|a, b| b.order_executed.cmp(&a.order_executed));
        Ok(after)
    }

    /// The `n` most recently executed rows, most recent first.
    pub fn last_rows(
        &self,
        db: &mut dyn Database,
        n: usize,
    ) -> Result<Vec<ChangeLogRow>, LedgerError> {
        let mut rows = self.ran_change_sets(db)?;
        rows.sort_by(|a, b| b.order_executed.cmp(&a.order_executed));
        rows.truncate(n);
        Ok(rows)
    }

    pub fn remove(&self, db: &mut dyn Database, row: &ChangeLogRow) -> Result<(), LedgerError> {
        let dialect = db.dialect();
        db.execute(&format!(
            "DELETE FROM {} WHERE {}",
            self.table,
            row_filter(dialect, row)
        ))
        .map_err(statement("delete"))?;
        debug!(changeset = %row.key, "removed ledger row");
        Ok(())
    }

    /// Null every stored checksum. The next run writes fresh values back.
    pub fn clear_checksums(&self, db: &mut dyn Database) -> Result<usize, LedgerError> {
        if !db
            .table_exists(None, &self.table)
            .map_err(statement("schema check"))?
        {
            return Ok(0);
        }
        let cleared = db
            .execute(&format!("UPDATE {} SET CHECKSUM = NULL", self.table))
            .map_err(statement("clear checksums"))?;
        info!(rows = cleared, "cleared stored checksums");
        Ok(cleared)
    }
}

fn row_filter(dialect: Dialect, row: &ChangeLogRow) -> String {
    format!(
        "ID = {} AND AUTHOR = {} AND FILENAME = {}",
        dialect.quote_literal(&row.key.id),
        dialect.quote_literal(&row.key.author),
        dialect.quote_literal(&row.stored_path)
    )
}

fn checksum_literal(dialect: Dialect, checksum: Option<&CheckSum>) -> String {
    dialect.nullable_literal(checksum.map(|c| c.to_string()).as_deref())
}

/// Descriptive columns are `VARCHAR(255)`.
fn truncate(text: &str) -> String {
    if text.chars().count() <= 255 {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(252).collect();
        out.push_str("...");
        out
    }
}
