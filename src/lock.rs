//! Database-resident lock
//!
//! A single row (`ID = 1`) in the lock table serializes runs against one
//! target database. Acquisition is one conditional `UPDATE`: the row is
//! granted to whoever flips `LOCKED` from false to true. The database is the
//! only authority, so independent processes on different hosts coordinate
//! through it.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::{Database, DatabaseError};

pub const DEFAULT_LOCK_TABLE: &str = "DATABASECHANGELOGLOCK";

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "could not acquire the change log lock within {}s; currently locked by {}",
        waited.as_secs(),
        held_by.as_deref().unwrap_or("an unknown holder")
    )]
    Timeout {
        waited: Duration,
        held_by: Option<String>,
    },

    #[error("lock {operation} failed: {source}")]
    Statement {
        operation: &'static str,
        #[source]
        source: DatabaseError,
    },
}

fn statement(operation: &'static str) -> impl FnOnce(DatabaseError) -> LockError {
    move |source| LockError::Statement { operation, source }
}

/// Identity written into `LOCKEDBY`: `host#pid#nonce`. The nonce keeps two
/// services in one process apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockIdentity(String);

impl LockIdentity {
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}#{}#{}", host.trim(), std::process::id(), &nonce[..8]))
    }

    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current state of a lock row, for `list-locks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub id: i64,
    pub locked: bool,
    pub granted: Option<String>,
    pub locked_by: Option<String>,
}

pub struct LockService {
    table: String,
    identity: LockIdentity,
}

impl LockService {
    pub fn new(table: impl Into<String>, identity: LockIdentity) -> Self {
        Self {
            table: table.into(),
            identity,
        }
    }

    /// Create the lock table and its row if absent. Losing a creation race
    /// against another process counts as success.
    pub fn ensure_schema(&self, db: &mut dyn Database) -> Result<(), LockError> {
        let dialect = db.dialect();
        if !db
            .table_exists(None, &self.table)
            .map_err(statement("schema check"))?
        {
            let ddl = format!(
                "CREATE TABLE {} (ID INTEGER NOT NULL PRIMARY KEY, LOCKED {} NOT NULL, LOCKGRANTED {}, LOCKEDBY {})",
                self.table,
                dialect.boolean_type(),
                dialect.timestamp_type(),
                dialect.varchar_type(255)
            );
            if let Err(e) = db.execute(&ddl) {
                if !db
                    .table_exists(None, &self.table)
                    .map_err(statement("schema check"))?
                {
                    return Err(LockError::Statement {
                        operation: "create table",
                        source: e,
                    });
                }
                debug!(table = %self.table, "lock table created concurrently");
            } else {
                info!(table = %self.table, "created lock table");
            }
        }

        if self.row_exists(db)? {
            return Ok(());
        }
        let insert = format!(
            "INSERT INTO {} (ID, LOCKED) VALUES (1, {})",
            self.table,
            dialect.boolean_literal(false)
        );
        if let Err(e) = db.execute(&insert)
            && !self.row_exists(db)?
        {
            return Err(LockError::Statement {
                operation: "initialize",
                source: e,
            });
        }
        Ok(())
    }

    fn row_exists(&self, db: &mut dyn Database) -> Result<bool, LockError> {
        let rows = db
            .query(&format!("SELECT COUNT(*) FROM {} WHERE ID = 1", self.table))
            .map_err(statement("read"))?;
        Ok(rows.first().and_then(|r| r.integer(0)).unwrap_or(0) > 0)
    }

    /// One compare-and-swap attempt. `true` means this identity now holds
    /// the lock. A write lock held by another connection (typically a holder
    /// inside a changeset transaction) counts as not acquired.
    pub fn try_acquire(&self, db: &mut dyn Database) -> Result<bool, LockError> {
        let dialect = db.dialect();
        let sql = format!(
            "UPDATE {} SET LOCKED = {}, LOCKGRANTED = {}, LOCKEDBY = {} WHERE ID = 1 AND LOCKED = {}",
            self.table,
            dialect.boolean_literal(true),
            dialect.timestamp_literal(Utc::now()),
            dialect.quote_literal(self.identity.as_str()),
            dialect.boolean_literal(false)
        );
        match db.execute(&sql) {
            Ok(affected) => Ok(affected == 1),
            Err(e) if e.is_busy() => {
                debug!(locked_by = %self.identity, "lock table busy; treating as not acquired");
                Ok(false)
            }
            Err(e) => Err(statement("acquire")(e)),
        }
    }

    /// Poll until the lock is granted or `timeout` elapses.
    pub fn acquire(
        &self,
        db: &mut dyn Database,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), LockError> {
        let started = Instant::now();
        loop {
            if self.try_acquire(db)? {
                info!(locked_by = %self.identity, "acquired change log lock");
                return Ok(());
            }

            let waited = started.elapsed();
            let held_by = match self.holder(db) {
                Err(LockError::Statement { source, .. }) if source.is_busy() => None,
                other => other?,
            };
            if waited >= timeout {
                warn!(
                    held_by = held_by.as_deref().unwrap_or("unknown"),
                    waited_secs = waited.as_secs(),
                    "timed out waiting for change log lock"
                );
                return Err(LockError::Timeout { waited, held_by });
            }

            info!(
                held_by = held_by.as_deref().unwrap_or("unknown"),
                "waiting for change log lock"
            );
            thread::sleep(poll_interval.min(timeout - waited));
        }
    }

    /// Release the lock if this identity holds it. Releasing a lock held by
    /// someone else is a no-op.
    pub fn release(&self, db: &mut dyn Database) -> Result<bool, LockError> {
        let dialect = db.dialect();
        let sql = format!(
            "UPDATE {} SET LOCKED = {}, LOCKGRANTED = NULL, LOCKEDBY = NULL WHERE ID = 1 AND LOCKEDBY = {}",
            self.table,
            dialect.boolean_literal(false),
            dialect.quote_literal(self.identity.as_str())
        );
        let released = db.execute(&sql).map_err(statement("release"))? > 0;
        if released {
            info!("released change log lock");
        } else {
            debug!(locked_by = %self.identity, "lock not held by this process; nothing to release");
        }
        Ok(released)
    }

    /// Clear the lock whoever holds it. For recovery after a crashed run.
    pub fn force_release(&self, db: &mut dyn Database) -> Result<(), LockError> {
        let dialect = db.dialect();
        let sql = format!(
            "UPDATE {} SET LOCKED = {}, LOCKGRANTED = NULL, LOCKEDBY = NULL",
            self.table,
            dialect.boolean_literal(false)
        );
        db.execute(&sql).map_err(statement("force release"))?;
        warn!(table = %self.table, "forced release of change log lock");
        Ok(())
    }

    pub fn list_locks(&self, db: &mut dyn Database) -> Result<Vec<LockInfo>, LockError> {
        if !db
            .table_exists(None, &self.table)
            .map_err(statement("schema check"))?
        {
            return Ok(Vec::new());
        }
        let rows = db
            .query(&format!(
                "SELECT ID, LOCKED, LOCKGRANTED, LOCKEDBY FROM {} ORDER BY ID",
                self.table
            ))
            .map_err(statement("read"))?;
        Ok(rows
            .iter()
            .map(|r| LockInfo {
                id: r.integer(0).unwrap_or_default(),
                locked: r.boolean(1).unwrap_or(false),
                granted: r.text(2).map(str::to_string),
                locked_by: r.text(3).map(str::to_string),
            })
            .collect())
    }

    pub fn has_lock(&self, db: &mut dyn Database) -> Result<bool, LockError> {
        Ok(self.holder(db)?.as_deref() == Some(self.identity.as_str()))
    }

    fn holder(&self, db: &mut dyn Database) -> Result<Option<String>, LockError> {
        Ok(self
            .list_locks(db)?
            .into_iter()
            .find(|l| l.locked)
            .and_then(|l| l.locked_by))
    }
}
