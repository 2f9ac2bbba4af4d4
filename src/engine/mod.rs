//! Execution engine
//!
//! Orchestrates one run against a target database:
//!
//! 1. INIT: ensure the lock table exists.
//! 2. LOCK_ACQUIRED: take the database-resident lock, or abort.
//! 3. DIFFING: classify every changeset against the ledger. Any checksum
//!    drift aborts here, before a statement or ledger row is written.
//! 4. APPLYING: run pending changesets in document order, each in its own
//!    transaction when the database supports transactional DDL, and append
//!    the ledger row.
//! 5. LOCK_RELEASED: always entered, whatever failed.
//!
//! There is no transaction spanning changesets. A failure never undoes
//! changesets committed earlier in the same run.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::changelog::{
    BuildOptions, ChangeLog, ChangeLogBuilder, ChangeLogParameters, ChangeLogSource, ChangeSet,
    ChangeSetKey, FilterExpression, IncludeAllOrder, ParseError, PathPolicy, RunFilter,
};
use crate::checksum::CheckSum;
use crate::database::{Database, DatabaseError, Dialect};
use crate::ledger::{
    ChangeLogRow, DEFAULT_LEDGER_TABLE, DEFAULT_ORDER_TABLE, ExecType, Ledger, LedgerEntry,
    LedgerError,
};
use crate::lock::{DEFAULT_LOCK_TABLE, LockError, LockIdentity, LockInfo, LockService};
use crate::precondition::{ErrorPolicy, EvaluationContext, PreconditionOutcome};
use crate::report::{Outcome, RunReport};

mod rollback;
pub mod status;

pub use status::{ChangeSetState, ChangeSetStatus, RerunReason};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(
        "validation failed: checksum of {key} changed (stored {stored}, current {current}); \
         mark it runOnChange or add a validCheckSum to accept the change"
    )]
    ChecksumMismatch {
        key: ChangeSetKey,
        stored: CheckSum,
        current: CheckSum,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("precondition halted the run at {scope}: {message}")]
    PreconditionHalt { scope: String, message: String },

    #[error("changeset {key} failed: {source}")]
    StatementFailed {
        key: ChangeSetKey,
        #[source]
        source: DatabaseError,
    },

    #[error("cannot roll back {key}: change '{change}' has no inverse and no <rollback> block")]
    RollbackNotSupported { key: ChangeSetKey, change: String },

    #[error("tag '{tag}' not found in the ledger")]
    UnknownTag { tag: String },

    #[error("ledger row {key} has no changeset in the changelog; cannot roll it back")]
    UnknownChangeSet { key: ChangeSetKey },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Names of the engine's bookkeeping tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub ledger: String,
    pub lock: String,
    pub order: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            ledger: DEFAULT_LEDGER_TABLE.to_string(),
            lock: DEFAULT_LOCK_TABLE.to_string(),
            order: DEFAULT_ORDER_TABLE.to_string(),
        }
    }
}

/// Everything a run needs besides the database handle.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub contexts: std::collections::BTreeSet<String>,
    pub labels: FilterExpression,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    pub tables: TableNames,
    pub path_policy: PathPolicy,
    pub include_all_order: IncludeAllOrder,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            contexts: Default::default(),
            labels: FilterExpression::default(),
            lock_timeout: Duration::from_secs(300),
            lock_poll_interval: Duration::from_secs(10),
            tables: TableNames::default(),
            path_policy: PathPolicy::default(),
            include_all_order: IncludeAllOrder::default(),
        }
    }
}

impl RunSettings {
    /// Builder options for a run against `dialect`.
    pub fn build_options(&self, dialect: Dialect) -> BuildOptions {
        BuildOptions {
            filter: RunFilter {
                contexts: self.contexts.clone(),
                labels: self.labels.clone(),
                dialect: dialect.type_name().to_string(),
            },
            path_policy: self.path_policy,
            include_all_order: self.include_all_order,
        }
    }
}

/// Build the changelog rooted at `root` for a run against `dialect`.
pub fn load_changelog(
    source: &dyn ChangeLogSource,
    root: &str,
    settings: &RunSettings,
    dialect: Dialect,
    params: &mut ChangeLogParameters,
) -> Result<ChangeLog, EngineError> {
    let builder = ChangeLogBuilder::new(source, settings.build_options(dialect));
    Ok(builder.build(root, params)?)
}

/// Deployment ids group the rows written by one run: the low ten digits of
/// the start time in milliseconds.
fn deployment_id() -> String {
    format!("{:010}", Utc::now().timestamp_millis().rem_euclid(10_000_000_000))
}

pub struct Engine<'a> {
    db: &'a mut dyn Database,
    ledger: Ledger,
    lock: LockService,
    settings: RunSettings,
}

impl<'a> Engine<'a> {
    pub fn new(db: &'a mut dyn Database, settings: &RunSettings) -> Self {
        Self::with_identity(db, settings, LockIdentity::generate())
    }

    pub fn with_identity(
        db: &'a mut dyn Database,
        settings: &RunSettings,
        identity: LockIdentity,
    ) -> Self {
        Self {
            db,
            ledger: Ledger::new(
                settings.tables.ledger.clone(),
                settings.tables.order.clone(),
                settings.path_policy,
            ),
            lock: LockService::new(settings.tables.lock.clone(), identity),
            settings: settings.clone(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.db.dialect()
    }

    /// Run `f` while holding the lock. The lock is released on every exit
    /// path; a release failure is only surfaced when `f` succeeded.
    fn with_lock<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.lock.ensure_schema(self.db)?;
        if let Err(e) = self.lock.acquire(
            self.db,
            self.settings.lock_timeout,
            self.settings.lock_poll_interval,
        ) {
            if let Err(release) = self.lock.release(self.db) {
                warn!(error = %release, "best-effort lock release failed");
            }
            return Err(e.into());
        }

        let result = f(self);

        match self.lock.release(self.db) {
            Ok(_) => result,
            Err(e) => match result {
                Ok(_) => Err(e.into()),
                Err(original) => {
                    warn!(error = %e, "failed to release lock after error");
                    Err(original)
                }
            },
        }
    }

    /// Apply every pending changeset.
    pub fn update(&mut self, changelog: &ChangeLog) -> Result<RunReport, EngineError> {
        self.with_lock(|engine| engine.run_update(changelog, None))
    }

    /// Apply at most `count` pending changesets.
    pub fn update_count(
        &mut self,
        changelog: &ChangeLog,
        count: usize,
    ) -> Result<RunReport, EngineError> {
        self.with_lock(|engine| engine.run_update(changelog, Some(count)))
    }

    /// Read-only classification of every changeset. Takes no lock.
    pub fn status(&mut self, changelog: &ChangeLog) -> Result<Vec<ChangeSetStatus>, EngineError> {
        let rows = self.ledger.ran_change_sets(self.db)?;
        Ok(status::classify_all(changelog, &rows))
    }

    /// Fail with `ChecksumMismatch` if any applied changeset has drifted.
    pub fn validate(&mut self, changelog: &ChangeLog) -> Result<(), EngineError> {
        let statuses = self.status(changelog)?;
        check_drift(&statuses)
    }

    /// Tag the most recently executed ledger row.
    pub fn tag(&mut self, label: &str) -> Result<(), EngineError> {
        self.with_lock(|engine| {
            engine.ledger.ensure_schema(engine.db)?;
            engine.ledger.tag(engine.db, label)?;
            Ok(())
        })
    }

    pub fn tag_exists(&mut self, label: &str) -> Result<bool, EngineError> {
        Ok(self.ledger.tag_exists(self.db, label)?)
    }

    /// Record every pending changeset as executed without running it.
    pub fn changelog_sync(&mut self, changelog: &ChangeLog) -> Result<RunReport, EngineError> {
        self.with_lock(|engine| {
            engine.ledger.ensure_schema(engine.db)?;
            let rows = engine.ledger.ran_change_sets(engine.db)?;
            let statuses = status::classify_all(changelog, &rows);
            check_drift(&statuses)?;

            let deployment = deployment_id();
            let mut report = RunReport::new(deployment.clone());
            for (change_set, status) in changelog.change_sets().iter().zip(&statuses) {
                if status.state != ChangeSetState::Pending {
                    report.push(&status.key, Outcome::AlreadyRan);
                    continue;
                }
                let entry =
                    LedgerEntry::for_change_set(change_set, ExecType::Executed, &deployment);
                engine.write_entry(status.existing.as_ref(), &entry)?;
                engine.apply_tags(change_set)?;
                report.push(
                    &change_set.key,
                    Outcome::MarkedRan {
                        reason: "changelog sync".to_string(),
                    },
                );
            }
            Ok(report)
        })
    }

    /// Null every stored checksum; the next update writes current values back.
    pub fn clear_checksums(&mut self) -> Result<usize, EngineError> {
        self.with_lock(|engine| Ok(engine.ledger.clear_checksums(engine.db)?))
    }

    pub fn list_locks(&mut self) -> Result<Vec<LockInfo>, EngineError> {
        Ok(self.lock.list_locks(self.db)?)
    }

    /// Clear the lock regardless of holder.
    pub fn release_locks(&mut self) -> Result<(), EngineError> {
        self.lock.ensure_schema(self.db)?;
        Ok(self.lock.force_release(self.db)?)
    }

    fn run_update(
        &mut self,
        changelog: &ChangeLog,
        limit: Option<usize>,
    ) -> Result<RunReport, EngineError> {
        self.ledger.ensure_schema(self.db)?;
        let rows = self.ledger.ran_change_sets(self.db)?;
        let mut ran = Ledger::ran_keys(&rows);
        let deployment = deployment_id();
        let mut report = RunReport::new(deployment.clone());

        let statuses = status::classify_all(changelog, &rows);
        check_drift(&statuses)?;

        if !self.check_changelog_preconditions(changelog, &ran)? {
            for change_set in changelog.change_sets() {
                report.push(
                    &change_set.key,
                    Outcome::Skipped {
                        reason: "changelog precondition failed".to_string(),
                    },
                );
            }
            return Ok(report);
        }

        info!(
            changelog = %changelog.root_path,
            pending = statuses.iter().filter(|s| s.will_run()).count(),
            deployment_id = %deployment,
            "starting update"
        );

        let mut attempted = 0usize;
        for (change_set, status) in changelog.change_sets().iter().zip(&statuses) {
            match &status.state {
                ChangeSetState::AlreadyRan => {
                    if let (Some(row), Some(sum)) = (&status.existing, &status.checksum_update) {
                        self.ledger.upgrade_checksum(self.db, row, sum)?;
                    }
                    report.push(&change_set.key, Outcome::AlreadyRan);
                }
                ChangeSetState::Pending | ChangeSetState::Rerun { .. } => {
                    if limit.is_some_and(|n| attempted >= n) {
                        break;
                    }
                    let outcome = self.execute_change_set(
                        change_set,
                        status.existing.as_ref(),
                        &deployment,
                        &mut ran,
                    )?;
                    if !matches!(outcome, Outcome::Skipped { .. }) {
                        attempted += 1;
                    }
                    info!(
                        changeset = %change_set.key,
                        outcome = outcome.label(),
                        "changeset finished"
                    );
                    report.push(&change_set.key, outcome);
                }
                // Drift aborted above; filtered changesets are not in this list.
                ChangeSetState::Drifted { .. } | ChangeSetState::Filtered { .. } => {}
            }
        }

        for excluded in changelog.excluded() {
            report.push(
                &excluded.change_set.key,
                Outcome::Skipped {
                    reason: excluded.reason.clone(),
                },
            );
        }

        let summary = report.summary();
        info!(
            applied = summary.applied,
            reran = summary.reran,
            marked_ran = summary.marked_ran,
            failed = summary.failed,
            "update complete"
        );
        Ok(report)
    }

    /// `false` when a changelog-level precondition says to skip the whole run.
    fn check_changelog_preconditions(
        &mut self,
        changelog: &ChangeLog,
        ran: &HashSet<ChangeSetKey>,
    ) -> Result<bool, EngineError> {
        for set in &changelog.preconditions {
            let (policy, message) = match set.check(self.db, &EvaluationContext { ran }) {
                PreconditionOutcome::Passed => continue,
                PreconditionOutcome::Failed { policy, message }
                | PreconditionOutcome::Errored { policy, message } => (policy, message),
            };
            match policy {
                ErrorPolicy::Warn => {
                    warn!(
                        changelog = %changelog.root_path,
                        %message,
                        "changelog precondition failed; continuing"
                    );
                }
                ErrorPolicy::Continue => {
                    info!(
                        changelog = %changelog.root_path,
                        %message,
                        "changelog precondition failed; skipping run"
                    );
                    return Ok(false);
                }
                ErrorPolicy::Halt | ErrorPolicy::MarkRan => {
                    return Err(EngineError::PreconditionHalt {
                        scope: changelog.root_path.clone(),
                        message,
                    });
                }
            }
        }
        Ok(true)
    }

    fn execute_change_set(
        &mut self,
        change_set: &ChangeSet,
        existing: Option<&ChangeLogRow>,
        deployment: &str,
        ran: &mut HashSet<ChangeSetKey>,
    ) -> Result<Outcome, EngineError> {
        if let Some(preconditions) = &change_set.preconditions {
            let (policy, message) = match preconditions.check(self.db, &EvaluationContext { ran }) {
                PreconditionOutcome::Passed => (None, String::new()),
                PreconditionOutcome::Failed { policy, message }
                | PreconditionOutcome::Errored { policy, message } => (Some(policy), message),
            };
            match policy {
                None => {}
                Some(ErrorPolicy::Halt) => {
                    return Err(EngineError::PreconditionHalt {
                        scope: change_set.key.to_string(),
                        message,
                    });
                }
                Some(ErrorPolicy::Warn) => {
                    warn!(
                        changeset = %change_set.key,
                        %message,
                        "precondition failed; running anyway"
                    );
                }
                Some(ErrorPolicy::Continue) => {
                    return Ok(Outcome::Skipped {
                        reason: format!("precondition failed: {}", message),
                    });
                }
                Some(ErrorPolicy::MarkRan) => {
                    let entry =
                        LedgerEntry::for_change_set(change_set, ExecType::MarkRan, deployment);
                    self.write_entry(existing, &entry)?;
                    ran.insert(change_set.key.clone());
                    return Ok(Outcome::MarkedRan {
                        reason: format!("precondition failed: {}", message),
                    });
                }
            }
        }

        let transactional = change_set.run_in_transaction && self.db.supports_ddl_in_transaction();
        if transactional {
            self.db.begin()?;
        }

        if let Err(e) = self.apply_changes(change_set) {
            if transactional {
                self.rollback_quietly();
            }
            if change_set.fail_on_error {
                return Err(EngineError::StatementFailed {
                    key: change_set.key.clone(),
                    source: e,
                });
            }
            warn!(
                changeset = %change_set.key,
                error = %e,
                "changeset failed; failOnError is false, continuing"
            );
            let entry = LedgerEntry::for_change_set(change_set, ExecType::Failed, deployment);
            self.write_entry(existing, &entry)?;
            return Ok(Outcome::Failed {
                reason: e.to_string(),
            });
        }

        let rerun = existing.is_some_and(ChangeLogRow::counts_as_ran);
        let exec_type = if rerun { ExecType::Reran } else { ExecType::Executed };
        let entry = LedgerEntry::for_change_set(change_set, exec_type, deployment);
        let recorded = self
            .write_entry(existing, &entry)
            .and_then(|_| self.apply_tags(change_set));
        if let Err(e) = recorded {
            if transactional {
                self.rollback_quietly();
            }
            return Err(e);
        }

        if transactional {
            self.commit_or_roll_back()?;
        }
        ran.insert(change_set.key.clone());
        Ok(if rerun { Outcome::Reran } else { Outcome::Applied })
    }

    fn apply_changes(&mut self, change_set: &ChangeSet) -> Result<(), DatabaseError> {
        for change in &change_set.changes {
            change.apply(self.db)?;
        }
        Ok(())
    }

    /// Insert a new ledger row or rewrite the existing one.
    fn write_entry(
        &mut self,
        existing: Option<&ChangeLogRow>,
        entry: &LedgerEntry,
    ) -> Result<i64, EngineError> {
        Ok(match existing {
            Some(row) => self.ledger.rewrite(self.db, row, entry)?,
            None => self.ledger.record(self.db, entry)?,
        })
    }

    fn apply_tags(&mut self, change_set: &ChangeSet) -> Result<(), EngineError> {
        for label in change_set.tag_labels() {
            self.ledger.tag_change_set(self.db, &change_set.key, label)?;
        }
        Ok(())
    }

    /// A failed COMMIT leaves the transaction open; close it so the lock
    /// release that follows runs in autocommit.
    fn commit_or_roll_back(&mut self) -> Result<(), EngineError> {
        if let Err(e) = self.db.commit() {
            self.rollback_quietly();
            return Err(e.into());
        }
        Ok(())
    }

    fn rollback_quietly(&mut self) {
        if let Err(e) = self.db.rollback() {
            warn!(error = %e, "transaction rollback failed");
        }
    }
}

fn check_drift(statuses: &[ChangeSetStatus]) -> Result<(), EngineError> {
    for status in statuses {
        if let ChangeSetState::Drifted { stored, current } = &status.state {
            return Err(EngineError::ChecksumMismatch {
                key: status.key.clone(),
                stored: stored.clone(),
                current: current.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::SqlChange;
    use crate::database::SqliteDatabase;

    fn settings() -> RunSettings {
        RunSettings {
            lock_timeout: Duration::from_millis(100),
            lock_poll_interval: Duration::from_millis(10),
            ..RunSettings::default()
        }
    }

    fn log(change_sets: Vec<ChangeSet>) -> ChangeLog {
        let mut log = ChangeLog::new("main.xml");
        for cs in change_sets {
            log.push(cs);
        }
        log
    }

    fn cs(id: &str, sql: &str) -> ChangeSet {
        ChangeSet::new(ChangeSetKey::new(id, "alice", "main.xml")).with_change(SqlChange::new(sql))
    }

    #[test]
    fn test_lock_released_after_failure() {
        let mut db = SqliteDatabase::open_in_memory().expect("open");
        let changelog = log(vec![cs("1", "CREATE TABLE broken (")]);
        let settings = settings();

        let err = Engine::new(&mut db, &settings).update(&changelog).unwrap_err();
        assert!(matches!(err, EngineError::StatementFailed { .. }), "{}", err);

        let locks = Engine::new(&mut db, &settings).list_locks().expect("locks");
        assert!(locks.iter().all(|l| !l.locked));
    }

    /// Delegates to SQLite but refuses every COMMIT.
    struct CommitFails(SqliteDatabase);

    impl Database for CommitFails {
        fn dialect(&self) -> Dialect {
            self.0.dialect()
        }
        fn product_name(&self) -> &str {
            self.0.product_name()
        }
        fn product_version(&self) -> &str {
            self.0.product_version()
        }
        fn default_schema(&self) -> Option<&str> {
            self.0.default_schema()
        }
        fn execute(&mut self, sql: &str) -> Result<usize, DatabaseError> {
            self.0.execute(sql)
        }
        fn query(&mut self, sql: &str) -> Result<Vec<crate::database::Row>, DatabaseError> {
            self.0.query(sql)
        }
        fn begin(&mut self) -> Result<(), DatabaseError> {
            self.0.begin()
        }
        fn commit(&mut self) -> Result<(), DatabaseError> {
            Err(DatabaseError::Transaction {
                operation: "commit",
                message: "database is locked".to_string(),
            })
        }
        fn rollback(&mut self) -> Result<(), DatabaseError> {
            self.0.rollback()
        }
        fn table_exists(
            &mut self,
            schema: Option<&str>,
            table: &str,
        ) -> Result<bool, DatabaseError> {
            self.0.table_exists(schema, table)
        }
    }

    #[test]
    fn test_failed_commit_rolls_back_and_releases_lock() {
        let mut db = CommitFails(SqliteDatabase::open_in_memory().expect("open"));
        let changelog = log(vec![cs("1", "CREATE TABLE a (id INTEGER)")]);
        let settings = settings();

        let err = Engine::new(&mut db, &settings).update(&changelog).unwrap_err();
        assert!(matches!(err, EngineError::Database(_)), "{}", err);

        let mut db = db.0;
        assert!(!db.table_exists(None, "a").expect("exists"));
        let locks = Engine::new(&mut db, &settings).list_locks().expect("locks");
        assert!(locks.iter().all(|l| !l.locked));
    }

    #[test]
    fn test_failed_rollback_commit_releases_lock() {
        let mut db = SqliteDatabase::open_in_memory().expect("open");
        let mut change_set = cs("1", "CREATE TABLE a (id INTEGER)");
        let undo: Box<dyn crate::change::Change> = Box::new(SqlChange::new("DROP TABLE a"));
        change_set.rollback = Some(vec![undo]);
        let changelog = log(vec![change_set]);
        let settings = settings();
        Engine::new(&mut db, &settings).update(&changelog).expect("update");

        let mut db = CommitFails(db);
        let err = Engine::new(&mut db, &settings)
            .rollback_count(&changelog, 1)
            .unwrap_err();
        assert!(matches!(err, EngineError::Database(_)), "{}", err);

        let mut db = db.0;
        assert!(db.table_exists(None, "a").expect("exists"));
        let locks = Engine::new(&mut db, &settings).list_locks().expect("locks");
        assert!(locks.iter().all(|l| !l.locked));
    }

    #[test]
    fn test_update_count_limits_applied() {
        let mut db = SqliteDatabase::open_in_memory().expect("open");
        let changelog = log(vec![
            cs("1", "CREATE TABLE a (id INTEGER)"),
            cs("2", "CREATE TABLE b (id INTEGER)"),
            cs("3", "CREATE TABLE c (id INTEGER)"),
        ]);
        let settings = settings();

        let report = Engine::new(&mut db, &settings)
            .update_count(&changelog, 2)
            .expect("update");
        assert_eq!(report.summary().applied, 2);

        let report = Engine::new(&mut db, &settings).update(&changelog).expect("update");
        assert_eq!(report.summary().applied, 1);
        assert_eq!(report.summary().already_ran, 2);
    }

    #[test]
    fn test_deployment_id_is_ten_digits() {
        let id = deployment_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_build_options_carry_dialect() {
        let options = settings().build_options(Dialect::Postgres);
        assert_eq!(options.filter.dialect, "postgresql");
    }
}
