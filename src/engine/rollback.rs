//! Rollback to a tag or by count.
//!
//! Every step is resolved before anything executes, so a changeset without
//! an inverse fails the request with the database untouched.

use tracing::info;

use crate::change::Change;
use crate::changelog::ChangeLog;
use crate::engine::{Engine, EngineError, deployment_id};
use crate::ledger::{ChangeLogRow, ExecType, LedgerError};
use crate::report::{Outcome, RunReport};

/// Changes that undo one ledger row.
enum Steps<'l> {
    /// `<rollback>` declared on the changeset.
    Explicit(&'l [Box<dyn Change>]),
    /// Inverses derived from the changes, last change first.
    Derived(Vec<Box<dyn Change>>),
}

impl Steps<'_> {
    fn changes(&self) -> &[Box<dyn Change>] {
        match self {
            Steps::Explicit(changes) => changes,
            Steps::Derived(changes) => changes,
        }
    }
}

struct PlannedRollback<'l> {
    row: ChangeLogRow,
    steps: Steps<'l>,
}

impl Engine<'_> {
    /// Undo every changeset executed after the row tagged `tag`, newest
    /// first, and delete their ledger rows.
    pub fn rollback_to_tag(
        &mut self,
        changelog: &ChangeLog,
        tag: &str,
    ) -> Result<RunReport, EngineError> {
        self.with_lock(|engine| {
            engine.ledger.ensure_schema(engine.db)?;
            let rows = engine
                .ledger
                .rows_after_tag(engine.db, tag)
                .map_err(|e| match e {
                    LedgerError::UnknownTag { tag } => EngineError::UnknownTag { tag },
                    other => other.into(),
                })?;
            info!(tag, rows = rows.len(), "rolling back to tag");
            engine.roll_back_rows(changelog, rows)
        })
    }

    /// Undo the `count` most recently executed changesets.
    pub fn rollback_count(
        &mut self,
        changelog: &ChangeLog,
        count: usize,
    ) -> Result<RunReport, EngineError> {
        self.with_lock(|engine| {
            engine.ledger.ensure_schema(engine.db)?;
            let rows = engine.ledger.last_rows(engine.db, count)?;
            info!(count = rows.len(), "rolling back changesets");
            engine.roll_back_rows(changelog, rows)
        })
    }

    fn roll_back_rows(
        &mut self,
        changelog: &ChangeLog,
        rows: Vec<ChangeLogRow>,
    ) -> Result<RunReport, EngineError> {
        let plan = plan(changelog, rows)?;
        let mut report = RunReport::new(deployment_id());

        for step in plan {
            let key = step.row.key.clone();
            let transactional = self.db.supports_ddl_in_transaction();
            if transactional {
                self.db.begin()?;
            }

            let mut result = Ok(());
            for change in step.steps.changes() {
                if let Err(e) = change.apply(self.db) {
                    result = Err(EngineError::StatementFailed {
                        key: key.clone(),
                        source: e,
                    });
                    break;
                }
            }
            let result = result.and_then(|_| Ok(self.ledger.remove(self.db, &step.row)?));

            if let Err(e) = result {
                if transactional {
                    self.rollback_quietly();
                }
                return Err(e);
            }
            if transactional {
                self.commit_or_roll_back()?;
            }
            info!(changeset = %key, "rolled back");
            report.push(&key, Outcome::RolledBack);
        }
        Ok(report)
    }
}

/// Resolve the undo steps for every row. Rows that never executed
/// statements (`MARK_RAN`, `FAILED`) only lose their ledger row.
fn plan<'l>(
    changelog: &'l ChangeLog,
    rows: Vec<ChangeLogRow>,
) -> Result<Vec<PlannedRollback<'l>>, EngineError> {
    let mut planned = Vec::with_capacity(rows.len());
    for row in rows {
        let change_set = changelog
            .find(&row.key)
            .ok_or_else(|| EngineError::UnknownChangeSet {
                key: row.key.clone(),
            })?;

        let steps = if matches!(
            row.exec_type,
            ExecType::MarkRan | ExecType::Failed | ExecType::Skipped
        ) {
            Steps::Derived(Vec::new())
        } else if let Some(explicit) = &change_set.rollback {
            Steps::Explicit(explicit)
        } else {
            let mut derived = Vec::new();
            for change in change_set.changes.iter().rev() {
                match change.inverse() {
                    Some(inverse) => derived.extend(inverse),
                    None => {
                        return Err(EngineError::RollbackNotSupported {
                            key: row.key.clone(),
                            change: change.name().to_string(),
                        });
                    }
                }
            }
            Steps::Derived(derived)
        };
        planned.push(PlannedRollback { row, steps });
    }
    Ok(planned)
}
