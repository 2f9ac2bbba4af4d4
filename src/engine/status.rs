//! Classification of changesets against the ledger.

use std::collections::HashMap;

use serde::Serialize;

use crate::changelog::{ChangeLog, ChangeSet, ChangeSetKey};
use crate::checksum::{self, CheckSum, Verification};
use crate::ledger::{ChangeLogRow, ExecType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RerunReason {
    RunAlways,
    /// Checksum changed on a `runOnChange` changeset.
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChangeSetState {
    /// Never ran, or the last attempt was recorded as failed.
    Pending,
    Rerun { reason: RerunReason },
    AlreadyRan,
    Drifted { stored: CheckSum, current: CheckSum },
    Filtered { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSetStatus {
    pub key: ChangeSetKey,
    #[serde(flatten)]
    pub state: ChangeSetState,
    /// Ledger row for the changeset, when there is one.
    #[serde(skip)]
    pub existing: Option<ChangeLogRow>,
    /// Checksum to write back onto the existing row: an upgraded version
    /// or a value cleared by `clear-checksums`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum_update: Option<CheckSum>,
}

impl ChangeSetStatus {
    pub fn will_run(&self) -> bool {
        matches!(
            self.state,
            ChangeSetState::Pending | ChangeSetState::Rerun { .. }
        )
    }
}

/// Classify one selected changeset given its ledger row.
pub fn classify(change_set: &ChangeSet, row: Option<&ChangeLogRow>) -> ChangeSetStatus {
    let mut status = ChangeSetStatus {
        key: change_set.key.clone(),
        state: ChangeSetState::Pending,
        existing: row.cloned(),
        checksum_update: None,
    };

    let Some(row) = row else {
        return status;
    };
    if matches!(row.exec_type, ExecType::Failed | ExecType::Skipped) {
        return status;
    }

    let unchanged = |status: &mut ChangeSetStatus| {
        status.state = if change_set.run_always {
            ChangeSetState::Rerun {
                reason: RerunReason::RunAlways,
            }
        } else {
            ChangeSetState::AlreadyRan
        };
    };

    match &row.checksum {
        None => {
            unchanged(&mut status);
            status.checksum_update = Some(change_set.checksum());
        }
        Some(stored) => {
            match checksum::verify(&change_set.changes, stored, &change_set.valid_checksums) {
                Verification::Unchanged | Verification::Accepted => unchanged(&mut status),
                Verification::Upgrade { current } => {
                    unchanged(&mut status);
                    status.checksum_update = Some(current);
                }
                Verification::Changed { current } => {
                    status.state = if change_set.run_on_change {
                        ChangeSetState::Rerun {
                            reason: RerunReason::Changed,
                        }
                    } else {
                        ChangeSetState::Drifted {
                            stored: stored.clone(),
                            current,
                        }
                    };
                }
            }
        }
    }
    status
}

/// Classify every changeset in the log: selected ones in document order,
/// then the ones excluded by filters.
pub fn classify_all(changelog: &ChangeLog, rows: &[ChangeLogRow]) -> Vec<ChangeSetStatus> {
    let by_key: HashMap<&ChangeSetKey, &ChangeLogRow> = rows.iter().map(|r| (&r.key, r)).collect();

    let mut statuses: Vec<ChangeSetStatus> = changelog
        .change_sets()
        .iter()
        .map(|cs| classify(cs, by_key.get(&cs.key).copied()))
        .collect();

    statuses.extend(changelog.excluded().iter().map(|e| ChangeSetStatus {
        key: e.change_set.key.clone(),
        state: ChangeSetState::Filtered {
            reason: e.reason.clone(),
        },
        existing: by_key.get(&e.change_set.key).map(|r| (*r).clone()),
        checksum_update: None,
    }));
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::SqlChange;

    fn change_set(sql: &str) -> ChangeSet {
        ChangeSet::new(ChangeSetKey::new("1", "alice", "main.xml")).with_change(SqlChange::new(sql))
    }

    fn row(exec_type: ExecType, checksum: Option<CheckSum>) -> ChangeLogRow {
        ChangeLogRow {
            key: ChangeSetKey::new("1", "alice", "main.xml"),
            stored_path: "main.xml".into(),
            date_executed: None,
            order_executed: 1,
            exec_type,
            checksum,
            description: None,
            comments: None,
            tag: None,
            contexts: None,
            labels: None,
            deployment_id: None,
        }
    }

    #[test]
    fn test_no_row_is_pending() {
        assert_eq!(classify(&change_set("SELECT 1"), None).state, ChangeSetState::Pending);
    }

    #[test]
    fn test_unchanged_row_already_ran() {
        let cs = change_set("SELECT 1");
        let r = row(ExecType::Executed, Some(cs.checksum()));
        let status = classify(&cs, Some(&r));
        assert_eq!(status.state, ChangeSetState::AlreadyRan);
        assert!(!status.will_run());
        assert_eq!(status.checksum_update, None);
    }

    #[test]
    fn test_changed_row_drifts_unless_run_on_change() {
        let mut cs = change_set("SELECT 2");
        let stored = change_set("SELECT 1").checksum();
        let r = row(ExecType::Executed, Some(stored.clone()));

        assert_eq!(
            classify(&cs, Some(&r)).state,
            ChangeSetState::Drifted {
                stored,
                current: cs.checksum()
            }
        );

        cs.run_on_change = true;
        assert_eq!(
            classify(&cs, Some(&r)).state,
            ChangeSetState::Rerun {
                reason: RerunReason::Changed
            }
        );
    }

    #[test]
    fn test_run_always_reruns_unchanged() {
        let mut cs = change_set("SELECT 1");
        cs.run_always = true;
        let r = row(ExecType::Executed, Some(cs.checksum()));
        assert_eq!(
            classify(&cs, Some(&r)).state,
            ChangeSetState::Rerun {
                reason: RerunReason::RunAlways
            }
        );
    }

    #[test]
    fn test_failed_row_is_pending_again() {
        let cs = change_set("SELECT 1");
        let r = row(ExecType::Failed, Some(cs.checksum()));
        let status = classify(&cs, Some(&r));
        assert_eq!(status.state, ChangeSetState::Pending);
        assert!(status.existing.is_some());
    }

    #[test]
    fn test_cleared_checksum_is_backfilled() {
        let cs = change_set("SELECT 1");
        let status = classify(&cs, Some(&row(ExecType::MarkRan, None)));
        assert_eq!(status.state, ChangeSetState::AlreadyRan);
        assert_eq!(status.checksum_update, Some(cs.checksum()));
    }

    #[test]
    fn test_v1_checksum_upgrade() {
        let cs = change_set("SELECT 1");
        let old = CheckSum::compute_version(&cs.changes, 1);
        let status = classify(&cs, Some(&row(ExecType::Executed, Some(old))));
        assert_eq!(status.state, ChangeSetState::AlreadyRan);
        assert_eq!(status.checksum_update, Some(cs.checksum()));
    }
}
