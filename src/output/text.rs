//! Human-readable text output reporter
//!
//! One line per changeset, then a summary:
//! ```text
//! applied      db/main.xml::1::alice
//! skipped      db/main.xml::2::alice (context 'test' not selected)
//!
//! 1 applied, 0 reran, 0 marked ran, 0 already ran, 1 skipped, 0 failed
//! ```

use std::fmt::Write as FmtWrite;
use std::io::Write;

use crate::engine::{ChangeSetState, ChangeSetStatus, RerunReason};
use crate::lock::LockInfo;
use crate::output::{ReportError, Reporter, TextReporter};
use crate::report::RunReport;

fn format_run(report: &RunReport) -> String {
    let mut buf = String::new();
    for o in &report.outcomes {
        let _ = match o.outcome.reason() {
            Some(reason) => writeln!(buf, "{:<12} {} ({})", o.outcome.label(), o.key, reason),
            None => writeln!(buf, "{:<12} {}", o.outcome.label(), o.key),
        };
    }
    if !report.outcomes.is_empty() {
        buf.push('\n');
    }

    let s = report.summary();
    let _ = write!(
        buf,
        "{} applied, {} reran, {} marked ran, {} already ran, {} skipped, {} failed",
        s.applied, s.reran, s.marked_ran, s.already_ran, s.skipped, s.failed
    );
    if s.rolled_back > 0 {
        let _ = write!(buf, ", {} rolled back", s.rolled_back);
    }
    buf.push('\n');
    buf
}

fn state_text(state: &ChangeSetState) -> String {
    match state {
        ChangeSetState::Pending => "pending".to_string(),
        ChangeSetState::Rerun {
            reason: RerunReason::RunAlways,
        } => "rerun (runAlways)".to_string(),
        ChangeSetState::Rerun {
            reason: RerunReason::Changed,
        } => "rerun (changed)".to_string(),
        ChangeSetState::AlreadyRan => "ran".to_string(),
        ChangeSetState::Drifted { stored, current } => {
            format!("DRIFTED (stored {}, current {})", stored, current)
        }
        ChangeSetState::Filtered { reason } => format!("filtered ({})", reason),
    }
}

fn format_status(statuses: &[ChangeSetStatus]) -> String {
    let mut buf = String::new();
    for s in statuses {
        let _ = writeln!(buf, "{:<10} {}", state_text(&s.state), s.key);
    }
    let pending = statuses.iter().filter(|s| s.will_run()).count();
    let _ = writeln!(buf, "{} changeset(s) would run", pending);
    buf
}

fn format_locks(locks: &[LockInfo]) -> String {
    let mut buf = String::new();
    if locks.is_empty() {
        buf.push_str("no lock table\n");
    }
    for lock in locks {
        if lock.locked {
            let _ = writeln!(
                buf,
                "lock {} held by {} since {}",
                lock.id,
                lock.locked_by.as_deref().unwrap_or("unknown"),
                lock.granted.as_deref().unwrap_or("unknown")
            );
        } else {
            let _ = writeln!(buf, "lock {} free", lock.id);
        }
    }
    buf
}

impl Reporter for TextReporter {
    fn emit_run(&self, report: &RunReport, out: &mut dyn Write) -> Result<(), ReportError> {
        out.write_all(format_run(report).as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn emit_status(
        &self,
        statuses: &[ChangeSetStatus],
        out: &mut dyn Write,
    ) -> Result<(), ReportError> {
        out.write_all(format_status(statuses).as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn emit_locks(&self, locks: &[LockInfo], out: &mut dyn Write) -> Result<(), ReportError> {
        out.write_all(format_locks(locks).as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeSetKey;
    use crate::report::Outcome;

    fn key(id: &str) -> ChangeSetKey {
        ChangeSetKey::new(id, "alice", "db/main.xml")
    }

    #[test]
    fn run_report_lines_and_summary() {
        let mut report = RunReport::new("0000000001");
        report.push(&key("1"), Outcome::Applied);
        report.push(&key("2"), Outcome::AlreadyRan);
        report.push(
            &key("3"),
            Outcome::Skipped {
                reason: "context 'test' not selected".into(),
            },
        );
        report.push(
            &key("4"),
            Outcome::Failed {
                reason: "no such table: t".into(),
            },
        );

        let mut out = Vec::new();
        TextReporter.emit_run(&report, &mut out).expect("emit");
        let text = String::from_utf8(out).expect("utf8");
        insta::assert_snapshot!(text, @r###"
        applied      db/main.xml::1::alice
        already ran  db/main.xml::2::alice
        skipped      db/main.xml::3::alice (context 'test' not selected)
        failed       db/main.xml::4::alice (no such table: t)

        1 applied, 0 reran, 0 marked ran, 1 already ran, 1 skipped, 1 failed
        "###);
    }

    #[test]
    fn empty_run_prints_only_summary() {
        let text = format_run(&RunReport::new("1"));
        assert_eq!(
            text,
            "0 applied, 0 reran, 0 marked ran, 0 already ran, 0 skipped, 0 failed\n"
        );
    }

    #[test]
    fn rolled_back_count_is_appended() {
        let mut report = RunReport::new("1");
        report.push(&key("9"), Outcome::RolledBack);
        assert!(format_run(&report).ends_with(", 1 rolled back\n"));
    }

    #[test]
    fn status_lines() {
        let statuses = vec![
            ChangeSetStatus {
                key: key("1"),
                state: ChangeSetState::AlreadyRan,
                existing: None,
                checksum_update: None,
            },
            ChangeSetStatus {
                key: key("2"),
                state: ChangeSetState::Pending,
                existing: None,
                checksum_update: None,
            },
        ];
        assert_eq!(
            format_status(&statuses),
            "ran        db/main.xml::1::alice\npending    db/main.xml::2::alice\n1 changeset(s) would run\n"
        );
    }

    #[test]
    fn lock_lines() {
        let locks = vec![LockInfo {
            id: 1,
            locked: true,
            granted: Some("2024-01-01 00:00:00.000".into()),
            locked_by: Some("host#1#abcd1234".into()),
        }];
        assert_eq!(
            format_locks(&locks),
            "lock 1 held by host#1#abcd1234 since 2024-01-01 00:00:00.000\n"
        );
    }
}
