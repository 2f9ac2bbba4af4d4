//! JSON output reporter

use std::io::Write;

use serde::Serialize;

use crate::engine::ChangeSetStatus;
use crate::lock::LockInfo;
use crate::output::{JsonReporter, ReportError, Reporter};
use crate::report::{RunReport, Summary};

#[derive(Serialize)]
struct RunDocument<'a> {
    succeeded: bool,
    summary: Summary,
    #[serde(flatten)]
    report: &'a RunReport,
}

#[derive(Serialize)]
struct StatusDocument<'a> {
    pending: usize,
    changesets: &'a [ChangeSetStatus],
}

impl JsonReporter {
    fn write<T: Serialize>(&self, value: &T, out: &mut dyn Write) -> Result<(), ReportError> {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| ReportError::Serialization(e.to_string()))?;
        out.write_all(json.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

impl Reporter for JsonReporter {
    fn emit_run(&self, report: &RunReport, out: &mut dyn Write) -> Result<(), ReportError> {
        self.write(
            &RunDocument {
                succeeded: report.succeeded(),
                summary: report.summary(),
                report,
            },
            out,
        )
    }

    fn emit_status(
        &self,
        statuses: &[ChangeSetStatus],
        out: &mut dyn Write,
    ) -> Result<(), ReportError> {
        self.write(
            &StatusDocument {
                pending: statuses.iter().filter(|s| s.will_run()).count(),
                changesets: statuses,
            },
            out,
        )
    }

    fn emit_locks(&self, locks: &[LockInfo], out: &mut dyn Write) -> Result<(), ReportError> {
        self.write(&locks, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeSetKey;
    use crate::engine::ChangeSetState;
    use crate::report::Outcome;

    #[test]
    fn run_document_shape() {
        let mut report = RunReport::new("0000000007");
        report.push(&ChangeSetKey::new("1", "alice", "main.xml"), Outcome::Applied);

        let mut out = Vec::new();
        JsonReporter::new(false).emit_run(&report, &mut out).expect("emit");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");

        assert_eq!(value["succeeded"], true);
        assert_eq!(value["deployment_id"], "0000000007");
        assert_eq!(value["summary"]["applied"], 1);
        assert_eq!(value["outcomes"][0]["outcome"], "applied");
        assert_eq!(value["outcomes"][0]["key"]["id"], "1");
    }

    #[test]
    fn status_document_counts_pending() {
        let statuses = vec![ChangeSetStatus {
            key: ChangeSetKey::new("1", "alice", "main.xml"),
            state: ChangeSetState::Filtered {
                reason: "dbms does not include sqlite".into(),
            },
            existing: None,
            checksum_update: None,
        }];

        let mut out = Vec::new();
        JsonReporter::new(true).emit_status(&statuses, &mut out).expect("emit");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");

        assert_eq!(value["pending"], 0);
        assert_eq!(value["changesets"][0]["state"], "filtered");
        assert_eq!(
            value["changesets"][0]["reason"],
            "dbms does not include sqlite"
        );
        assert!(value["changesets"][0].get("checksum_update").is_none());
    }
}
