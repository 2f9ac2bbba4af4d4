//! Per-run outcome report.

use serde::Serialize;

use crate::changelog::ChangeSetKey;

/// What happened to one changeset during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Reran,
    MarkedRan { reason: String },
    AlreadyRan,
    Skipped { reason: String },
    Failed { reason: String },
    RolledBack,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Reran => "reran",
            Outcome::MarkedRan { .. } => "marked ran",
            Outcome::AlreadyRan => "already ran",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed { .. } => "failed",
            Outcome::RolledBack => "rolled back",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::MarkedRan { reason }
            | Outcome::Skipped { reason }
            | Outcome::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSetOutcome {
    pub key: ChangeSetKey,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub deployment_id: String,
    pub outcomes: Vec<ChangeSetOutcome>,
}

/// Outcome totals for the summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub applied: usize,
    pub reran: usize,
    pub marked_ran: usize,
    pub already_ran: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rolled_back: usize,
}

impl RunReport {
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, key: &ChangeSetKey, outcome: Outcome) {
        self.outcomes.push(ChangeSetOutcome {
            key: key.clone(),
            outcome,
        });
    }

    /// False when any changeset failed, even with `failOnError="false"`.
    pub fn succeeded(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|o| matches!(o.outcome, Outcome::Failed { .. }))
    }

    pub fn outcome_of(&self, key: &ChangeSetKey) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| &o.key == key)
            .map(|o| &o.outcome)
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for o in &self.outcomes {
            match o.outcome {
                Outcome::Applied => summary.applied += 1,
                Outcome::Reran => summary.reran += 1,
                Outcome::MarkedRan { .. } => summary.marked_ran += 1,
                Outcome::AlreadyRan => summary.already_ran += 1,
                Outcome::Skipped { .. } => summary.skipped += 1,
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::RolledBack => summary.rolled_back += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ChangeSetKey {
        ChangeSetKey::new(id, "alice", "main.xml")
    }

    #[test]
    fn test_failed_outcome_fails_the_run() {
        let mut report = RunReport::new("1");
        report.push(&key("1"), Outcome::Applied);
        assert!(report.succeeded());
        report.push(
            &key("2"),
            Outcome::Failed {
                reason: "boom".into(),
            },
        );
        assert!(!report.succeeded());
        assert_eq!(report.summary().failed, 1);
        assert_eq!(report.outcome_of(&key("2")).and_then(Outcome::reason), Some("boom"));
    }

    #[test]
    fn test_outcome_serializes_flat() {
        let mut report = RunReport::new("0000000042");
        report.push(
            &key("1"),
            Outcome::Skipped {
                reason: "context 'test' not selected".into(),
            },
        );
        insta::assert_json_snapshot!(report, @r###"
        {
          "deployment_id": "0000000042",
          "outcomes": [
            {
              "key": {
                "id": "1",
                "author": "alice",
                "path": "main.xml"
              },
              "outcome": "skipped",
              "reason": "context 'test' not selected"
            }
          ]
        }
        "###);
    }
}
