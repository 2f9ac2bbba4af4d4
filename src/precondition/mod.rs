//! Preconditions
//!
//! A [`PreconditionSet`] gates a changeset (or the whole changelog) on
//! predicates evaluated against the target database. A predicate that
//! evaluates to false is a *failure* and is handled by `onFail`; a predicate
//! that cannot be evaluated is an *error* and is handled by `onError`.

use std::collections::HashSet;

use serde::Serialize;
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::changelog::{ChangeSetKey, DbmsFilter, ParseError, ParsedNode, PathPolicy};
use crate::database::{Database, DatabaseError};

/// What to do when a precondition fails or errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorPolicy {
    /// Abort the whole run.
    #[default]
    Halt,
    /// Log and run the changeset anyway.
    Warn,
    /// Record the changeset as ran without executing it.
    MarkRan,
    /// Skip the changeset; it is retried on the next run.
    Continue,
}

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("sqlCheck returned no rows: {sql}")]
    NoResult { sql: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Dbms(DbmsFilter),
    SqlCheck { expected: String, sql: String },
    TableExists { schema: Option<String>, table: String },
    ChangeSetExecuted { key: ChangeSetKey },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Vec<Condition>),
}

/// Ledger state a condition can observe besides the database itself.
pub struct EvaluationContext<'a> {
    pub ran: &'a HashSet<ChangeSetKey>,
}

impl Condition {
    fn from_node(node: &ParsedNode, path: &str, policy: &PathPolicy) -> Result<Self, ParseError> {
        let required = |name: &str| -> Result<String, ParseError> {
            node.attr(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ParseError::MissingAttribute {
                    path: path.to_string(),
                    location: node.location(),
                    attribute: name.to_string(),
                })
        };

        let condition = match node.name.as_str() {
            "dbms" => Condition::Dbms(DbmsFilter::parse(&required("type")?)),
            "sqlCheck" => Condition::SqlCheck {
                expected: required("expectedResult")?,
                sql: node.trimmed_text().unwrap_or_default().to_string(),
            },
            "tableExists" => Condition::TableExists {
                schema: node
                    .attr("schemaName")
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
                table: required("tableName")?,
            },
            "changeSetExecuted" => Condition::ChangeSetExecuted {
                key: ChangeSetKey::new(
                    required("id")?,
                    required("author")?,
                    policy.normalize(&required("changeLogFile")?),
                ),
            },
            "and" => Condition::And(Self::children(node, path, policy)?),
            "or" => Condition::Or(Self::children(node, path, policy)?),
            "not" => Condition::Not(Self::children(node, path, policy)?),
            _ => {
                return Err(ParseError::UnexpectedElement {
                    path: path.to_string(),
                    location: node.location(),
                });
            }
        };
        Ok(condition)
    }

    fn children(
        node: &ParsedNode,
        path: &str,
        policy: &PathPolicy,
    ) -> Result<Vec<Condition>, ParseError> {
        node.children
            .iter()
            .map(|c| Condition::from_node(c, path, policy))
            .collect()
    }

    pub fn evaluate(
        &self,
        db: &mut dyn Database,
        ctx: &EvaluationContext<'_>,
    ) -> Result<bool, PreconditionError> {
        match self {
            Condition::Dbms(filter) => Ok(filter.matches(db.dialect().type_name())),
            Condition::SqlCheck { expected, sql } => {
                let rows = db.query(sql)?;
                let actual = rows
                    .first()
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| PreconditionError::NoResult { sql: sql.clone() })?
                    .text(0)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                Ok(actual == expected.trim())
            }
            Condition::TableExists { schema, table } => {
                let schema = schema
                    .clone()
                    .or_else(|| db.default_schema().map(str::to_string));
                Ok(db.table_exists(schema.as_deref(), table)?)
            }
            Condition::ChangeSetExecuted { key } => Ok(ctx.ran.contains(key)),
            Condition::And(all) => {
                for c in all {
                    if !c.evaluate(db, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(any) => {
                for c in any {
                    if c.evaluate(db, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(any.is_empty())
            }
            // `<not>` with several children negates each of them.
            Condition::Not(all) => {
                for c in all {
                    if c.evaluate(db, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Condition::Dbms(_) => "dbms".to_string(),
            Condition::SqlCheck { expected, sql } => {
                format!("sqlCheck expected '{}' from: {}", expected, sql)
            }
            Condition::TableExists { table, .. } => format!("tableExists {}", table),
            Condition::ChangeSetExecuted { key } => format!("changeSetExecuted {}", key),
            Condition::And(_) => "and".to_string(),
            Condition::Or(_) => "or".to_string(),
            Condition::Not(_) => "not".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionSet {
    pub on_fail: ErrorPolicy,
    pub on_error: ErrorPolicy,
    pub on_fail_message: Option<String>,
    pub on_error_message: Option<String>,
    /// Top-level conditions are implicitly and-ed.
    pub conditions: Vec<Condition>,
}

/// Result of checking a precondition set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionOutcome {
    Passed,
    Failed { policy: ErrorPolicy, message: String },
    Errored { policy: ErrorPolicy, message: String },
}

impl PreconditionSet {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self {
            on_fail: ErrorPolicy::Halt,
            on_error: ErrorPolicy::Halt,
            on_fail_message: None,
            on_error_message: None,
            conditions,
        }
    }

    pub fn with_on_fail(mut self, policy: ErrorPolicy) -> Self {
        self.on_fail = policy;
        self
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    /// Read a `<preConditions>` element.
    pub fn from_node(
        node: &ParsedNode,
        path: &str,
        policy: &PathPolicy,
    ) -> Result<Self, ParseError> {
        let parse_policy = |attribute: &str| -> Result<ErrorPolicy, ParseError> {
            match node.attr(attribute).map(str::trim).filter(|v| !v.is_empty()) {
                None => Ok(ErrorPolicy::Halt),
                Some(value) => value.parse().map_err(|_| ParseError::InvalidAttribute {
                    path: path.to_string(),
                    location: node.location(),
                    attribute: attribute.to_string(),
                    value: value.to_string(),
                    message: "expected HALT, WARN, MARK_RAN or CONTINUE".to_string(),
                }),
            }
        };

        Ok(Self {
            on_fail: parse_policy("onFail")?,
            on_error: parse_policy("onError")?,
            on_fail_message: node.attr("onFailMessage").map(str::to_string),
            on_error_message: node.attr("onErrorMessage").map(str::to_string),
            conditions: Condition::children(node, path, policy)?,
        })
    }

    /// Is `MARK_RAN` used by either policy?
    pub fn uses_mark_ran(&self) -> bool {
        self.on_fail == ErrorPolicy::MarkRan || self.on_error == ErrorPolicy::MarkRan
    }

    pub fn check(&self, db: &mut dyn Database, ctx: &EvaluationContext<'_>) -> PreconditionOutcome {
        for condition in &self.conditions {
            match condition.evaluate(db, ctx) {
                Ok(true) => {}
                Ok(false) => {
                    return PreconditionOutcome::Failed {
                        policy: self.on_fail,
                        message: self
                            .on_fail_message
                            .clone()
                            .unwrap_or_else(|| format!("{} failed", condition.describe())),
                    };
                }
                Err(e) => {
                    return PreconditionOutcome::Errored {
                        policy: self.on_error,
                        message: self
                            .on_error_message
                            .clone()
                            .unwrap_or_else(|| format!("{}: {}", condition.describe(), e)),
                    };
                }
            }
        }
        PreconditionOutcome::Passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;

    fn db() -> SqliteDatabase {
        let mut db = SqliteDatabase::open_in_memory().expect("open");
        db.execute("CREATE TABLE person (id INTEGER)").expect("create");
        db.execute("INSERT INTO person VALUES (1), (2)").expect("insert");
        db
    }

    fn check(set: &PreconditionSet, db: &mut SqliteDatabase) -> PreconditionOutcome {
        let ran = HashSet::new();
        set.check(db, &EvaluationContext { ran: &ran })
    }

    #[test]
    fn test_policy_spellings() {
        assert_eq!("MARK_RAN".parse::<ErrorPolicy>().ok(), Some(ErrorPolicy::MarkRan));
        assert_eq!("continue".parse::<ErrorPolicy>().ok(), Some(ErrorPolicy::Continue));
        assert_eq!(ErrorPolicy::MarkRan.to_string(), "MARK_RAN");
        assert!("SOMETIMES".parse::<ErrorPolicy>().is_err());
    }

    #[test]
    fn test_parse_nested_conditions() {
        let node = ParsedNode::new("preConditions")
            .with_attr("onFail", "MARK_RAN")
            .with_child(
                ParsedNode::new("not").with_child(
                    ParsedNode::new("tableExists").with_attr("tableName", "person"),
                ),
            )
            .with_child(
                ParsedNode::new("changeSetExecuted")
                    .with_attr("id", "1")
                    .with_attr("author", "bob")
                    .with_attr("changeLogFile", "./db/main.xml"),
            );
        let set = PreconditionSet::from_node(&node, "main.xml", &PathPolicy::default())
            .expect("parse");
        assert_eq!(set.on_fail, ErrorPolicy::MarkRan);
        assert_eq!(set.on_error, ErrorPolicy::Halt);
        assert_eq!(
            set.conditions[1],
            Condition::ChangeSetExecuted {
                key: ChangeSetKey::new("1", "bob", "db/main.xml")
            }
        );
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let node = ParsedNode::new("preConditions").with_attr("onFail", "SOMETIMES");
        let err =
            PreconditionSet::from_node(&node, "main.xml", &PathPolicy::default()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidAttribute { .. }), "{}", err);
    }

    #[test]
    fn test_sql_check_and_table_exists() {
        let mut db = db();
        let set = PreconditionSet::new(vec![
            Condition::SqlCheck {
                expected: "2".into(),
                sql: "SELECT COUNT(*) FROM person".into(),
            },
            Condition::TableExists {
                schema: None,
                table: "PERSON".into(),
            },
        ]);
        assert_eq!(check(&set, &mut db), PreconditionOutcome::Passed);

        let set = PreconditionSet::new(vec![Condition::SqlCheck {
            expected: "0".into(),
            sql: "SELECT COUNT(*) FROM person".into(),
        }])
        .with_on_fail(ErrorPolicy::Continue);
        assert!(matches!(
            check(&set, &mut db),
            PreconditionOutcome::Failed {
                policy: ErrorPolicy::Continue,
                ..
            }
        ));
    }

    #[test]
    fn test_broken_sql_is_an_error_not_a_failure() {
        let mut db = db();
        let set = PreconditionSet::new(vec![Condition::SqlCheck {
            expected: "0".into(),
            sql: "SELECT COUNT(*) FROM nowhere".into(),
        }])
        .with_on_fail(ErrorPolicy::Continue)
        .with_on_error(ErrorPolicy::Warn);
        assert!(matches!(
            check(&set, &mut db),
            PreconditionOutcome::Errored {
                policy: ErrorPolicy::Warn,
                ..
            }
        ));
    }

    #[test]
    fn test_dbms_and_boolean_combinators() {
        let mut db = db();
        let set = PreconditionSet::new(vec![Condition::Or(vec![
            Condition::Dbms(DbmsFilter::parse("postgresql")),
            Condition::Not(vec![Condition::Dbms(DbmsFilter::parse("mysql"))]),
        ])]);
        assert_eq!(check(&set, &mut db), PreconditionOutcome::Passed);
    }

    #[test]
    fn test_custom_fail_message() {
        let mut db = db();
        let mut set = PreconditionSet::new(vec![Condition::TableExists {
            schema: None,
            table: "missing".into(),
        }]);
        set.on_fail_message = Some("run the bootstrap first".into());
        assert_eq!(
            check(&set, &mut db),
            PreconditionOutcome::Failed {
                policy: ErrorPolicy::Halt,
                message: "run the bootstrap first".into()
            }
        );
    }
}
