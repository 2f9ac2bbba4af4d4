//! Changelog model
//!
//! A changelog is an ordered list of changesets built from a parsed node
//! tree. Document order is the only application order.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::change::Change;
use crate::checksum::{CheckSum, ValidCheckSum};
use crate::precondition::PreconditionSet;

pub mod builder;
pub mod filter;
pub mod node;
pub mod parameters;
pub mod path;
pub mod source;
pub mod xml;

pub use builder::{BuildOptions, ChangeLogBuilder, IncludeAllOrder};
pub use filter::{DbmsFilter, FilterExpression, RunFilter};
pub use node::{ParsedNode, SourcePosition};
pub use parameters::{ChangeLogParameters, ParameterScope};
pub use path::{IncludeResolution, PathPolicy};
pub use source::{ChangeLogSource, FileSystemSource, MemorySource};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("syntax error in {path}: {message}")]
    Syntax { path: String, message: String },

    #[error("changelog file not found: {path}")]
    NotFound { path: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cyclic include of {path} (include chain: {})", chain.join(" -> "))]
    CyclicInclude { path: String, chain: Vec<String> },

    #[error("duplicate changeset {key}")]
    DuplicateChangeSet { key: ChangeSetKey },

    #[error("{location} in {path}: missing required attribute '{attribute}'")]
    MissingAttribute {
        path: String,
        location: String,
        attribute: String,
    },

    #[error("{location} in {path}: invalid value '{value}' for '{attribute}': {message}")]
    InvalidAttribute {
        path: String,
        location: String,
        attribute: String,
        value: String,
        message: String,
    },

    #[error("{location} in {path}: unexpected element")]
    UnexpectedElement { path: String, location: String },

    #[error("{location} in {path}: unknown change type '{name}'")]
    UnknownChange {
        path: String,
        location: String,
        name: String,
    },

    #[error("includeAll found no changelog files in {path}")]
    EmptyIncludeAll { path: String },
}

/// Globally unique identity of a changeset. The path is normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct ChangeSetKey {
    pub id: String,
    pub author: String,
    pub path: String,
}

impl ChangeSetKey {
    pub fn new(id: impl Into<String>, author: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ChangeSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.path, self.id, self.author)
    }
}

/// One atomic, identified unit of change.
#[derive(Debug)]
pub struct ChangeSet {
    pub key: ChangeSetKey,
    /// File the changeset was physically read from (before `logicalFilePath`).
    pub physical_path: String,
    pub changes: Vec<Box<dyn Change>>,
    /// Explicit `<rollback>` block. `Some(empty)` is a declared no-op rollback.
    pub rollback: Option<Vec<Box<dyn Change>>>,
    pub contexts: FilterExpression,
    pub labels: BTreeSet<String>,
    pub dbms: DbmsFilter,
    pub run_always: bool,
    pub run_on_change: bool,
    pub fail_on_error: bool,
    pub run_in_transaction: bool,
    pub preconditions: Option<PreconditionSet>,
    pub valid_checksums: Vec<ValidCheckSum>,
    pub comment: Option<String>,
    pub position: Option<SourcePosition>,
}

impl ChangeSet {
    pub fn new(key: ChangeSetKey) -> Self {
        Self {
            physical_path: key.path.clone(),
            key,
            changes: Vec::new(),
            rollback: None,
            contexts: FilterExpression::default(),
            labels: BTreeSet::new(),
            dbms: DbmsFilter::default(),
            run_always: false,
            run_on_change: false,
            fail_on_error: true,
            run_in_transaction: true,
            preconditions: None,
            valid_checksums: Vec::new(),
            comment: None,
            position: None,
        }
    }

    pub fn with_change(mut self, change: impl Change + 'static) -> Self {
        self.changes.push(Box::new(change));
        self
    }

    /// Checksum under the current algorithm version.
    pub fn checksum(&self) -> CheckSum {
        CheckSum::compute(&self.changes)
    }

    /// Comma separated change names, stored as the ledger description.
    pub fn description(&self) -> String {
        let names: Vec<String> = self.changes.iter().map(|c| c.describe()).collect();
        if names.is_empty() {
            "empty".to_string()
        } else {
            names.join(", ")
        }
    }

    /// Tag labels declared by `tagDatabase` changes in this changeset.
    pub fn tag_labels(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|c| c.tag_label())
    }

    pub fn labels_string(&self) -> Option<String> {
        if self.labels.is_empty() {
            None
        } else {
            Some(self.labels.iter().cloned().collect::<Vec<_>>().join(","))
        }
    }

    pub fn contexts_string(&self) -> Option<String> {
        if self.contexts.is_empty() {
            None
        } else {
            Some(self.contexts.as_str().to_string())
        }
    }
}

/// A changeset present in the log but not selected for this run.
#[derive(Debug)]
pub struct ExcludedChangeSet {
    pub change_set: ChangeSet,
    pub reason: String,
}

/// The fully built changelog for one run.
#[derive(Debug, Default)]
pub struct ChangeLog {
    pub root_path: String,
    /// Changelog-level preconditions, in the order they were declared.
    pub preconditions: Vec<PreconditionSet>,
    change_sets: Vec<ChangeSet>,
    excluded: Vec<ExcludedChangeSet>,
}

impl ChangeLog {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, change_set: ChangeSet) {
        self.change_sets.push(change_set);
    }

    pub fn exclude(&mut self, change_set: ChangeSet, reason: impl Into<String>) {
        self.excluded.push(ExcludedChangeSet {
            change_set,
            reason: reason.into(),
        });
    }

    /// Changesets selected for this run, in document order.
    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    /// Changesets filtered out by context, label or dbms.
    pub fn excluded(&self) -> &[ExcludedChangeSet] {
        &self.excluded
    }

    /// Is the changeset present in the log at all, selected or not?
    pub fn contains(&self, key: &ChangeSetKey) -> bool {
        self.find(key).is_some()
    }

    /// Look up a changeset by key among both selected and excluded entries.
    pub fn find(&self, key: &ChangeSetKey) -> Option<&ChangeSet> {
        self.change_sets
            .iter()
            .find(|cs| &cs.key == key)
            .or_else(|| {
                self.excluded
                    .iter()
                    .map(|e| &e.change_set)
                    .find(|cs| &cs.key == key)
            })
    }

    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }
}
