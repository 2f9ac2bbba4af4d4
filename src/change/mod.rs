//! Change operations
//!
//! A [`Change`] is one operation inside a changeset. The engine treats
//! changes as opaque: it asks for a checksum payload, applies them through
//! the database capability, and asks for an inverse when rolling back.

use std::fmt;

use crate::changelog::{ParseError, ParsedNode};
use crate::database::{Database, DatabaseError, Dialect};

pub mod sql;
pub mod table;
pub mod tag;

pub use sql::SqlChange;
pub use table::{AddColumn, ColumnDef, CreateIndex, CreateTable, DropColumn, DropIndex, DropTable};
pub use tag::TagDatabase;

pub trait Change: fmt::Debug + Send + Sync {
    /// Element name of the change type, e.g. `createTable`.
    fn name(&self) -> &'static str;

    /// Normalized description of the operation that feeds the checksum.
    /// Formatting-only differences in the source must not change it.
    fn checksum_payload(&self) -> String;

    /// Statements this change issues for the given dialect, in order.
    fn statements(&self, dialect: Dialect) -> Vec<String>;

    fn apply(&self, db: &mut dyn Database) -> Result<(), DatabaseError> {
        for statement in self.statements(db.dialect()) {
            db.execute(&statement)?;
        }
        Ok(())
    }

    /// Changes that undo this one, in execution order. `None` when the
    /// change type has no automatic inverse.
    fn inverse(&self) -> Option<Vec<Box<dyn Change>>> {
        None
    }

    /// Label written onto the ledger row of the changeset, for `tagDatabase`.
    fn tag_label(&self) -> Option<&str> {
        None
    }

    /// Short human description for the ledger and reports.
    fn describe(&self) -> String {
        self.name().to_string()
    }
}

/// Build a change from a parsed (and already parameter-expanded) element.
pub fn from_node(node: &ParsedNode, path: &str) -> Result<Box<dyn Change>, ParseError> {
    let change: Box<dyn Change> = match node.name.as_str() {
        "sql" => Box::new(SqlChange::from_node(node)),
        "createTable" => Box::new(CreateTable::from_node(node, path)?),
        "dropTable" => Box::new(DropTable::from_node(node, path)?),
        "addColumn" => Box::new(AddColumn::from_node(node, path)?),
        "dropColumn" => Box::new(DropColumn::from_node(node, path)?),
        "createIndex" => Box::new(CreateIndex::from_node(node, path)?),
        "dropIndex" => Box::new(DropIndex::from_node(node, path)?),
        "tagDatabase" => Box::new(TagDatabase::from_node(node, path)?),
        other => {
            return Err(ParseError::UnknownChange {
                path: path.to_string(),
                location: node.location(),
                name: other.to_string(),
            });
        }
    };
    Ok(change)
}

/// Fetch a required, non-blank attribute.
pub(crate) fn required_attr(
    node: &ParsedNode,
    name: &str,
    path: &str,
) -> Result<String, ParseError> {
    match node.attr(name).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ParseError::MissingAttribute {
            path: path.to_string(),
            location: node.location(),
            attribute: name.to_string(),
        }),
    }
}

/// Optional attribute; blank values count as absent.
pub(crate) fn optional_attr(node: &ParsedNode, name: &str) -> Option<String> {
    node.attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Collapse every whitespace run to one space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
