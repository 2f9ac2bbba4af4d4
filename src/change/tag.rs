//! `<tagDatabase tag="..."/>`: marks the ledger row of its own changeset.

use crate::change::{Change, required_attr};
use crate::changelog::{ParseError, ParsedNode};
use crate::database::Dialect;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDatabase {
    pub tag: String,
}

impl TagDatabase {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn from_node(node: &ParsedNode, path: &str) -> Result<Self, ParseError> {
        Ok(Self {
            tag: required_attr(node, "tag", path)?,
        })
    }
}

impl Change for TagDatabase {
    fn name(&self) -> &'static str {
        "tagDatabase"
    }

    fn checksum_payload(&self) -> String {
        self.tag.clone()
    }

    fn statements(&self, _dialect: Dialect) -> Vec<String> {
        Vec::new()
    }

    // Removing the ledger row removes the tag with it.
    fn inverse(&self) -> Option<Vec<Box<dyn Change>>> {
        Some(Vec::new())
    }

    fn tag_label(&self) -> Option<&str> {
        Some(&self.tag)
    }

    fn describe(&self) -> String {
        format!("tagDatabase {}", self.tag)
    }
}
