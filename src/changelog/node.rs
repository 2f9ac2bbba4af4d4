//! Format-independent parsed node tree.
//!
//! Every changelog format parser produces the same shape: a tag name, an
//! ordered attribute list, ordered children and optional text. The model
//! builder only ever consumes this tree.

use std::fmt;

/// Line/column provenance of a node in its source document (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} column {}", self.line, self.column)
    }
}

/// A single element of a parsed changelog document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<ParsedNode>,
    pub text: Option<String>,
    pub position: Option<SourcePosition>,
}

impl ParsedNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
            position: None,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: ParsedNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.position = Some(SourcePosition { line, column });
        self
    }

    /// First value of the named attribute, if present.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute as a boolean. Anything other than `true` (case-insensitive) is false.
    pub fn bool_attr(&self, key: &str) -> Option<bool> {
        self.attr(key).map(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    pub fn child(&self, name: &str) -> Option<&ParsedNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ParsedNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text content with surrounding whitespace removed; `None` when blank.
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Human-readable location for error messages.
    pub fn location(&self) -> String {
        match self.position {
            Some(pos) => format!("<{}> at {}", self.name, pos),
            None => format!("<{}>", self.name),
        }
    }
}
