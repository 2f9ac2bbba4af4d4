//! Where changelog files come from.
//!
//! The builder resolves `include` and `includeAll` through a
//! [`ChangeLogSource`], so the same walk works over a directory on disk or
//! over trees that were assembled in memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::changelog::ParseError;
use crate::changelog::node::ParsedNode;
use crate::changelog::xml::parse_xml;

/// Trait for changelog sources. Paths are normalized, `/` separated and
/// relative to the source root.
pub trait ChangeLogSource {
    /// Load and parse one changelog file.
    fn load(&self, path: &str) -> Result<ParsedNode, ParseError>;

    /// List the file names (not full paths) directly inside `dir`.
    fn list(&self, dir: &str) -> Result<Vec<String>, ParseError>;

    /// Can [`load`](Self::load) parse this file?
    fn supports(&self, path: &str) -> bool;
}

/// Reads XML changelogs from a directory tree.
pub struct FileSystemSource {
    root: PathBuf,
}

impl FileSystemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

impl ChangeLogSource for FileSystemSource {
    fn load(&self, path: &str) -> Result<ParsedNode, ParseError> {
        let full = self.resolve(path);
        if !full.is_file() {
            return Err(ParseError::NotFound {
                path: path.to_string(),
            });
        }
        let xml = std::fs::read_to_string(&full).map_err(|e| ParseError::Io {
            path: path.to_string(),
            source: e,
        })?;
        parse_xml(&xml, path)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, ParseError> {
        let full = self.resolve(dir);
        if !full.is_dir() {
            return Err(ParseError::NotFound {
                path: dir.to_string(),
            });
        }
        let entries = std::fs::read_dir(&full).map_err(|e| ParseError::Io {
            path: dir.to_string(),
            source: e,
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ParseError::Io {
                path: dir.to_string(),
                source: e,
            })?;
            let path = entry.path();
            if path.is_file()
                && let Some(name) = path.file_name()
            {
                names.push(name.to_string_lossy().to_string());
            }
        }
        Ok(names)
    }

    fn supports(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("xml"))
            .unwrap_or(false)
    }
}

/// In-memory changelog trees keyed by normalized path.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    files: BTreeMap<String, ParsedNode>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, root: ParsedNode) -> Self {
        self.files.insert(path.into(), root);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, root: ParsedNode) {
        self.files.insert(path.into(), root);
    }
}

impl ChangeLogSource for MemorySource {
    fn load(&self, path: &str) -> Result<ParsedNode, ParseError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| ParseError::NotFound {
                path: path.to_string(),
            })
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, ParseError> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir.trim_end_matches('/'))
        };
        let names: Vec<String> = self
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(ParseError::NotFound {
                path: dir.to_string(),
            });
        }
        Ok(names)
    }

    fn supports(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_lists_direct_children_only() {
        let source = MemorySource::new()
            .with_file("db/a.xml", ParsedNode::new("databaseChangeLog"))
            .with_file("db/b.xml", ParsedNode::new("databaseChangeLog"))
            .with_file("db/nested/c.xml", ParsedNode::new("databaseChangeLog"));

        let mut names = source.list("db").expect("list");
        names.sort();
        assert_eq!(names, vec!["a.xml", "b.xml"]);
        assert!(matches!(source.list("missing"), Err(ParseError::NotFound { .. })));
    }

    #[test]
    fn file_system_source_reads_xml() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("db")).expect("mkdir");
        std::fs::write(
            dir.path().join("db/master.xml"),
            "<databaseChangeLog><changeSet id=\"1\" author=\"a\"/></databaseChangeLog>",
        )
        .expect("write");
        std::fs::write(dir.path().join("db/notes.txt"), "not a changelog").expect("write");

        let source = FileSystemSource::new(dir.path());
        let root = source.load("db/master.xml").expect("load");
        assert_eq!(root.children.len(), 1);

        let mut names = source.list("db").expect("list");
        names.sort();
        assert_eq!(names, vec!["master.xml", "notes.txt"]);
        assert!(source.supports("db/master.xml"));
        assert!(!source.supports("db/notes.txt"));
        assert!(matches!(source.load("db/missing.xml"), Err(ParseError::NotFound { .. })));
    }
}
