//! Changelog model builder
//!
//! Walks a parsed `databaseChangeLog` tree and produces the ordered
//! changeset list for one run. `include` and `includeAll` are resolved
//! inline through a [`ChangeLogSource`], `${name}` parameters are expanded
//! on every attribute and text value before it is interpreted, and
//! changesets whose context, label or dbms filter rejects the run are kept
//! aside as excluded rather than dropped.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::change::{self, Change, SqlChange};
use crate::changelog::filter::name_set;
use crate::changelog::{
    ChangeLog, ChangeLogParameters, ChangeLogSource, ChangeSet, ChangeSetKey, DbmsFilter,
    FilterExpression, ParameterScope, ParseError, ParsedNode, PathPolicy, RunFilter,
};
use crate::checksum::ValidCheckSum;
use crate::precondition::PreconditionSet;

/// Order in which `includeAll` visits the files of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeAllOrder {
    /// Plain string order: `10.xml` sorts before `2.xml`.
    #[default]
    Lexicographic,
    /// Digit runs compare numerically: `2.xml` sorts before `10.xml`.
    Natural,
}

impl IncludeAllOrder {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            IncludeAllOrder::Lexicographic => a.cmp(b),
            IncludeAllOrder::Natural => natural_cmp(a, b),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub filter: RunFilter,
    pub path_policy: PathPolicy,
    pub include_all_order: IncludeAllOrder,
}

pub struct ChangeLogBuilder<'a> {
    source: &'a dyn ChangeLogSource,
    options: BuildOptions,
}

/// Mutable state threaded through one build.
struct Walk {
    changelog: ChangeLog,
    seen: HashSet<ChangeSetKey>,
    /// Normalized paths of the files currently being walked, outermost first.
    stack: Vec<String>,
}

impl<'a> ChangeLogBuilder<'a> {
    pub fn new(source: &'a dyn ChangeLogSource, options: BuildOptions) -> Self {
        Self { source, options }
    }

    /// Load `root_path` from the source and build the changelog.
    pub fn build(
        &self,
        root_path: &str,
        params: &mut ChangeLogParameters,
    ) -> Result<ChangeLog, ParseError> {
        let resolved = self.options.path_policy.resolve_include("", root_path, Some(false));
        let root = self.source.load(&resolved)?;
        self.build_tree(root, &resolved, params)
    }

    /// Build from an already parsed root tree. Includes are still loaded
    /// through the source.
    pub fn build_tree(
        &self,
        root: ParsedNode,
        root_path: &str,
        params: &mut ChangeLogParameters,
    ) -> Result<ChangeLog, ParseError> {
        let policy = &self.options.path_policy;
        let mut walk = Walk {
            changelog: ChangeLog::new(policy.normalize(root_path)),
            seen: HashSet::new(),
            stack: vec![policy.normalize(root_path)],
        };
        self.walk_file(&root, root_path, params, &mut walk)?;
        debug!(
            changelog = root_path,
            selected = walk.changelog.len(),
            excluded = walk.changelog.excluded().len(),
            "changelog built"
        );
        Ok(walk.changelog)
    }

    fn walk_file(
        &self,
        root: &ParsedNode,
        physical: &str,
        params: &mut ChangeLogParameters,
        walk: &mut Walk,
    ) -> Result<(), ParseError> {
        if root.name != "databaseChangeLog" {
            return Err(ParseError::UnexpectedElement {
                path: physical.to_string(),
                location: root.location(),
            });
        }

        let policy = &self.options.path_policy;
        let file_key = policy.normalize(physical);
        let logical = match root.attr("logicalFilePath") {
            Some(p) if !p.trim().is_empty() => policy.normalize(&params.expand(p, &file_key)),
            _ => file_key.clone(),
        };

        for child in &root.children {
            match child.name.as_str() {
                "property" => self.declare_property(child, &file_key, params)?,
                "preConditions" => {
                    let node = expand_node(child, params, &file_key);
                    let set = PreconditionSet::from_node(&node, physical, policy)?;
                    if set.uses_mark_ran() {
                        return Err(ParseError::InvalidAttribute {
                            path: physical.to_string(),
                            location: node.location(),
                            attribute: "onFail".to_string(),
                            value: "MARK_RAN".to_string(),
                            message: "MARK_RAN is only valid on changeset preconditions"
                                .to_string(),
                        });
                    }
                    walk.changelog.preconditions.push(set);
                }
                "changeSet" => {
                    let node = expand_node(child, params, &file_key);
                    let change_set = self.change_set(&node, physical, &logical)?;
                    self.admit(change_set, walk)?;
                }
                "include" => {
                    let node = expand_node(child, params, &file_key);
                    let target = required(&node, "file", physical)?;
                    let resolved = policy.resolve_include(
                        physical,
                        &target,
                        node.bool_attr("relativeToChangelogFile"),
                    );
                    self.include_file(&resolved, params, walk)?;
                }
                "includeAll" => {
                    let node = expand_node(child, params, &file_key);
                    self.include_all(&node, physical, params, walk)?;
                }
                _ => {
                    return Err(ParseError::UnexpectedElement {
                        path: physical.to_string(),
                        location: child.location(),
                    });
                }
            }
        }
        Ok(())
    }

    fn include_file(
        &self,
        resolved: &str,
        params: &mut ChangeLogParameters,
        walk: &mut Walk,
    ) -> Result<(), ParseError> {
        let key = self.options.path_policy.normalize(resolved);
        if walk.stack.contains(&key) {
            let mut chain = walk.stack.clone();
            chain.push(key.clone());
            return Err(ParseError::CyclicInclude { path: key, chain });
        }

        debug!(file = resolved, "including changelog");
        let root = self.source.load(resolved)?;
        walk.stack.push(key);
        let result = self.walk_file(&root, resolved, params, walk);
        walk.stack.pop();
        result
    }

    /// Include every supported file directly inside the directory, in
    /// `include_all_order`. Subdirectories are not descended into.
    fn include_all(
        &self,
        node: &ParsedNode,
        physical: &str,
        params: &mut ChangeLogParameters,
        walk: &mut Walk,
    ) -> Result<(), ParseError> {
        let policy = &self.options.path_policy;
        let target = required(node, "path", physical)?;
        let dir = policy.resolve_include(
            physical,
            &target,
            node.bool_attr("relativeToChangelogFile"),
        );
        let error_if_empty = node.bool_attr("errorIfMissingOrEmpty").unwrap_or(true);

        let names = match self.source.list(&dir) {
            Ok(names) => names,
            Err(ParseError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut files: Vec<String> = names
            .into_iter()
            .map(|name| {
                if dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir, name)
                }
            })
            .filter(|path| self.source.supports(path))
            .collect();
        files.sort_by(|a, b| self.options.include_all_order.compare(a, b));

        if files.is_empty() {
            if error_if_empty {
                return Err(ParseError::EmptyIncludeAll { path: dir });
            }
            debug!(dir = %dir, "includeAll matched no files");
            return Ok(());
        }

        for file in files {
            self.include_file(&file, params, walk)?;
        }
        Ok(())
    }

    /// Record a `<property>`. Filtered properties that do not match the run
    /// are ignored.
    fn declare_property(
        &self,
        node: &ParsedNode,
        file_key: &str,
        params: &mut ChangeLogParameters,
    ) -> Result<(), ParseError> {
        let node = expand_node(node, params, file_key);
        let name = required(&node, "name", file_key)?;
        let value = node.attr("value").unwrap_or_default().to_string();
        let filter = &self.options.filter;

        let mut conditional = false;
        if let Some(context) = node.attr("context").or_else(|| node.attr("contexts")) {
            let expr = parse_filter(&node, "context", context, file_key)?;
            if !filter.matches_contexts(&expr) {
                return Ok(());
            }
            conditional = !expr.is_empty();
        }
        if let Some(labels) = node.attr("labels") {
            let labels = name_set(labels);
            if !filter.matches_labels(&labels) {
                return Ok(());
            }
            conditional |= !labels.is_empty();
        }
        if let Some(dbms) = node.attr("dbms") {
            let dbms = DbmsFilter::parse(dbms);
            if !filter.matches_dbms(&dbms) {
                return Ok(());
            }
            conditional |= !dbms.is_unrestricted();
        }

        let scope = if conditional {
            ParameterScope::Conditional
        } else {
            ParameterScope::ChangeLog
        };
        let local_to = match node.bool_attr("global") {
            Some(false) => Some(file_key.to_string()),
            _ => None,
        };
        params.set(name, value, scope, local_to);
        Ok(())
    }

    fn change_set(
        &self,
        node: &ParsedNode,
        physical: &str,
        logical: &str,
    ) -> Result<ChangeSet, ParseError> {
        let policy = &self.options.path_policy;
        let path = match node.attr("logicalFilePath") {
            Some(p) if !p.trim().is_empty() => policy.normalize(p),
            _ => logical.to_string(),
        };
        let key = ChangeSetKey::new(
            required(node, "id", physical)?,
            required(node, "author", physical)?,
            path,
        );

        let mut change_set = ChangeSet::new(key);
        change_set.physical_path = physical.to_string();
        change_set.position = node.position;
        change_set.run_always = node.bool_attr("runAlways").unwrap_or(false);
        change_set.run_on_change = node.bool_attr("runOnChange").unwrap_or(false);
        change_set.fail_on_error = node.bool_attr("failOnError").unwrap_or(true);
        change_set.run_in_transaction = node.bool_attr("runInTransaction").unwrap_or(true);

        if let Some(context) = node.attr("context").or_else(|| node.attr("contexts")) {
            change_set.contexts = parse_filter(node, "context", context, physical)?;
        }
        if let Some(labels) = node.attr("labels") {
            change_set.labels = name_set(labels);
        }
        if let Some(dbms) = node.attr("dbms") {
            change_set.dbms = DbmsFilter::parse(dbms);
        }

        for child in &node.children {
            match child.name.as_str() {
                "comment" => change_set.comment = child.trimmed_text().map(str::to_string),
                "preConditions" => {
                    change_set.preconditions =
                        Some(PreconditionSet::from_node(child, physical, policy)?);
                }
                "validCheckSum" => {
                    let text = child.trimmed_text().unwrap_or_default();
                    let valid: ValidCheckSum =
                        text.parse().map_err(|_| ParseError::InvalidAttribute {
                            path: physical.to_string(),
                            location: child.location(),
                            attribute: "validCheckSum".to_string(),
                            value: text.to_string(),
                            message: "expected a checksum or ANY".to_string(),
                        })?;
                    change_set.valid_checksums.push(valid);
                }
                "rollback" => change_set.rollback = Some(rollback_changes(child, physical)?),
                _ => change_set.changes.push(change::from_node(child, physical)?),
            }
        }
        Ok(change_set)
    }

    /// Reject duplicates, then route the changeset to the selected or
    /// excluded list.
    fn admit(&self, change_set: ChangeSet, walk: &mut Walk) -> Result<(), ParseError> {
        if !walk.seen.insert(change_set.key.clone()) {
            return Err(ParseError::DuplicateChangeSet {
                key: change_set.key,
            });
        }

        let filter = &self.options.filter;
        let reason = if !filter.matches_dbms(&change_set.dbms) {
            Some(format!("dbms does not include {}", filter.dialect))
        } else if !filter.matches_contexts(&change_set.contexts) {
            Some(format!("context '{}' not selected", change_set.contexts))
        } else if !filter.matches_labels(&change_set.labels) {
            Some(format!(
                "labels '{}' not selected",
                change_set.labels_string().unwrap_or_default()
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => {
                debug!(changeset = %change_set.key, reason = %reason, "changeset excluded");
                walk.changelog.exclude(change_set, reason);
            }
            None => walk.changelog.push(change_set),
        }
        Ok(())
    }
}

/// `<rollback>` holds either SQL text, nested change elements, or nothing
/// (an explicit no-op).
fn rollback_changes(node: &ParsedNode, path: &str) -> Result<Vec<Box<dyn Change>>, ParseError> {
    let mut changes: Vec<Box<dyn Change>> = Vec::new();
    if let Some(sql) = node.trimmed_text() {
        changes.push(Box::new(SqlChange::new(sql)));
    }
    for child in &node.children {
        changes.push(change::from_node(child, path)?);
    }
    Ok(changes)
}

/// Copy of `node` with parameters expanded in every attribute and text value.
fn expand_node(node: &ParsedNode, params: &ChangeLogParameters, file: &str) -> ParsedNode {
    ParsedNode {
        name: node.name.clone(),
        attributes: node
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), params.expand(v, file)))
            .collect(),
        children: node
            .children
            .iter()
            .map(|c| expand_node(c, params, file))
            .collect(),
        text: node.text.as_ref().map(|t| params.expand(t, file)),
        position: node.position,
    }
}

fn required(node: &ParsedNode, name: &str, path: &str) -> Result<String, ParseError> {
    match node.attr(name).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ParseError::MissingAttribute {
            path: path.to_string(),
            location: node.location(),
            attribute: name.to_string(),
        }),
    }
}

fn parse_filter(
    node: &ParsedNode,
    attribute: &str,
    value: &str,
    path: &str,
) -> Result<FilterExpression, ParseError> {
    FilterExpression::parse(value).map_err(|e| ParseError::InvalidAttribute {
        path: path.to_string(),
        location: node.location(),
        attribute: attribute.to_string(),
        value: value.to_string(),
        message: e.message,
    })
}

/// Compare strings treating runs of ASCII digits as numbers.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let mut left = String::new();
                while let Some(c) = a.peek().copied().filter(char::is_ascii_digit) {
                    left.push(c);
                    a.next();
                }
                let mut right = String::new();
                while let Some(c) = b.peek().copied().filter(char::is_ascii_digit) {
                    right.push(c);
                    b.next();
                }
                let left_trimmed = left.trim_start_matches('0');
                let right_trimmed = right.trim_start_matches('0');
                let ord = left_trimmed
                    .len()
                    .cmp(&right_trimmed.len())
                    .then_with(|| left_trimmed.cmp(right_trimmed))
                    .then_with(|| left.len().cmp(&right.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}
