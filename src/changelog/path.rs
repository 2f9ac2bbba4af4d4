//! Changelog path normalization and include resolution.
//!
//! The same logical file can be referenced as `./db/changes.xml`,
//! `db\changes.xml` or `classpath:db/changes.xml` depending on the machine
//! that ran it. Changeset identity and ledger lookups compare the
//! normalized form produced here.

use serde::{Deserialize, Serialize};

/// How a relative `include`/`includeAll` path is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeResolution {
    /// Relative to the root of the changelog source.
    #[default]
    SearchRoot,
    /// Relative to the directory of the including changelog.
    RelativeToChangelog,
}

/// Path rules fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathPolicy {
    pub case_insensitive: bool,
    pub include_resolution: IncludeResolution,
}

impl PathPolicy {
    /// Normalize a changelog path for identity comparison.
    pub fn normalize(&self, path: &str) -> String {
        let normalized = normalize_separators(path);
        if self.case_insensitive {
            normalized.to_lowercase()
        } else {
            normalized
        }
    }

    /// Resolve an include target. `relative_override` carries the
    /// `relativeToChangelogFile` attribute when the include declares it.
    pub fn resolve_include(
        &self,
        parent_file: &str,
        target: &str,
        relative_override: Option<bool>,
    ) -> String {
        let relative = relative_override
            .unwrap_or(self.include_resolution == IncludeResolution::RelativeToChangelog);

        if relative {
            let parent = normalize_separators(parent_file);
            let dir = match parent.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            };
            if dir.is_empty() {
                normalize_separators(target)
            } else {
                normalize_separators(&format!("{}/{}", dir, target))
            }
        } else {
            normalize_separators(target)
        }
    }
}

/// Forward slashes, no `classpath:` or `./` prefix, `..` collapsed.
fn normalize_separators(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let path = path.strip_prefix("classpath:").unwrap_or(&path);
    let absolute = path.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}
