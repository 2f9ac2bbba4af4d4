//! Changelog parameters and `${name}` substitution.
//!
//! Values are layered by scope. Front-end values (config file, `-D` flags)
//! sit in [`ParameterScope::Global`], `<property>` declarations in the
//! changelog override them, and properties guarded by a context/dbms/label
//! filter that matched the run override both. Within a scope the latest
//! declaration wins.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParameterScope {
    Global,
    ChangeLog,
    Conditional,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: String,
    scope: ParameterScope,
    /// Set for `global="false"` properties: only visible inside this file.
    local_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeLogParameters {
    entries: Vec<Entry>,
}

impl ChangeLogParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a parameter table from front-end supplied values, in order.
    pub fn from_globals<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = Self::new();
        for (name, value) in values {
            params.set(name, value, ParameterScope::Global, None);
        }
        params
    }

    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        scope: ParameterScope,
        local_to: Option<String>,
    ) {
        self.entries.push(Entry {
            name: name.into(),
            value: value.into(),
            scope,
            local_to,
        });
    }

    /// Resolve `name` as seen from changelog file `file`.
    pub fn value(&self, name: &str, file: &str) -> Option<&str> {
        let mut best: Option<&Entry> = None;
        for entry in &self.entries {
            if entry.name != name {
                continue;
            }
            if let Some(owner) = &entry.local_to
                && owner != file
            {
                continue;
            }
            // `>=` so later declarations in the same scope win.
            if best.is_none_or(|b| entry.scope >= b.scope) {
                best = Some(entry);
            }
        }
        best.map(|e| e.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every `${name}` token with its value. Substituted values are
    /// not scanned again, and unknown tokens are left as written.
    pub fn expand(&self, text: &str, file: &str) -> String {
        if !text.contains("${") {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.value(name.trim(), file) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for ParameterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParameterScope::Global => "global",
            ParameterScope::ChangeLog => "changelog",
            ParameterScope::Conditional => "conditional",
        })
    }
}
