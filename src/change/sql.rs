//! Raw SQL change (`<sql>`).

use crate::change::{Change, normalize_whitespace};
use crate::changelog::ParsedNode;
use crate::database::Dialect;

const DEFAULT_DELIMITER: &str = ";";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlChange {
    pub sql: String,
    pub split_statements: bool,
    pub end_delimiter: String,
    pub strip_comments: bool,
}

impl SqlChange {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            split_statements: true,
            end_delimiter: DEFAULT_DELIMITER.to_string(),
            strip_comments: false,
        }
    }

    pub fn from_node(node: &ParsedNode) -> Self {
        Self {
            sql: node.trimmed_text().unwrap_or_default().to_string(),
            split_statements: node.bool_attr("splitStatements").unwrap_or(true),
            end_delimiter: node
                .attr("endDelimiter")
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .unwrap_or(DEFAULT_DELIMITER)
                .to_string(),
            strip_comments: node.bool_attr("stripComments").unwrap_or(false),
        }
    }
}

impl Change for SqlChange {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn checksum_payload(&self) -> String {
        format!(
            "split={};delimiter={};strip={};{}",
            self.split_statements,
            self.end_delimiter,
            self.strip_comments,
            normalize_whitespace(&self.sql)
        )
    }

    fn statements(&self, _dialect: Dialect) -> Vec<String> {
        let text = if self.strip_comments {
            strip_sql_comments(&self.sql)
        } else {
            self.sql.clone()
        };

        if self.split_statements {
            split_sql(&text, &self.end_delimiter)
        } else {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        }
    }
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

/// Split SQL on a delimiter outside of quoted strings. A word delimiter
/// such as `GO` only counts when it stands alone on a line.
pub fn split_sql(sql: &str, delimiter: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    if delimiter.chars().all(char::is_alphanumeric) {
        for line in sql.lines() {
            if line.trim().eq_ignore_ascii_case(delimiter) {
                push_statement(&mut statements, &mut current);
            } else {
                current.push_str(line);
                current.push('\n');
            }
        }
        push_statement(&mut statements, &mut current);
        return statements;
    }

    let extra_chars = delimiter.chars().count().saturating_sub(1);
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices();
    while let Some((idx, ch)) = chars.next() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => {
                if sql[idx..].starts_with(delimiter) {
                    push_statement(&mut statements, &mut current);
                    for _ in 0..extra_chars {
                        chars.next();
                    }
                    continue;
                }
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                }
                current.push(ch);
            }
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

/// Remove `--` line comments and `/* */` block comments outside quotes.
fn strip_sql_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            out.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        let next = chars.peek().copied();
        match (ch, next) {
            ('-', Some('-')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                out.push(' ');
            }
            ('\'', _) | ('"', _) => {
                quote = Some(ch);
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_on_semicolons_outside_quotes() {
        let change = SqlChange::new("INSERT INTO t VALUES ('a;b');\nINSERT INTO t VALUES ('c');");
        assert_eq!(
            change.statements(Dialect::Sqlite),
            vec!["INSERT INTO t VALUES ('a;b')", "INSERT INTO t VALUES ('c')"]
        );
    }

    #[test]
    fn test_no_split_keeps_text_whole() {
        let node = ParsedNode::new("sql")
            .with_attr("splitStatements", "false")
            .with_text("  CREATE TRIGGER x; BEGIN; END  ");
        let change = SqlChange::from_node(&node);
        assert_eq!(change.statements(Dialect::Sqlite), vec!["CREATE TRIGGER x; BEGIN; END"]);
    }

    #[test]
    fn test_word_delimiter_on_own_line() {
        let statements = split_sql("SELECT 1\nGO\nSELECT 'GOTO'\ngo\n", "GO");
        assert_eq!(statements, vec!["SELECT 1", "SELECT 'GOTO'"]);
    }

    #[test]
    fn test_custom_symbol_delimiter() {
        let statements = split_sql("SELECT 1 $$ SELECT 2 $$", "$$");
        assert_eq!(statements, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_strip_comments() {
        let node = ParsedNode::new("sql")
            .with_attr("stripComments", "true")
            .with_text("-- leading\nSELECT 1; /* block; */ SELECT '--not a comment';");
        let change = SqlChange::from_node(&node);
        assert_eq!(
            change.statements(Dialect::Sqlite),
            vec!["SELECT 1", "SELECT '--not a comment'"]
        );
    }

    #[test]
    fn test_payload_ignores_whitespace_layout() {
        let a = SqlChange::new("CREATE TABLE t (\n    id integer\n);");
        let b = SqlChange::new("CREATE TABLE t ( id integer );");
        assert_eq!(a.checksum_payload(), b.checksum_payload());

        let c = SqlChange::new("CREATE TABLE t ( id bigint );");
        assert_ne!(a.checksum_payload(), c.checksum_payload());
    }
}
