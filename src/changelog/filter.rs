//! Context, label and dbms filters.
//!
//! Context and label filters share one small boolean expression language:
//! `a, b` or `a or b`, `a and b`, `!a` or `not a`, and parentheses. Atoms
//! compare case-insensitively.

use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Atom(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, names: &BTreeSet<String>) -> bool {
        match self {
            Expr::Atom(a) => names.contains(a),
            Expr::Not(e) => !e.eval(names),
            Expr::And(l, r) => l.eval(names) && r.eval(names),
            Expr::Or(l, r) => l.eval(names) || r.eval(names),
        }
    }
}

/// A parsed context or label expression. An empty expression matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterExpression {
    source: String,
    expr: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid filter expression '{expression}': {message}")]
pub struct FilterSyntaxError {
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if word.is_empty() {
            return;
        }
        let lowered = word.to_lowercase();
        tokens.push(match lowered.as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Ident(lowered),
        });
        word.clear();
    };

    for ch in input.chars() {
        match ch {
            ',' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Or);
            }
            '!' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Not);
            }
            '(' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Open);
            }
            ')' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Close);
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.next().cloned() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("unbalanced parenthesis".to_string()),
                }
            }
            Some(Token::Ident(name)) => Ok(Expr::Atom(name)),
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

impl FilterExpression {
    pub fn parse(input: &str) -> Result<Self, FilterSyntaxError> {
        let tokens = tokenize(input);
        if tokens.is_empty() {
            return Ok(Self::default());
        }

        let mut parser = ExprParser {
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser
            .parse_or()
            .and_then(|expr| match parser.peek() {
                None => Ok(expr),
                Some(t) => Err(format!("trailing token {:?}", t)),
            })
            .map_err(|message| FilterSyntaxError {
                expression: input.to_string(),
                message,
            })?;

        Ok(Self {
            source: input.trim().to_string(),
            expr: Some(expr),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against a set of lowercase names. Empty expressions match.
    pub fn matches(&self, names: &BTreeSet<String>) -> bool {
        self.expr.as_ref().is_none_or(|e| e.eval(names))
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Split a comma separated list into a lowercase set.
pub fn name_set(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Contexts and labels selected for one run.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub contexts: BTreeSet<String>,
    pub labels: FilterExpression,
    pub dialect: String,
}

impl RunFilter {
    /// Does a changeset's `context` expression select it for this run?
    pub fn matches_contexts(&self, changeset_contexts: &FilterExpression) -> bool {
        self.contexts.is_empty() || changeset_contexts.matches(&self.contexts)
    }

    /// Does the run's label expression select a changeset carrying `labels`?
    pub fn matches_labels(&self, labels: &BTreeSet<String>) -> bool {
        labels.is_empty() || self.labels.matches(labels)
    }

    pub fn matches_dbms(&self, dbms: &DbmsFilter) -> bool {
        dbms.matches(&self.dialect)
    }
}

/// A `dbms="..."` attribute: `all`, `none`, or a list of dialect names
/// with optional `!` negations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DbmsFilter {
    none: bool,
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl DbmsFilter {
    pub fn parse(list: &str) -> Self {
        let mut filter = Self::default();
        for entry in name_set(list) {
            match entry.as_str() {
                "all" => {}
                "none" => filter.none = true,
                _ => match entry.strip_prefix('!') {
                    Some(negated) => {
                        filter.exclude.insert(negated.trim().to_string());
                    }
                    None => {
                        filter.include.insert(entry);
                    }
                },
            }
        }
        filter
    }

    pub fn matches(&self, dialect: &str) -> bool {
        if self.none {
            return false;
        }
        let dialect = dialect.to_lowercase();
        if self.exclude.contains(&dialect) {
            return false;
        }
        self.include.is_empty() || self.include.contains(&dialect)
    }

    pub fn is_unrestricted(&self) -> bool {
        !self.none && self.include.is_empty() && self.exclude.is_empty()
    }
}
