//! Tag filter expressions for selecting scenarios.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! expr    := term ("or" term)*
//! term    := factor ("and" factor)*
//! factor  := "not" factor | "(" expr ")" | TAG
//! ```
//!
//! The empty expression matches everything.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    All,
    Tag(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, tags: &[String]) -> bool {
        match self {
            Expr::All => true,
            Expr::Tag(tag) => tags.iter().any(|t| t == tag),
            Expr::Not(inner) => !inner.eval(tags),
            Expr::And(a, b) => a.eval(tags) && b.eval(tags),
            Expr::Or(a, b) => a.eval(tags) || b.eval(tags),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::All => Ok(()),
            Expr::Tag(tag) => f.write_str(tag),
            Expr::Not(inner) => write!(f, "not {}", inner),
            Expr::And(a, b) => write!(f, "({} and {})", a, b),
            Expr::Or(a, b) => write!(f, "({} or {})", a, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Tag(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' {
            chars.next();
            tokens.push(Token::Open);
        } else if c == ')' {
            chars.next();
            tokens.push(Token::Close);
        } else if is_tag_char(c) {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if !is_tag_char(c) {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(match word.to_lowercase().as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                _ => Token::Tag(word),
            });
        } else {
            return Err(Error::Config(format!(
                "unexpected character '{}' in filter '{}'",
                c, input
            )));
        }
    }

    Ok(tokens)
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            left = Expr::Or(Box::new(left), Box::new(self.term()?));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            left = Expr::And(Box::new(left), Box::new(self.factor()?));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.factor()?))),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(Error::Config("unbalanced parentheses in filter".to_string())),
                }
            }
            Some(Token::Tag(tag)) => Ok(Expr::Tag(tag)),
            Some(token) => Err(Error::Config(format!("unexpected {:?} in filter", token))),
            None => Err(Error::Config("filter ends unexpectedly".to_string())),
        }
    }
}

/// A parsed tag filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    expr: Expr,
}

impl Default for TagFilter {
    fn default() -> Self {
        Self { expr: Expr::All }
    }
}

impl TagFilter {
    /// Parses a filter expression.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Self::default());
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(Error::Config(format!(
                "unexpected {:?} after end of filter '{}'",
                token, input
            )));
        }
        Ok(Self { expr })
    }

    /// Returns true if a scenario carrying `tags` is selected.
    pub fn matches(&self, tags: &[String]) -> bool {
        self.expr.eval(tags)
    }
}

impl FromStr for TagFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.expr.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = TagFilter::parse("   ").unwrap();
        assert!(filter.matches(&[]));
        assert!(filter.matches(&tags(&["slow"])));
    }

    #[test]
    fn precedence_binds_and_tighter_than_or() {
        let filter = TagFilter::parse("a or b and c").unwrap();
        assert!(filter.matches(&tags(&["a"])));
        assert!(!filter.matches(&tags(&["b"])));
        assert!(filter.matches(&tags(&["b", "c"])));
    }

    #[test]
    fn compound_expression_with_parentheses() {
        let filter: TagFilter = "not slow and (network or ssh)".parse().unwrap();
        assert!(filter.matches(&tags(&["network"])));
        assert!(filter.matches(&tags(&["ssh", "daemon"])));
        assert!(!filter.matches(&tags(&["ssh", "slow"])));
        assert!(!filter.matches(&tags(&["file"])));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let filter = TagFilter::parse("NOT slow").unwrap();
        assert!(filter.matches(&tags(&["fast"])));
        assert_eq!(filter.to_string(), "not slow");
    }

    #[test]
    fn malformed_filters_are_config_errors() {
        for bad in ["(slow", "slow and", "slow)", "a ! b", "and"] {
            assert!(
                matches!(TagFilter::parse(bad), Err(Error::Config(_))),
                "expected error for {:?}",
                bad
            );
        }
    }
}
