//! Error types for policy parsing and construction.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::grammar::Rule;

/// 1-based line and symbol (character) position in the policy text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub symbol: usize,
}

impl Position {
    /// Resolves a byte offset by scanning for newlines.
    pub fn at(source: &str, offset: usize) -> Self {
        let mut pos = Position { line: 1, symbol: 1 };
        for (i, ch) in source.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                pos.line += 1;
                pos.symbol = 1;
            } else {
                pos.symbol += 1;
            }
        }
        pos
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} symbol {}", self.line, self.symbol)
    }
}

/// The policy text does not match the grammar.
///
/// `rule` is the rule expected at the furthest offset the parser reached and
/// `end` is that offset; `begin` is the start of the line it falls on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub rule: Rule,
    pub begin: Position,
    pub end: Position,
    pub offset: usize,
    pub found: Option<char>,
    pub excerpt: String,
}

impl SyntaxError {
    pub(crate) fn new(source: &str, rule: Rule, begin: usize, offset: usize) -> Self {
        let begin = begin.min(offset);
        SyntaxError {
            rule,
            begin: Position::at(source, begin),
            end: Position::at(source, offset),
            offset,
            found: source.get(offset..).and_then(|rest| rest.chars().next()),
            excerpt: source.get(begin..offset).unwrap_or_default().to_string(),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error near {} ({} - {}): {:?}, unexpected ",
            self.rule, self.begin, self.end, self.excerpt
        )?;
        match self.found {
            Some(ch) => write!(f, "{:?}", ch),
            None => f.write_str("end of input"),
        }
    }
}

impl std::error::Error for SyntaxError {}

/// Errors raised while turning policy text into a [`crate::Policy`].
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("invalid literal '{text}' in {rule} at line {line} symbol {symbol}: {reason}")]
    InvalidLiteral {
        rule: Rule,
        text: String,
        line: usize,
        symbol: usize,
        reason: String,
    },

    #[error("malformed syntax tree: {0}")]
    MalformedTree(String),

    #[error("failed to read policy file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PolicyError>;
