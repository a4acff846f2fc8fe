//! Grammar engine for the path policy language.
//!
//! ```text
//! Policy     <- ws Connection+ ws Check+ !.
//! Connection <- probe ws "->" ws probe ws
//! Check      <- Flow ws ':' ws Chain '\n'
//! Chain      <- probe ws "->" ws Chain / probe
//! Flow       <- '(' prefix delim prefix delim probe delim probe delim probe ws ')'
//! prefix     <- [0-9]+ '.' [0-9]+ '.' [0-9]+ '.' [0-9]+ mask?
//! mask       <- '/' [0-9]+
//! probe      <- [0-9]+
//! delim      <- ws ',' ws
//! ws         <- (' ' / '\t' / '\n' / '\r')*
//! ```
//!
//! Parsing happens in two passes. The pest parser generated from
//! `policy.pest` matches the input, and its pairs are flattened in pre-order
//! into `(rule, begin, end)` tokens. The syntax tree is then assembled from
//! those tokens by span containment: a token becomes a child of the nearest
//! open token whose span encloses it. `ws` and `delim` are silent, so every
//! recorded token has a non-empty span.

use std::fmt;
use std::fmt::Write as _;

use pest::error::{ErrorVariant, InputLocation};
use pest::iterators::Pairs;
use pest::Parser as _;

use crate::error::SyntaxError;

mod peg {
    use pest_derive::Parser;

    #[derive(Parser)]
    #[grammar = "policy.pest"]
    pub(super) struct PolicyParser;
}

// ============================================================================
// RULES
// ============================================================================

/// Rule kinds of the policy grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    Policy,
    Connection,
    Check,
    Chain,
    Flow,
    Prefix,
    Mask,
    Probe,
}

impl Rule {
    /// Name as written in the grammar.
    pub const fn name(&self) -> &'static str {
        match self {
            Rule::Policy => "Policy",
            Rule::Connection => "Connection",
            Rule::Check => "Check",
            Rule::Chain => "Chain",
            Rule::Flow => "Flow",
            Rule::Prefix => "prefix",
            Rule::Mask => "mask",
            Rule::Probe => "probe",
        }
    }

    fn from_peg(rule: peg::Rule) -> Option<Rule> {
        Some(match rule {
            peg::Rule::policy => Rule::Policy,
            peg::Rule::connection => Rule::Connection,
            peg::Rule::check => Rule::Check,
            peg::Rule::chain => Rule::Chain,
            peg::Rule::flow => Rule::Flow,
            peg::Rule::prefix => Rule::Prefix,
            peg::Rule::mask => Rule::Mask,
            peg::Rule::probe => Rule::Probe,
            _ => return None,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// SYNTAX TREE
// ============================================================================

/// A node of the syntax tree: rule kind, `[begin, end)` byte span into the
/// source, and the nodes contained in that span, left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub rule: Rule,
    pub begin: usize,
    pub end: usize,
    pub children: Vec<Node>,
}

impl Node {
    fn new(rule: Rule, begin: usize, end: usize) -> Self {
        Node {
            rule,
            begin,
            end,
            children: Vec::new(),
        }
    }

    /// Source text covered by this node.
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        &source[self.begin..self.end]
    }

    /// Direct children of the given kind, in textual order.
    pub fn children_of(&self, rule: Rule) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(move |c| c.rule == rule)
    }

    /// First direct child of the given kind.
    pub fn child(&self, rule: Rule) -> Option<&Node> {
        self.children_of(rule).next()
    }

    /// True if the span `[begin, end)` lies within this node's span.
    pub fn encloses(&self, begin: usize, end: usize) -> bool {
        self.begin <= begin && end <= self.end
    }
}

// Chains nest one level per hop; release them without recursing.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

/// Result of a successful parse.
#[derive(Debug, Clone)]
pub struct SyntaxTree<'s> {
    source: &'s str,
    root: Node,
    token_count: usize,
}

impl<'s> SyntaxTree<'s> {
    pub fn source(&self) -> &'s str {
        self.source
    }

    /// The `Policy` node spanning the whole input.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Text of a node of this tree.
    pub fn text(&self, node: &Node) -> &'s str {
        node.text(self.source)
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.token_count
    }

    pub fn is_empty(&self) -> bool {
        self.token_count == 0
    }

    /// Indented dump of the tree, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(&self.root, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            let _ = writeln!(
                out,
                "{:indent$}{} {:?}",
                "",
                node.rule,
                node.text(self.source),
                indent = depth
            );
            for child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }
}

/// Parses a complete policy text.
///
/// The whole input must match `Policy`. On failure the error names the rule
/// expected at the furthest offset the parser reached.
pub fn parse(source: &str) -> Result<SyntaxTree<'_>, SyntaxError> {
    let pairs = peg::PolicyParser::parse(peg::Rule::policy, source)
        .map_err(|e| syntax_error(source, e))?;

    let tokens = tokens(pairs);
    let token_count = tokens.len();
    let mut roots = build_tree(&tokens);
    match (roots.pop(), roots.is_empty()) {
        (Some(root), true) if root.rule == Rule::Policy => Ok(SyntaxTree {
            source,
            root,
            token_count,
        }),
        _ => Err(SyntaxError::new(source, Rule::Policy, 0, 0)),
    }
}

fn syntax_error(source: &str, err: pest::error::Error<peg::Rule>) -> SyntaxError {
    let offset = match err.location {
        InputLocation::Pos(pos) => pos,
        InputLocation::Span((begin, _)) => begin,
    };
    let rule = match &err.variant {
        ErrorVariant::ParsingError { positives, .. } => {
            positives.iter().copied().find_map(Rule::from_peg)
        }
        ErrorVariant::CustomError { .. } => None,
    }
    .unwrap_or(Rule::Policy);
    // The excerpt runs from the start of the failing line.
    let line_start = source[..offset].rfind('\n').map_or(0, |i| i + 1);
    SyntaxError::new(source, rule, line_start, offset)
}

// ============================================================================
// TREE CONSTRUCTION
// ============================================================================

/// Assembles pre-ordered tokens into trees by span containment.
fn build_tree(tokens: &[Token]) -> Vec<Node> {
    let mut roots = Vec::new();
    let mut open: Vec<Node> = Vec::new();

    for token in tokens {
        while let Some(top) = open.last() {
            if top.encloses(token.begin, token.end) {
                break;
            }
            close_top(&mut open, &mut roots);
        }
        open.push(Node::new(token.rule, token.begin, token.end));
    }
    while !open.is_empty() {
        close_top(&mut open, &mut roots);
    }
    roots
}

fn close_top(open: &mut Vec<Node>, roots: &mut Vec<Node>) {
    if let Some(done) = open.pop() {
        match open.last_mut() {
            Some(parent) => parent.children.push(done),
            None => roots.push(done),
        }
    }
}

// ============================================================================
// TOKENS
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Token {
    rule: Rule,
    begin: usize,
    end: usize,
}

/// Flattens parser pairs into pre-ordered tokens.
///
/// A chain is matched as a flat run of probes. Every probe in it opens a
/// `Chain` token running to the end of the whole chain, which restores the
/// right-nested shape of `Chain <- probe ws "->" ws Chain / probe`.
fn tokens(pairs: Pairs<'_, peg::Rule>) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chain_end = 0;

    for pair in pairs.flatten() {
        let span = pair.as_span();
        let (begin, end) = (span.start(), span.end());
        let rule = match Rule::from_peg(pair.as_rule()) {
            Some(Rule::Chain) => {
                chain_end = end;
                continue;
            }
            Some(rule) => rule,
            None => continue,
        };
        if rule == Rule::Probe && begin < chain_end {
            tokens.push(Token {
                rule: Rule::Chain,
                begin,
                end: chain_end,
            });
        }
        tokens.push(Token { rule, begin, end });
    }
    tokens
}
