// Policy builder.
//
// Walks the immediate children of the `Policy` node once, top to bottom:
// - Connection: two probes, source then destination
// - Check: one Flow (two prefixes, then protocol, source port, destination
//   port) and one Chain
//
// Chains nest their remainder as a child Chain node. They are flattened by
// walking down that nesting, which yields probes in textual order.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::str::FromStr;

use crate::addressing::Prefix;
use crate::error::{PolicyError, Position, Result};
use crate::grammar::{self, Node, Rule, SyntaxTree};
use crate::policy::{digest_text, Chain, FlowMatcher, Policy, ProbeId, Query};

/// Incremental policy construction.
///
/// Checks whose matchers compare equal share one query; their chains are
/// appended in the order they were added.
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    connections: HashMap<ProbeId, HashSet<ProbeId>>,
    queries: Vec<Query>,
    index: HashMap<FlowMatcher, usize>,
    digest: Option<String>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `src -> dst`.
    pub fn add_connection(&mut self, src: ProbeId, dst: ProbeId) -> &mut Self {
        self.connections.entry(src).or_default().insert(dst);
        self
    }

    /// Appends a chain to the query of `matcher`, creating it on first use.
    pub fn add_chain(&mut self, matcher: FlowMatcher, chain: Chain) -> &mut Self {
        match self.index.get(&matcher) {
            Some(&i) => self.queries[i].chains.push(chain),
            None => {
                self.index.insert(matcher, self.queries.len());
                self.queries.push(Query {
                    matcher,
                    chains: vec![chain],
                });
            }
        }
        self
    }

    /// Records the digest of the source text the policy came from.
    pub fn source_digest(&mut self, digest: String) -> &mut Self {
        self.digest = Some(digest);
        self
    }

    /// Finishes the policy. Without a source digest, the digest is taken
    /// over the canonical text form.
    pub fn build(self) -> Policy {
        let policy = Policy::from_parts(
            self.connections,
            self.queries,
            self.digest.unwrap_or_default(),
        );
        if policy.digest().is_empty() {
            let digest = digest_text(&policy.to_string());
            policy.with_digest(digest)
        } else {
            policy
        }
    }
}

/// Parses `source` and builds the policy it describes.
pub fn build_policy(source: &str) -> Result<Policy> {
    let tree = grammar::parse(source)?;
    let mut builder = PolicyBuilder::new();

    for node in &tree.root().children {
        match node.rule {
            Rule::Connection => {
                let (src, dst) = connection(&tree, node)?;
                builder.add_connection(src, dst);
            }
            Rule::Check => {
                let (matcher, chain) = check(&tree, node)?;
                builder.add_chain(matcher, chain);
            }
            other => {
                return Err(PolicyError::MalformedTree(format!(
                    "unexpected {} under Policy",
                    other
                )))
            }
        }
    }

    builder.source_digest(digest_text(source));
    Ok(builder.build())
}

fn connection(tree: &SyntaxTree<'_>, node: &Node) -> Result<(ProbeId, ProbeId)> {
    let mut probes = node.children_of(Rule::Probe);
    match (probes.next(), probes.next()) {
        (Some(src), Some(dst)) => Ok((number(tree, src)?, number(tree, dst)?)),
        _ => Err(malformed(tree, node, "Connection without two probes")),
    }
}

fn check(tree: &SyntaxTree<'_>, node: &Node) -> Result<(FlowMatcher, Chain)> {
    let flow_node = node
        .child(Rule::Flow)
        .ok_or_else(|| malformed(tree, node, "Check without Flow"))?;
    let chain_node = node
        .child(Rule::Chain)
        .ok_or_else(|| malformed(tree, node, "Check without Chain"))?;
    Ok((flow(tree, flow_node)?, chain(tree, chain_node)?))
}

fn flow(tree: &SyntaxTree<'_>, node: &Node) -> Result<FlowMatcher> {
    let prefixes: Vec<&Node> = node.children_of(Rule::Prefix).collect();
    let probes: Vec<&Node> = node.children_of(Rule::Probe).collect();
    let (&[src, dst], &[protocol, src_port, dst_port]) = (prefixes.as_slice(), probes.as_slice())
    else {
        return Err(malformed(
            tree,
            node,
            "Flow needs two prefixes and three numbers",
        ));
    };

    Ok(FlowMatcher {
        src: prefix(tree, src)?,
        dst: prefix(tree, dst)?,
        protocol: number(tree, protocol)?,
        src_port: number(tree, src_port)?,
        dst_port: number(tree, dst_port)?,
    })
}

fn chain(tree: &SyntaxTree<'_>, node: &Node) -> Result<Chain> {
    let mut probes = Vec::new();
    let mut level = Some(node);
    while let Some(current) = level {
        let probe = current
            .child(Rule::Probe)
            .ok_or_else(|| malformed(tree, current, "Chain without probe"))?;
        probes.push(number(tree, probe)?);
        level = current.child(Rule::Chain);
    }
    Ok(Chain::new(probes))
}

fn prefix(tree: &SyntaxTree<'_>, node: &Node) -> Result<Prefix> {
    Prefix::parse(tree.text(node)).map_err(|e| invalid_literal(tree, node, e.to_string()))
}

fn number<T>(tree: &SyntaxTree<'_>, node: &Node) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    tree.text(node)
        .parse()
        .map_err(|e: T::Err| invalid_literal(tree, node, e.to_string()))
}

fn invalid_literal(tree: &SyntaxTree<'_>, node: &Node, reason: String) -> PolicyError {
    let at = Position::at(tree.source(), node.begin);
    PolicyError::InvalidLiteral {
        rule: node.rule,
        text: tree.text(node).to_string(),
        line: at.line,
        symbol: at.symbol,
        reason,
    }
}

fn malformed(tree: &SyntaxTree<'_>, node: &Node, what: &str) -> PolicyError {
    let at = Position::at(tree.source(), node.begin);
    PolicyError::MalformedTree(format!("{} at {}", what, at))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1 -> 2\n2 -> 3\n(10.0.0.0/24, 0.0.0.0/0, 6, 80, 0):\n1 -> 2 -> 3\n";

    #[test]
    fn test_connections_keyed_by_source() {
        let policy = build_policy("1 -> 2\n1 -> 3\n4 -> 1\n(1.1.1.1, 0.0.0.0/0, 6, 1, 2): 1\n")
            .unwrap();
        assert_eq!(policy.connection_count(), 3);
        assert_eq!(policy.destinations(1).map(|d| d.len()), Some(2));
        assert!(policy.is_declared(4, 1));
        assert!(!policy.is_declared(1, 4));
    }

    #[test]
    fn test_three_hop_chain_in_text_order() {
        let policy = build_policy(SAMPLE).unwrap();
        let query = &policy.queries()[0];
        assert_eq!(query.chains, vec![Chain::new(vec![1, 2, 3])]);
    }

    #[test]
    fn test_flow_fields() {
        let policy = build_policy(SAMPLE).unwrap();
        let m = policy.queries()[0].matcher;
        assert_eq!(m.src, "10.0.0.0/24".parse().unwrap());
        assert!(m.dst.is_any());
        assert_eq!((m.protocol, m.src_port, m.dst_port), (6, 80, 0));
    }

    #[test]
    fn test_equal_flow_literals_share_query() {
        let text = "1 -> 2\n\
                    (10.0.0.0/24, 0.0.0.0/0, 6, 80, 0): 1 -> 2\n\
                    (10.0.0.128/24,0.0.0.0/0,006,80,00): 2 -> 3\n";
        let policy = build_policy(text).unwrap();
        assert_eq!(policy.queries().len(), 1);
        assert_eq!(
            policy.queries()[0].chains,
            vec![Chain::new(vec![1, 2]), Chain::new(vec![2, 3])]
        );
    }

    #[test]
    fn test_out_of_range_literal_is_reported() {
        let text = "1 -> 2\n(10.0.0.0/24, 0.0.0.0/0, 6, 70000, 0): 1 -> 2\n";
        match build_policy(text) {
            Err(PolicyError::InvalidLiteral {
                rule, text, line, ..
            }) => {
                assert_eq!(rule, Rule::Probe);
                assert_eq!(text, "70000");
                assert_eq!(line, 2);
            }
            other => panic!("expected InvalidLiteral, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_octet_is_reported() {
        let text = "1 -> 2\n(10.0.0.300, 0.0.0.0/0, 6, 1, 0): 1 -> 2\n";
        assert!(matches!(
            build_policy(text),
            Err(PolicyError::InvalidLiteral {
                rule: Rule::Prefix,
                ..
            })
        ));
    }

    #[test]
    fn test_digest_tracks_source_text() {
        let a = build_policy(SAMPLE).unwrap();
        let b = build_policy(&SAMPLE.replace("1 -> 2\n2", "1  -> 2\n2")).unwrap();
        assert_eq!(a.digest(), digest_text(SAMPLE));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_builder_without_source_digest() {
        let mut builder = PolicyBuilder::new();
        builder.add_connection(1, 2).add_chain(
            FlowMatcher {
                src: Prefix::host(1),
                dst: Prefix::host(2),
                protocol: 17,
                src_port: 1,
                dst_port: 2,
            },
            Chain::new(vec![1, 2]),
        );
        let policy = builder.build();
        assert_eq!(policy.digest(), digest_text(&policy.to_string()));
    }
}
