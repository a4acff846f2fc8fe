// Policy domain model.
//
// A policy has two halves:
// - connections: the declared probe graph, keyed by source probe
// - queries: for each flow matcher, the list of chains flows it selects are
//   expected to traverse
//
// Policies are built once at startup and are read-only afterwards, so they
// can be shared behind an Arc without locking.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::addressing::Prefix;
use crate::builder;
use crate::error::{PolicyError, Result};

/// Identifier of an observation point.
pub type ProbeId = u32;

/// Reserved probe ID meaning "no predecessor". Telemetry from a flow's first
/// observed hop reports it as `prev_probe`, so a chain that must be covered
/// from network ingress is written with `0` as its first probe.
pub const INGRESS_PROBE: ProbeId = 0;

// ============================================================================
// CHAIN
// ============================================================================

/// An ordered path of probes, first element first as written in the policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Chain(Vec<ProbeId>);

impl Chain {
    pub fn new(probes: Vec<ProbeId>) -> Self {
        Chain(probes)
    }

    /// Probes in path order.
    pub fn probes(&self) -> &[ProbeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn head(&self) -> Option<ProbeId> {
        self.0.first().copied()
    }

    pub fn tail(&self) -> Option<ProbeId> {
        self.0.last().copied()
    }

    /// Transitions `(from, to)` the chain requires, head to tail.
    pub fn hops(&self) -> impl DoubleEndedIterator<Item = (ProbeId, ProbeId)> + '_ {
        self.0.windows(2).map(|w| (w[0], w[1]))
    }

    /// True if the chain demands coverage from network ingress.
    pub fn starts_at_ingress(&self) -> bool {
        self.head() == Some(INGRESS_PROBE)
    }
}

impl From<Vec<ProbeId>> for Chain {
    fn from(probes: Vec<ProbeId>) -> Self {
        Chain(probes)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, probe) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", probe)?;
        }
        Ok(())
    }
}

// ============================================================================
// FLOW MATCHER
// ============================================================================

/// The `(src, dst, proto, sport, dport)` literal of a check.
///
/// Equality and hashing are by field value, so two literals written
/// differently but resolving to the same fields are the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatcher {
    pub src: Prefix,
    pub dst: Prefix,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowMatcher {
    /// Selection rule used by verification: only the source prefix is
    /// consulted. Destination, protocol and ports are carried for reporting.
    #[inline]
    pub fn selects(&self, src_addr: u32) -> bool {
        self.src.contains(src_addr)
    }
}

impl fmt::Display for FlowMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {})",
            self.src, self.dst, self.protocol, self.src_port, self.dst_port
        )
    }
}

/// One flow matcher and all the chains declared for it, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub matcher: FlowMatcher,
    pub chains: Vec<Chain>,
}

// ============================================================================
// POLICY
// ============================================================================

/// Compiled policy: declared connections plus flow matcher queries.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    connections: HashMap<ProbeId, HashSet<ProbeId>>,
    queries: Vec<Query>,
    index: HashMap<FlowMatcher, usize>,
    digest: String,
}

impl Policy {
    /// Parses policy text.
    pub fn parse(source: &str) -> Result<Self> {
        builder::build_policy(source)
    }

    /// Reads and parses a policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source)
    }

    pub(crate) fn from_parts(
        connections: HashMap<ProbeId, HashSet<ProbeId>>,
        queries: Vec<Query>,
        digest: String,
    ) -> Self {
        let index = queries
            .iter()
            .enumerate()
            .map(|(i, q)| (q.matcher, i))
            .collect();
        Policy {
            connections,
            queries,
            index,
            digest,
        }
    }

    pub(crate) fn with_digest(mut self, digest: String) -> Self {
        self.digest = digest;
        self
    }

    /// Declared connection graph.
    pub fn connections(&self) -> &HashMap<ProbeId, HashSet<ProbeId>> {
        &self.connections
    }

    /// Declared destinations of `src`.
    pub fn destinations(&self, src: ProbeId) -> Option<&HashSet<ProbeId>> {
        self.connections.get(&src)
    }

    /// True if `src -> dst` is a declared connection.
    pub fn is_declared(&self, src: ProbeId, dst: ProbeId) -> bool {
        self.connections
            .get(&src)
            .is_some_and(|dsts| dsts.contains(&dst))
    }

    /// Number of declared `src -> dst` edges.
    pub fn connection_count(&self) -> usize {
        self.connections.values().map(HashSet::len).sum()
    }

    /// Queries in declaration order of their first check.
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Chains declared for a matcher.
    pub fn chains_for(&self, matcher: &FlowMatcher) -> Option<&[Chain]> {
        self.index
            .get(matcher)
            .map(|&i| self.queries[i].chains.as_slice())
    }

    /// First query, in declaration order, whose matcher selects `src_addr`.
    pub fn select(&self, src_addr: u32) -> Option<&Query> {
        self.queries.iter().find(|q| q.matcher.selects(src_addr))
    }

    /// Total number of chains across all queries.
    pub fn chain_count(&self) -> usize {
        self.queries.iter().map(|q| q.chains.len()).sum()
    }

    /// Hex SHA-256 of the source text the policy was built from.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Canonical text form: connections sorted, then one check line per chain.
impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sources: Vec<_> = self.connections.iter().collect();
        sources.sort_by_key(|(src, _)| **src);
        for (src, dsts) in sources {
            let mut dsts: Vec<_> = dsts.iter().collect();
            dsts.sort();
            for dst in dsts {
                writeln!(f, "{} -> {}", src, dst)?;
            }
        }
        for query in &self.queries {
            for chain in &query.chains {
                writeln!(f, "{}: {}", query.matcher, chain)?;
            }
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 of `text`.
pub fn digest_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(src: &str) -> FlowMatcher {
        FlowMatcher {
            src: src.parse().unwrap(),
            dst: "0.0.0.0/0".parse().unwrap(),
            protocol: 6,
            src_port: 80,
            dst_port: 0,
        }
    }

    #[test]
    fn test_chain_hops_in_path_order() {
        let chain = Chain::new(vec![1, 2, 3]);
        assert_eq!(chain.hops().collect::<Vec<_>>(), vec![(1, 2), (2, 3)]);
        assert_eq!(chain.hops().rev().next(), Some((2, 3)));
        assert_eq!(chain.to_string(), "1 -> 2 -> 3");
        assert!(!chain.starts_at_ingress());
        assert!(Chain::new(vec![INGRESS_PROBE, 1]).starts_at_ingress());
    }

    #[test]
    fn test_single_probe_chain_has_no_hops() {
        let chain = Chain::new(vec![7]);
        assert_eq!(chain.hops().count(), 0);
        assert_eq!(chain.head(), chain.tail());
    }

    #[test]
    fn test_flow_matcher_structural_equality() {
        use std::collections::HashSet;
        let a = matcher("10.0.0.0/24");
        let b = matcher("10.0.0.9/24");
        assert_eq!(a, b);
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(a.to_string(), "(10.0.0.0/24, 0.0.0.0/0, 6, 80, 0)");
    }

    #[test]
    fn test_select_uses_declaration_order() {
        let broad = matcher("10.0.0.0/8");
        let narrow = matcher("10.0.0.0/24");
        let policy = Policy::from_parts(
            HashMap::new(),
            vec![
                Query {
                    matcher: broad,
                    chains: vec![Chain::new(vec![1, 2])],
                },
                Query {
                    matcher: narrow,
                    chains: vec![Chain::new(vec![3, 4])],
                },
            ],
            String::new(),
        );
        let addr = u32::from(std::net::Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(policy.select(addr).map(|q| q.matcher), Some(broad));
        assert_eq!(policy.chains_for(&narrow).map(<[Chain]>::len), Some(1));
        assert_eq!(policy.chain_count(), 2);
    }

    #[test]
    fn test_query_serializes_chains_as_arrays() {
        let query = Query {
            matcher: matcher("10.0.0.0/24"),
            chains: vec![Chain::new(vec![1, 2, 3])],
        };
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["chains"], serde_json::json!([[1, 2, 3]]));
        assert_eq!(value["matcher"]["src_port"], 80);

        let back: Query = serde_json::from_value(value).unwrap();
        assert_eq!(back, query);
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let d = digest_text("1 -> 2\n");
        assert_eq!(d.len(), 64);
        assert_eq!(d, digest_text("1 -> 2\n"));
        assert_ne!(d, digest_text("1 -> 3\n"));
    }
}
