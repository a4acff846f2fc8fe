//! # Verification Engine
//!
//! For every ingested report:
//! 1. record the `(prev_probe, probe)` transition in the adjacency graph
//! 2. select the first query, in declaration order, whose source prefix
//!    contains the flow's source address; destination, protocol and ports
//!    are not consulted
//! 3. check each chain of that query against the graph, walking from the
//!    chain's tail back to its head and requiring every `(chain[i],
//!    chain[i + 1])` transition to have been observed
//! 4. emit one match event per satisfied chain
//!
//! Matches are not consumed: a later report of a selected flow re-emits the
//! event for every chain that is still satisfied.

use policy_engine::{Chain, FlowMatcher, Policy};
use serde::Serialize;
use std::sync::Arc;

use crate::adjacency::{AdjacencyGraph, GraphStats, RetentionPolicy};
use crate::telemetry::{FlowKey, Report};

/// A chain found fully covered by observed transitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEvent {
    pub matcher: FlowMatcher,
    pub chain: Chain,
    pub flow: FlowKey,
    pub timestamp: f64,
}

/// Single-writer verifier state: the read-only policy and the live graph.
#[derive(Debug)]
pub struct VerificationEngine {
    policy: Arc<Policy>,
    graph: AdjacencyGraph,
    processed: u64,
    matches: u64,
}

impl VerificationEngine {
    pub fn new(policy: Arc<Policy>, retention: RetentionPolicy) -> Self {
        Self {
            policy,
            graph: AdjacencyGraph::new(retention),
            processed: 0,
            matches: 0,
        }
    }

    /// Records `report` and returns the match events it triggers.
    pub fn ingest(&mut self, report: Report) -> Vec<MatchEvent> {
        let flow = report.flow;
        let timestamp = report.timestamp;
        self.graph.record(report);
        self.processed += 1;

        let Some(query) = self.policy.select(flow.src_bits()) else {
            return Vec::new();
        };

        let events: Vec<MatchEvent> = query
            .chains
            .iter()
            .filter(|chain| self.is_covered(chain))
            .map(|chain| MatchEvent {
                matcher: query.matcher,
                chain: chain.clone(),
                flow,
                timestamp,
            })
            .collect();

        self.matches += events.len() as u64;
        events
    }

    /// True if every transition of `chain` is present in the graph.
    ///
    /// A single-probe chain requires no transitions and is always covered.
    pub fn is_covered(&self, chain: &Chain) -> bool {
        chain
            .hops()
            .rev()
            .all(|(prev, probe)| self.graph.contains(prev, probe))
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn graph(&self) -> &AdjacencyGraph {
        &self.graph
    }

    /// Reports ingested so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Match events emitted so far.
    pub fn matches(&self) -> u64 {
        self.matches
    }

    pub fn graph_stats(&self) -> GraphStats {
        self.graph.stats()
    }
}
