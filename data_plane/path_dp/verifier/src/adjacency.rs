//! # Live Adjacency Graph
//!
//! Accumulates the hop transitions `(prev_probe, probe)` observed in
//! telemetry, keyed `prev -> probe -> reports`. Entries are created lazily on
//! first sight of a transition.
//!
//! The graph is owned by a single writer (the verification engine), so it
//! carries no locks. Growth is bounded by a [`RetentionPolicy`]:
//! - per hop, only the most recent reports are kept
//! - a hop budget evicts the least recently touched transition
//! - an optional time window evicts transitions whose newest evidence is
//!   older than the window, measured against the newest timestamp seen

use log::{debug, warn};
use policy_engine::ProbeId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::telemetry::Report;

// ============================================================================
// RETENTION
// ============================================================================

/// Bounds on what the adjacency graph keeps.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Maximum number of distinct transitions; `None` is unbounded.
    pub max_hops: Option<usize>,
    /// Reports kept per transition, newest last.
    pub max_reports_per_hop: usize,
    /// Seconds of telemetry time a transition stays alive after its newest
    /// report; `None` disables windowed eviction.
    pub window: Option<f64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_hops: Some(65_536),
            max_reports_per_hop: 64,
            window: None,
        }
    }
}

impl RetentionPolicy {
    /// Keeps everything forever.
    pub fn unbounded() -> Self {
        Self {
            max_hops: None,
            max_reports_per_hop: usize::MAX,
            window: None,
        }
    }
}

/// Counters describing graph size and eviction activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Transitions currently held.
    pub hops: usize,
    /// Reports currently held across all transitions.
    pub retained_reports: usize,
    /// Transitions evicted by the hop budget or the window.
    pub evicted_hops: u64,
    /// Reports dropped from the front of a full per-hop buffer.
    pub trimmed_reports: u64,
}

// ============================================================================
// GRAPH
// ============================================================================

#[derive(Debug)]
struct HopEntry {
    reports: VecDeque<Report>,
    touched: u64,
    newest: f64,
}

impl HopEntry {
    fn age_key(&self) -> (u64, u64) {
        (ordered_bits(self.newest), self.touched)
    }
}

/// Maps a timestamp to bits whose unsigned order matches `f64::total_cmp`.
fn ordered_bits(timestamp: f64) -> u64 {
    let bits = timestamp.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Observed transitions and the reports that evidenced them.
#[derive(Debug)]
pub struct AdjacencyGraph {
    retention: RetentionPolicy,
    hops: HashMap<ProbeId, HashMap<ProbeId, HopEntry>>,
    /// Touch order; the first entry is the least recently touched hop.
    recency: BTreeMap<u64, (ProbeId, ProbeId)>,
    /// Newest-timestamp order, ties broken by touch; the first entry holds
    /// the oldest evidence.
    by_age: BTreeMap<(u64, u64), (ProbeId, ProbeId)>,
    clock: u64,
    newest_timestamp: Option<f64>,
    stats: GraphStats,
    budget_warned: bool,
}

impl Default for AdjacencyGraph {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl AdjacencyGraph {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            retention,
            hops: HashMap::new(),
            recency: BTreeMap::new(),
            by_age: BTreeMap::new(),
            clock: 0,
            newest_timestamp: None,
            stats: GraphStats::default(),
            budget_warned: false,
        }
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Records `report` under its `(prev_probe, probe)` transition, then
    /// applies the retention policy. The transition just recorded is never
    /// evicted by the same call.
    pub fn record(&mut self, report: Report) {
        let (prev, probe) = report.hop();
        let timestamp = report.timestamp;
        self.clock += 1;
        let tick = self.clock;

        let exists = self
            .hops
            .get(&prev)
            .is_some_and(|next| next.contains_key(&probe));
        if !exists {
            self.make_room();
        }

        let entry = self
            .hops
            .entry(prev)
            .or_default()
            .entry(probe)
            .or_insert_with(|| HopEntry {
                reports: VecDeque::new(),
                touched: tick,
                newest: timestamp,
            });

        if exists {
            self.recency.remove(&entry.touched);
            self.by_age.remove(&entry.age_key());
        } else {
            self.stats.hops += 1;
        }
        entry.touched = tick;
        entry.newest = entry.newest.max(timestamp);
        self.by_age.insert(entry.age_key(), (prev, probe));
        entry.reports.push_back(report);
        self.stats.retained_reports += 1;

        while entry.reports.len() > self.retention.max_reports_per_hop {
            entry.reports.pop_front();
            self.stats.retained_reports -= 1;
            self.stats.trimmed_reports += 1;
        }
        self.recency.insert(tick, (prev, probe));

        let newest = self.newest_timestamp.map_or(timestamp, |t| t.max(timestamp));
        self.newest_timestamp = Some(newest);
        if let Some(window) = self.retention.window {
            self.expire(newest - window, (prev, probe));
        }
    }

    /// True if the transition `prev -> probe` has been observed and is
    /// still retained.
    #[inline]
    pub fn contains(&self, prev: ProbeId, probe: ProbeId) -> bool {
        self.hops
            .get(&prev)
            .is_some_and(|next| next.contains_key(&probe))
    }

    /// Retained reports of one transition, oldest first.
    pub fn reports(&self, prev: ProbeId, probe: ProbeId) -> Option<impl Iterator<Item = &Report>> {
        self.hops
            .get(&prev)
            .and_then(|next| next.get(&probe))
            .map(|entry| entry.reports.iter())
    }

    /// Probes observed directly after `prev`.
    pub fn successors(&self, prev: ProbeId) -> impl Iterator<Item = ProbeId> + '_ {
        self.hops
            .get(&prev)
            .into_iter()
            .flat_map(|next| next.keys().copied())
    }

    /// Number of retained transitions.
    pub fn len(&self) -> usize {
        self.stats.hops
    }

    pub fn is_empty(&self) -> bool {
        self.stats.hops == 0
    }

    pub fn stats(&self) -> GraphStats {
        self.stats
    }

    /// Evicts least recently touched hops until one more fits the budget.
    fn make_room(&mut self) {
        let Some(max_hops) = self.retention.max_hops else {
            return;
        };
        let max_hops = max_hops.max(1);
        if self.stats.hops < max_hops {
            return;
        }

        if !self.budget_warned {
            warn!(
                "Adjacency graph reached its budget of {} hops; evicting least recently seen transitions",
                max_hops
            );
            self.budget_warned = true;
        }

        let mut evicted = 0;
        while self.stats.hops >= max_hops {
            let Some((_, hop)) = self.recency.pop_first() else {
                break;
            };
            self.remove(hop);
            evicted += 1;
        }
        debug!("Hop budget eviction removed {} transitions", evicted);
    }

    /// Evicts every hop whose newest report predates `cutoff`, whatever
    /// order the hops were touched in.
    fn expire(&mut self, cutoff: f64, keep: (ProbeId, ProbeId)) {
        let stale: Vec<(ProbeId, ProbeId)> = self
            .by_age
            .range(..(ordered_bits(cutoff), 0))
            .map(|(_, &hop)| hop)
            .filter(|&hop| hop != keep)
            .collect();
        if stale.is_empty() {
            return;
        }
        for &hop in &stale {
            self.remove(hop);
        }
        debug!(
            "Window eviction removed {} transitions older than {:.3}",
            stale.len(),
            cutoff
        );
    }

    /// Drops a hop along with its recency and age slots.
    fn remove(&mut self, (prev, probe): (ProbeId, ProbeId)) {
        let Some(next) = self.hops.get_mut(&prev) else {
            return;
        };
        if let Some(entry) = next.remove(&probe) {
            self.recency.remove(&entry.touched);
            self.by_age.remove(&entry.age_key());
            self.stats.hops -= 1;
            self.stats.retained_reports -= entry.reports.len();
            self.stats.evicted_hops += 1;
        }
        if next.is_empty() {
            self.hops.remove(&prev);
        }
    }
}
