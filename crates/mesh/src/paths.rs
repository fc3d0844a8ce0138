//! Relay Path Manager: candidate search, scoring and diverse selection.
//!
//! Paths are immutable values recomputed wholesale whenever the topology or
//! the registry changes. The selected paths for every target live in a
//! [`PathTable`] which is swapped atomically, so a send that grabbed the table
//! before a recomputation completes against that table.
//!
//! Scoring weights each factor after normalizing it to `[0, 1]`:
//!
//! | factor | weight | normalization |
//! |---|---|---|
//! | reliability | 0.30 | product of link reliabilities |
//! | security | 0.25 | lowest trust on the path |
//! | latency | 0.20 | best candidate latency / this latency |
//! | bandwidth | 0.15 | bottleneck / best candidate bottleneck |
//! | hops | 0.10 | 1 / hop count |

use crate::error::{MeshError, MeshResult};
use crate::registry::{RelayNode, RelayRegistry};
use crate::topology::{EdgeKey, LinkMetrics, Topology};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use swarmlink_core::{
    event_types, ConfigHandle, EventBuilder, EventBus, EventCategory, EventSeverity, NodeId,
    Timestamp,
};

const WEIGHT_RELIABILITY: f64 = 0.30;
const WEIGHT_SECURITY: f64 = 0.25;
const WEIGHT_LATENCY: f64 = 0.20;
const WEIGHT_BANDWIDTH: f64 = 0.15;
const WEIGHT_HOPS: f64 = 0.10;

/// Bound on subset-search steps per target.
const SELECTION_STEP_BUDGET: usize = 250_000;

/// A scored route from the local node to a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPath {
    /// Nodes after the source, in traversal order; the last is the target
    pub hops: Vec<NodeId>,
    /// Product of link reliabilities
    pub reliability: f64,
    /// Lowest trust score on the path
    pub security_level: f64,
    /// Sum of link round-trip latencies
    pub latency_estimate_ms: u64,
    /// Bottleneck bandwidth in kbit/s
    pub bandwidth_estimate_kbps: u64,
    /// Number of links traversed
    pub hop_count: usize,
    /// Weighted score
    pub score: f64,
}

impl RelayPath {
    /// Target at the end of the path.
    pub fn target(&self) -> Option<&NodeId> {
        self.hops.last()
    }

    /// Relays between the source and the target.
    pub fn intermediates(&self) -> &[NodeId] {
        match self.hops.split_last() {
            Some((_, relays)) => relays,
            None => &[],
        }
    }

    /// Whether `node_id` appears anywhere on the path.
    pub fn contains(&self, node_id: &str) -> bool {
        self.hops.iter().any(|h| h == node_id)
    }

    /// Undirected links traversed, starting from `source`.
    pub fn edges(&self, source: &str) -> Vec<EdgeKey> {
        let mut previous = source;
        let mut edges = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            edges.push(EdgeKey::new(previous, hop));
            previous = hop.as_str();
        }
        edges
    }
}

/// How diverse a selection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiversityLevel {
    /// No two selected paths share an intermediate relay
    NodeDisjoint,
    /// Node-disjointness was not achievable; selected paths share no link
    EdgeDisjoint,
}

/// Selected paths toward one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSelection {
    /// Selected paths, best first
    pub paths: Vec<RelayPath>,
    /// Diversity actually achieved
    pub diversity: DiversityLevel,
    /// How many paths short of the requested N the selection is
    pub shortfall: usize,
}

impl PathSelection {
    /// Whether the selection is below the requested diversity.
    pub fn is_degraded(&self) -> bool {
        self.diversity != DiversityLevel::NodeDisjoint || self.shortfall > 0
    }
}

/// Immutable set of selections for every tracked target.
#[derive(Debug, Clone, Default)]
pub struct PathTable {
    selections: HashMap<NodeId, PathSelection>,
    computed_at: Timestamp,
}

impl PathTable {
    /// Selection for `target`.
    pub fn selection(&self, target: &str) -> Option<&PathSelection> {
        self.selections.get(target)
    }

    /// Best path toward `target`.
    pub fn best_path(&self, target: &str) -> Option<&RelayPath> {
        self.selection(target).and_then(|s| s.paths.first())
    }

    /// Targets with at least one path.
    pub fn reachable_targets(&self) -> Vec<NodeId> {
        let mut targets: Vec<_> = self
            .selections
            .iter()
            .filter(|(_, s)| !s.paths.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        targets.sort();
        targets
    }

    /// Whether any target is reachable.
    pub fn has_any_path(&self) -> bool {
        self.selections.values().any(|s| !s.paths.is_empty())
    }

    /// Every selected path, across targets.
    pub fn all_paths(&self) -> impl Iterator<Item = &RelayPath> {
        self.selections.values().flat_map(|s| s.paths.iter())
    }

    /// When the table was computed.
    pub fn computed_at(&self) -> Timestamp {
        self.computed_at
    }
}

/// Summary of one recomputation.
#[derive(Debug, Clone)]
pub struct RecomputeSummary {
    /// The newly installed table
    pub table: Arc<PathTable>,
    /// Targets with no path at all
    pub unreachable: Vec<NodeId>,
    /// Targets whose selection is below the requested diversity
    pub degraded: Vec<NodeId>,
}

/// Enumerate loop-free candidate paths from `source` to `target`.
///
/// Every node after the source must be in `eligible`. Enumeration stops at
/// `max_hops` links per path and `max_candidates` paths.
pub fn enumerate_candidates(
    topology: &Topology,
    source: &str,
    target: &str,
    eligible: &HashSet<&str>,
    max_hops: usize,
    max_candidates: usize,
) -> Vec<Vec<NodeId>> {
    let mut found = Vec::new();
    if source == target || !eligible.contains(target) || max_candidates == 0 {
        return found;
    }
    let mut visited: HashSet<String> = HashSet::from([source.to_string()]);
    let mut stack: Vec<NodeId> = Vec::new();
    dfs(
        topology,
        source,
        target,
        eligible,
        max_hops,
        max_candidates,
        &mut visited,
        &mut stack,
        &mut found,
    );
    found
}

#[allow(clippy::too_many_arguments)]
fn dfs(
    topology: &Topology,
    at: &str,
    target: &str,
    eligible: &HashSet<&str>,
    max_hops: usize,
    max_candidates: usize,
    visited: &mut HashSet<String>,
    stack: &mut Vec<NodeId>,
    found: &mut Vec<Vec<NodeId>>,
) {
    if stack.len() >= max_hops {
        return;
    }
    let neighbors: Vec<NodeId> = topology.neighbors(at).cloned().collect();
    for next in neighbors {
        if found.len() >= max_candidates {
            return;
        }
        if visited.contains(&next) || !eligible.contains(next.as_str()) {
            continue;
        }
        stack.push(next.clone());
        if next == target {
            found.push(stack.clone());
        } else {
            visited.insert(next.clone());
            dfs(
                topology,
                &next,
                target,
                eligible,
                max_hops,
                max_candidates,
                visited,
                stack,
                found,
            );
            visited.remove(&next);
        }
        stack.pop();
    }
}

/// Attributes of a candidate before cross-candidate normalization.
struct RawPath {
    hops: Vec<NodeId>,
    reliability: f64,
    security_level: f64,
    latency_ms: u64,
    bandwidth_kbps: u64,
}

/// Score candidate hop lists, best first.
pub fn score_candidates(
    source: &str,
    candidates: Vec<Vec<NodeId>>,
    topology: &Topology,
    trust: &HashMap<NodeId, f64>,
) -> Vec<RelayPath> {
    let raw: Vec<RawPath> = candidates
        .into_iter()
        .filter_map(|hops| {
            let mut previous = source;
            let (mut reliability, mut latency, mut bottleneck) = (1.0, 0u64, u64::MAX);
            for hop in &hops {
                let link: &LinkMetrics = topology.link(previous, hop)?;
                reliability *= link.reliability;
                latency = latency.saturating_add(link.latency_ms);
                bottleneck = bottleneck.min(link.bandwidth_kbps);
                previous = hop.as_str();
            }
            let security_level = hops
                .iter()
                .map(|h| trust.get(h).copied().unwrap_or(0.0))
                .fold(1.0, f64::min);
            Some(RawPath {
                hops,
                reliability,
                security_level,
                latency_ms: latency,
                bandwidth_kbps: if bottleneck == u64::MAX { 0 } else { bottleneck },
            })
        })
        .collect();

    let best_latency = raw.iter().map(|r| r.latency_ms).min().unwrap_or(0);
    let best_bandwidth = raw.iter().map(|r| r.bandwidth_kbps).max().unwrap_or(0);

    let mut scored: Vec<RelayPath> = raw
        .into_iter()
        .map(|r| {
            let latency_factor = if r.latency_ms == 0 {
                1.0
            } else {
                best_latency as f64 / r.latency_ms as f64
            };
            let bandwidth_factor = if best_bandwidth == 0 {
                0.0
            } else {
                r.bandwidth_kbps as f64 / best_bandwidth as f64
            };
            let hop_count = r.hops.len();
            let score = WEIGHT_RELIABILITY * r.reliability
                + WEIGHT_SECURITY * r.security_level
                + WEIGHT_LATENCY * latency_factor
                + WEIGHT_BANDWIDTH * bandwidth_factor
                + WEIGHT_HOPS * (1.0 / hop_count.max(1) as f64);
            RelayPath {
                hops: r.hops,
                reliability: r.reliability,
                security_level: r.security_level,
                latency_estimate_ms: r.latency_ms,
                bandwidth_estimate_kbps: r.bandwidth_kbps,
                hop_count,
                score,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.hop_count.cmp(&b.hop_count))
            .then_with(|| a.hops.cmp(&b.hops))
    });
    scored
}

/// Pick up to `n` paths from `scored` (best first) under the diversity constraint.
///
/// Node-disjoint selection is preferred. Only when fewer than `n`
/// node-disjoint paths exist does an edge-disjoint selection replace it, and
/// only if that yields more paths.
pub fn select_diverse(source: &str, scored: &[RelayPath], n: usize) -> PathSelection {
    let wanted = n.min(scored.len());

    let relay_sets: Vec<HashSet<&str>> = scored
        .iter()
        .map(|p| p.intermediates().iter().map(String::as_str).collect())
        .collect();
    let node_disjoint = best_subset(scored, n, |a, b| relay_sets[a].is_disjoint(&relay_sets[b]));

    if node_disjoint.len() >= n {
        return build_selection(scored, node_disjoint, DiversityLevel::NodeDisjoint, n);
    }

    let edge_sets: Vec<HashSet<EdgeKey>> = scored.iter().map(|p| p.edges(source).into_iter().collect()).collect();
    let edge_disjoint = best_subset(scored, n, |a, b| edge_sets[a].is_disjoint(&edge_sets[b]));

    if edge_disjoint.len() > node_disjoint.len() {
        tracing::debug!(
            node_disjoint = node_disjoint.len(),
            edge_disjoint = edge_disjoint.len(),
            wanted,
            "Falling back to edge-disjoint path selection"
        );
        build_selection(scored, edge_disjoint, DiversityLevel::EdgeDisjoint, n)
    } else {
        build_selection(scored, node_disjoint, DiversityLevel::NodeDisjoint, n)
    }
}

fn build_selection(scored: &[RelayPath], picked: Vec<usize>, diversity: DiversityLevel, n: usize) -> PathSelection {
    let paths: Vec<RelayPath> = picked.into_iter().map(|i| scored[i].clone()).collect();
    PathSelection {
        shortfall: n.saturating_sub(paths.len()),
        paths,
        diversity,
    }
}

/// Largest pairwise-compatible subset of at most `n` candidates, ties broken by total score.
///
/// Branch and bound over candidates ordered best first.
fn best_subset<F>(scored: &[RelayPath], n: usize, compatible: F) -> Vec<usize>
where
    F: Fn(usize, usize) -> bool,
{
    struct Search<'a, F> {
        scored: &'a [RelayPath],
        n: usize,
        compatible: F,
        best: Vec<usize>,
        best_score: f64,
        steps: usize,
    }

    impl<F: Fn(usize, usize) -> bool> Search<'_, F> {
        fn run(&mut self, from: usize, chosen: &mut Vec<usize>, score: f64) {
            self.steps += 1;
            if self.steps > SELECTION_STEP_BUDGET {
                return;
            }
            if chosen.len() > self.best.len()
                || (chosen.len() == self.best.len() && score > self.best_score)
            {
                self.best = chosen.clone();
                self.best_score = score;
            }
            if chosen.len() == self.n {
                return;
            }

            let remaining = self.scored.len() - from;
            let bound_len = self.n.min(chosen.len() + remaining);
            let slots = bound_len - chosen.len();
            let bound_score = score
                + self.scored[from..]
                    .iter()
                    .take(slots)
                    .map(|p| p.score)
                    .sum::<f64>();
            if bound_len < self.best.len()
                || (bound_len == self.best.len() && bound_score <= self.best_score)
            {
                return;
            }

            for idx in from..self.scored.len() {
                if chosen.iter().all(|&c| (self.compatible)(c, idx)) {
                    chosen.push(idx);
                    self.run(idx + 1, chosen, score + self.scored[idx].score);
                    chosen.pop();
                }
            }
        }
    }

    if n == 0 || scored.is_empty() {
        return Vec::new();
    }
    let mut search = Search {
        scored,
        n,
        compatible,
        best: Vec::new(),
        best_score: f64::NEG_INFINITY,
        steps: 0,
    };
    search.run(0, &mut Vec::new(), 0.0);
    search.best
}

/// Owns the topology, the tracked targets and the current path table.
pub struct PathManager {
    local_id: NodeId,
    registry: Arc<RelayRegistry>,
    topology: RwLock<Topology>,
    targets: RwLock<BTreeSet<NodeId>>,
    table: RwLock<Arc<PathTable>>,
    config: ConfigHandle,
    events: EventBus,
}

impl PathManager {
    /// Create a manager for the local node.
    pub fn new(
        local_id: impl Into<NodeId>,
        registry: Arc<RelayRegistry>,
        config: ConfigHandle,
        events: EventBus,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            registry,
            topology: RwLock::new(Topology::new()),
            targets: RwLock::new(BTreeSet::new()),
            table: RwLock::new(Arc::new(PathTable::default())),
            config,
            events,
        }
    }

    /// Local node identifier (path source).
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    /// Record a link observation.
    pub fn observe_link(&self, a: &str, b: &str, metrics: LinkMetrics) {
        let now = metrics.last_observed;
        self.topology
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .observe_link(a, b, metrics);
        for node in [a, b] {
            self.registry.touch(node, now);
        }
    }

    /// Remove a link.
    pub fn remove_link(&self, a: &str, b: &str) -> bool {
        self.topology
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_link(a, b)
    }

    /// Drop links older than `max_age_ms`.
    pub fn prune_stale_links(&self, now: Timestamp, max_age_ms: u64) -> usize {
        self.topology
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_stale(now, max_age_ms)
    }

    /// Keep paths toward `target` in addition to registry egress nodes.
    pub fn track_target(&self, target: impl Into<NodeId>) {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.into());
    }

    /// Targets paths are computed for: tracked destinations plus eligible egress nodes.
    pub fn targets(&self) -> Vec<NodeId> {
        let floor = self.config.snapshot().trust_floor;
        let mut targets: BTreeSet<NodeId> = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        targets.extend(
            self.registry
                .eligible(floor)
                .into_iter()
                .filter(|n| n.capability_flags.is_egress())
                .map(|n| n.node_id),
        );
        targets.remove(&self.local_id);
        targets.into_iter().collect()
    }

    /// Current path table. Holders keep a consistent view across recomputations.
    pub fn current(&self) -> Arc<PathTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Best path toward `target` in the current table.
    pub fn best_path(&self, target: &str) -> MeshResult<RelayPath> {
        self.current()
            .best_path(target)
            .cloned()
            .ok_or_else(|| MeshError::NoPathAvailable {
                target: target.to_string(),
            })
    }

    /// Recompute every target's selection and install the new table.
    pub fn recompute(&self, now: Timestamp) -> RecomputeSummary {
        let config = self.config.snapshot();
        let eligible_nodes: Vec<RelayNode> = self.registry.eligible(config.trust_floor);
        let trust: HashMap<NodeId, f64> = eligible_nodes
            .iter()
            .map(|n| (n.node_id.clone(), n.trust_score))
            .collect();
        let eligible: HashSet<&str> = trust.keys().map(String::as_str).collect();
        let topology = self
            .topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut selections = HashMap::new();
        let (mut unreachable, mut degraded) = (Vec::new(), Vec::new());

        for target in self.targets() {
            let candidates = enumerate_candidates(
                &topology,
                &self.local_id,
                &target,
                &eligible,
                config.max_hops,
                config.max_candidates,
            );
            let scored = score_candidates(&self.local_id, candidates, &topology, &trust);
            let selection = select_diverse(&self.local_id, &scored, config.path_diversity_n);

            if selection.paths.is_empty() {
                unreachable.push(target.clone());
            } else if selection.is_degraded() {
                degraded.push(target.clone());
            }
            selections.insert(target, selection);
        }

        let table = Arc::new(PathTable {
            selections,
            computed_at: now,
        });
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&table);

        self.publish_summary(&table, &unreachable, &degraded, now);
        RecomputeSummary {
            table,
            unreachable,
            degraded,
        }
    }

    fn publish_summary(&self, table: &PathTable, unreachable: &[NodeId], degraded: &[NodeId], now: Timestamp) {
        tracing::debug!(
            targets = table.selections.len(),
            unreachable = unreachable.len(),
            degraded = degraded.len(),
            "Relay paths recomputed"
        );
        self.events.publish(
            EventBuilder::new(event_types::PATHS_RECOMPUTED, "path-manager")
                .category(EventCategory::Routing)
                .at(now)
                .message(format!(
                    "{} targets reachable",
                    table.reachable_targets().len()
                ))
                .metadata("unreachable", unreachable.len())
                .build(),
        );
        for target in degraded {
            let diversity = table
                .selection(target)
                .map(|s| format!("{:?}", s.diversity))
                .unwrap_or_default();
            self.events.publish(
                EventBuilder::new(event_types::DIVERSITY_DEGRADED, "path-manager")
                    .severity(EventSeverity::Warning)
                    .category(EventCategory::Routing)
                    .subject(target.clone())
                    .at(now)
                    .message(format!("Path diversity degraded toward {target}"))
                    .metadata("diversity", diversity)
                    .build(),
            );
        }
        for target in unreachable {
            self.events.publish(
                EventBuilder::new(event_types::NO_PATH_AVAILABLE, "path-manager")
                    .severity(EventSeverity::Warning)
                    .category(EventCategory::Routing)
                    .subject(target.clone())
                    .at(now)
                    .message(format!("No path available to {target}"))
                    .build(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CapabilityFlags, ProofOutcome};
    use proptest::prelude::*;
    use swarmlink_crypto::NodeIdentity;

    fn link(latency_ms: u64) -> LinkMetrics {
        LinkMetrics::new(0.95, latency_ms, 1_000, 1_000)
    }

    fn manager(nodes: &[&str], egress: &[&str]) -> PathManager {
        let registry = Arc::new(RelayRegistry::new());
        for id in nodes {
            let flags = if egress.contains(id) {
                CapabilityFlags::RELAY.with(CapabilityFlags::EGRESS_CELLULAR)
            } else {
                CapabilityFlags::RELAY
            };
            registry.upsert(NodeIdentity::generate(*id).public(), flags, 1_000);
        }
        PathManager::new("S", registry, ConfigHandle::default(), EventBus::default())
    }

    /// S connects to E through three independent relays and one shared hub.
    fn diamond() -> PathManager {
        let pm = manager(&["R1", "R2", "R3", "H", "E"], &["E"]);
        for relay in ["R1", "R2", "R3"] {
            pm.observe_link("S", relay, link(10));
            pm.observe_link(relay, "E", link(10));
        }
        pm.observe_link("R1", "H", link(5));
        pm.observe_link("H", "E", link(5));
        pm
    }

    #[test]
    fn test_three_node_line() {
        let pm = manager(&["B", "C"], &[]);
        pm.observe_link("S", "B", link(20));
        pm.observe_link("B", "C", link(20));
        pm.track_target("C");

        let summary = pm.recompute(2_000);
        assert!(summary.unreachable.is_empty());
        let best = pm.best_path("C").unwrap();
        assert_eq!(best.hops, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(best.intermediates(), ["B".to_string()]);
        assert_eq!(best.latency_estimate_ms, 40);
        assert_eq!(best.hop_count, 2);
    }

    #[test]
    fn test_selected_paths_are_node_disjoint() {
        let pm = diamond();
        pm.recompute(2_000);
        let table = pm.current();
        let selection = table.selection("E").unwrap();

        assert_eq!(selection.paths.len(), 3);
        assert_eq!(selection.diversity, DiversityLevel::NodeDisjoint);
        assert!(!selection.is_degraded());
        let mut seen = HashSet::new();
        for path in &selection.paths {
            for relay in path.intermediates() {
                assert!(seen.insert(relay.clone()), "relay {relay} reused");
            }
        }
    }

    #[test]
    fn test_edge_disjoint_fallback_is_reported() {
        // Every route to E passes through X, so only one node-disjoint path exists.
        let pm = manager(&["A", "B", "X", "C", "D", "E"], &["E"]);
        pm.observe_link("S", "A", link(10));
        pm.observe_link("S", "B", link(10));
        pm.observe_link("A", "X", link(10));
        pm.observe_link("B", "X", link(10));
        pm.observe_link("X", "C", link(10));
        pm.observe_link("X", "D", link(10));
        pm.observe_link("C", "E", link(10));
        pm.observe_link("D", "E", link(10));

        let summary = pm.recompute(2_000);
        assert_eq!(summary.degraded, vec!["E".to_string()]);
        let table = pm.current();
        let selection = table.selection("E").unwrap();
        assert_eq!(selection.diversity, DiversityLevel::EdgeDisjoint);
        assert_eq!(selection.paths.len(), 2);
        assert_eq!(selection.shortfall, 1);
    }

    #[test]
    fn test_no_path_available() {
        let pm = manager(&["B", "C"], &[]);
        pm.observe_link("S", "B", link(20));
        pm.track_target("C");

        let summary = pm.recompute(2_000);
        assert_eq!(summary.unreachable, vec!["C".to_string()]);
        assert!(matches!(
            pm.best_path("C"),
            Err(MeshError::NoPathAvailable { .. })
        ));
        assert!(!pm.current().has_any_path());
    }

    #[test]
    fn test_compromised_node_excluded_after_recompute() {
        let pm = diamond();
        pm.recompute(2_000);
        let before = pm.current();
        assert!(before.all_paths().any(|p| p.contains("R2")));

        pm.registry()
            .apply_proof("R2", ProofOutcome::Compromised, 0.05, 0.3, 3_000);
        pm.recompute(3_000);

        assert!(!pm.current().all_paths().any(|p| p.contains("R2")));
        // The table handed out earlier is unchanged.
        assert!(before.all_paths().any(|p| p.contains("R2")));
    }

    #[test]
    fn test_scoring_prefers_trust_and_latency() {
        let pm = manager(&["Fast", "Slow", "E"], &["E"]);
        pm.observe_link("S", "Fast", link(10));
        pm.observe_link("Fast", "E", link(10));
        pm.observe_link("S", "Slow", link(100));
        pm.observe_link("Slow", "E", link(100));
        pm.recompute(2_000);
        assert_eq!(pm.best_path("E").unwrap().hops[0], "Fast");

        for _ in 0..10 {
            pm.registry()
                .apply_proof("Slow", ProofOutcome::Verified, 0.05, 0.3, 2_500);
        }
        pm.registry()
            .apply_threat("Fast", swarmlink_core::Severity::Medium, 0.3, 2_500);
        pm.recompute(3_000);
        let best = pm.best_path("E").unwrap();
        assert!(best.score <= 1.0 && best.score > 0.0);
    }

    #[test]
    fn test_max_hops_bounds_candidates() {
        let pm = manager(&["A", "B", "C", "D"], &["D"]);
        pm.observe_link("S", "A", link(1));
        pm.observe_link("A", "B", link(1));
        pm.observe_link("B", "C", link(1));
        pm.observe_link("C", "D", link(1));
        pm.config.update(|c| c.max_hops = 3).unwrap();
        assert!(!pm.recompute(2_000).unreachable.is_empty());

        pm.config.update(|c| c.max_hops = 4).unwrap();
        assert!(pm.recompute(2_000).unreachable.is_empty());
    }

    fn random_topology() -> impl Strategy<Value = (Vec<(usize, usize)>, Vec<usize>)> {
        (
            prop::collection::vec((0usize..8, 0usize..8), 4..28),
            prop::collection::vec(0usize..8, 0..3),
        )
    }

    proptest! {
        #[test]
        fn prop_selection_is_disjoint_and_excludes_compromised((edges, compromised) in random_topology()) {
            let names: Vec<String> = (0..8).map(|i| format!("N{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let pm = manager(&refs, &["N7"]);
            for (a, b) in &edges {
                let from = if *a == 0 { "S" } else { refs[*a] };
                pm.observe_link(from, refs[*b], link(10 + (*a as u64) * 3));
            }
            for idx in &compromised {
                pm.registry().apply_proof(refs[*idx], ProofOutcome::Compromised, 0.05, 0.3, 1_500);
            }
            pm.recompute(2_000);

            let table = pm.current();
            if let Some(selection) = table.selection("N7") {
                for path in &selection.paths {
                    for idx in &compromised {
                        prop_assert!(!path.contains(refs[*idx]));
                    }
                }
                for (i, a) in selection.paths.iter().enumerate() {
                    for b in selection.paths.iter().skip(i + 1) {
                        match selection.diversity {
                            DiversityLevel::NodeDisjoint => {
                                let ra: HashSet<_> = a.intermediates().iter().collect();
                                prop_assert!(b.intermediates().iter().all(|r| !ra.contains(r)));
                            }
                            DiversityLevel::EdgeDisjoint => {
                                let ea: HashSet<_> = a.edges("S").into_iter().collect();
                                prop_assert!(b.edges("S").iter().all(|e| !ea.contains(e)));
                            }
                        }
                    }
                }
            }
        }
    }
}
