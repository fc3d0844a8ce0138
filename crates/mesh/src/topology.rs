//! Link topology between swarm nodes.
//!
//! Undirected graph whose edges are the current (or most recent) link
//! observations between two nodes. Path computation works on a cloned
//! snapshot, so updates never disturb a search in progress.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use swarmlink_core::{clamp_unit, NodeId, Timestamp};

/// Measured quality of one link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMetrics {
    /// Delivery probability (1 - packet error rate)
    pub reliability: f64,
    /// Round-trip latency in milliseconds
    pub latency_ms: u64,
    /// Usable bandwidth in kbit/s
    pub bandwidth_kbps: u64,
    /// When the link was last observed
    pub last_observed: Timestamp,
}

impl LinkMetrics {
    /// Create link metrics, clamping reliability into `[0, 1]`.
    pub fn new(reliability: f64, latency_ms: u64, bandwidth_kbps: u64, last_observed: Timestamp) -> Self {
        Self {
            reliability: clamp_unit(reliability),
            latency_ms,
            bandwidth_kbps,
            last_observed,
        }
    }
}

/// Undirected edge key with endpoints in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey(NodeId, NodeId);

impl EdgeKey {
    /// Key for the link between `a` and `b`, independent of direction.
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }
}

/// Link graph.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    edges: BTreeMap<EdgeKey, LinkMetrics>,
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the link between `a` and `b`.
    pub fn observe_link(&mut self, a: &str, b: &str, metrics: LinkMetrics) {
        if a == b {
            return;
        }
        self.edges.insert(EdgeKey::new(a, b), metrics);
        self.adjacency.entry(a.to_string()).or_default().insert(b.to_string());
        self.adjacency.entry(b.to_string()).or_default().insert(a.to_string());
    }

    /// Remove the link between `a` and `b`.
    pub fn remove_link(&mut self, a: &str, b: &str) -> bool {
        let removed = self.edges.remove(&EdgeKey::new(a, b)).is_some();
        if removed {
            if let Some(n) = self.adjacency.get_mut(a) {
                n.remove(b);
            }
            if let Some(n) = self.adjacency.get_mut(b) {
                n.remove(a);
            }
        }
        removed
    }

    /// Metrics of the link between `a` and `b`.
    pub fn link(&self, a: &str, b: &str) -> Option<&LinkMetrics> {
        self.edges.get(&EdgeKey::new(a, b))
    }

    /// Neighbours of `node`, in sorted order.
    pub fn neighbors(&self, node: &str) -> impl Iterator<Item = &NodeId> {
        self.adjacency.get(node).into_iter().flatten()
    }

    /// Drop links not observed within `max_age_ms`.
    pub fn prune_stale(&mut self, now: Timestamp, max_age_ms: u64) -> usize {
        let stale: Vec<EdgeKey> = self
            .edges
            .iter()
            .filter(|(_, m)| now.saturating_sub(m.last_observed) > max_age_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            let EdgeKey(a, b) = key;
            self.remove_link(a, b);
        }
        stale.len()
    }

    /// Number of links.
    pub fn link_count(&self) -> usize {
        self.edges.len()
    }
}
