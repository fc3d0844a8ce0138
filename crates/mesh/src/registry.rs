//! Relay node registry with trust scoring and soft-quarantine.
//!
//! Trust moves only through two entry points: threat verdicts
//! ([`RelayRegistry::apply_threat`]) and proof-of-relay outcomes
//! ([`RelayRegistry::apply_proof`]). A node whose trust falls below the
//! configured floor stays in the registry for audit but is no longer eligible
//! for path computation, until [`RelayRegistry::purge_expired`] removes it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use swarmlink_core::{clamp_unit, NodeId, Severity, Timestamp};
use swarmlink_crypto::PublicIdentity;

/// Trust assigned to a node on first registration.
pub const INITIAL_TRUST: f64 = 0.5;

/// What a relay can do for the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    /// Forwards relay traffic
    pub const RELAY: Self = Self(0b0001);
    /// Has cellular reach (egress for TACTICAL/HYBRID traffic)
    pub const EGRESS_CELLULAR: Self = Self(0b0010);
    /// Has a satellite uplink
    pub const EGRESS_SATELLITE: Self = Self(0b0100);

    /// No capabilities.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Union of two flag sets.
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the node can act as an egress.
    pub const fn is_egress(self) -> bool {
        self.0 & (Self::EGRESS_CELLULAR.0 | Self::EGRESS_SATELLITE.0) != 0
    }

    /// Raw bits, for persistence.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// A relay known to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNode {
    /// Node identifier
    pub node_id: NodeId,
    /// Public keys (relay + attestation)
    pub identity: PublicIdentity,
    /// Trust score (0.0 to 1.0)
    pub trust_score: f64,
    /// Last time the node was observed (Unix epoch milliseconds)
    pub last_seen: Timestamp,
    /// Advertised capabilities
    pub capability_flags: CapabilityFlags,
    /// When trust first fell below the floor, if it has
    pub quarantined_at: Option<Timestamp>,
}

impl RelayNode {
    /// Whether the node may appear in computed paths.
    pub fn is_eligible(&self, trust_floor: f64) -> bool {
        self.quarantined_at.is_none() && self.trust_score >= trust_floor
    }
}

/// A trust change, returned so callers can persist and publish it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustChange {
    /// Node whose trust changed
    pub node_id: NodeId,
    /// Score before the change
    pub previous: f64,
    /// Score after the change
    pub current: f64,
    /// Whether this change moved the node into quarantine
    pub quarantined: bool,
    /// Time of the change
    pub timestamp: Timestamp,
}

/// Outcome of a proof-of-relay round for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofOutcome {
    /// The node attested correct forwarding
    Verified,
    /// The node was blamed for a failed probe
    Compromised,
}

/// Trust reduction applied for a threat verdict of each severity.
pub fn severity_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.05,
        Severity::Medium => 0.15,
        Severity::High => 0.4,
        Severity::Critical => 1.0,
    }
}

/// Thread-safe relay registry.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    nodes: RwLock<HashMap<NodeId, RelayNode>>,
}

impl RelayRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node or refresh its keys, capabilities and last-seen time.
    ///
    /// Trust of an already known node is preserved.
    pub fn upsert(&self, identity: PublicIdentity, capability_flags: CapabilityFlags, now: Timestamp) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(&identity.node_id) {
            Some(node) => {
                node.identity = identity;
                node.capability_flags = capability_flags;
                node.last_seen = node.last_seen.max(now);
            }
            None => {
                tracing::debug!(node_id = %identity.node_id, "Relay registered");
                nodes.insert(
                    identity.node_id.clone(),
                    RelayNode {
                        node_id: identity.node_id.clone(),
                        identity,
                        trust_score: INITIAL_TRUST,
                        last_seen: now,
                        capability_flags,
                        quarantined_at: None,
                    },
                );
            }
        }
    }

    /// Restore a persisted trust score for a registered node.
    pub fn restore_trust(&self, node_id: &str, trust_score: f64, trust_floor: f64, now: Timestamp) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = nodes.get_mut(node_id) {
            node.trust_score = clamp_unit(trust_score);
            if node.trust_score < trust_floor && node.quarantined_at.is_none() {
                node.quarantined_at = Some(now);
            }
        }
    }

    /// Mark a node as seen.
    pub fn touch(&self, node_id: &str, now: Timestamp) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = nodes.get_mut(node_id) {
            node.last_seen = node.last_seen.max(now);
        }
    }

    /// Copy of one node.
    pub fn get(&self, node_id: &str) -> Option<RelayNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    /// Trust score of a node, if known.
    pub fn trust(&self, node_id: &str) -> Option<f64> {
        self.get(node_id).map(|n| n.trust_score)
    }

    /// Whether a node is registered and eligible for paths.
    pub fn is_eligible(&self, node_id: &str, trust_floor: f64) -> bool {
        self.get(node_id).is_some_and(|n| n.is_eligible(trust_floor))
    }

    /// Copy of every eligible node.
    pub fn eligible(&self, trust_floor: f64) -> Vec<RelayNode> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|n| n.is_eligible(trust_floor))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Copy of every node, quarantined ones included.
    pub fn all(&self) -> Vec<RelayNode> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Apply a threat verdict against a node.
    pub fn apply_threat(
        &self,
        node_id: &str,
        severity: Severity,
        trust_floor: f64,
        now: Timestamp,
    ) -> Option<TrustChange> {
        self.adjust(node_id, -severity_penalty(severity), trust_floor, now)
    }

    /// Apply a proof-of-relay outcome: reward on success, force toward zero on blame.
    pub fn apply_proof(
        &self,
        node_id: &str,
        outcome: ProofOutcome,
        reward: f64,
        trust_floor: f64,
        now: Timestamp,
    ) -> Option<TrustChange> {
        match outcome {
            ProofOutcome::Verified => self.adjust(node_id, reward, trust_floor, now),
            ProofOutcome::Compromised => self.adjust(node_id, -1.0, trust_floor, now),
        }
    }

    fn adjust(
        &self,
        node_id: &str,
        delta: f64,
        trust_floor: f64,
        now: Timestamp,
    ) -> Option<TrustChange> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let node = nodes.get_mut(node_id)?;

        let previous = node.trust_score;
        node.trust_score = clamp_unit(previous + delta);

        let quarantined = node.quarantined_at.is_none() && node.trust_score < trust_floor;
        if quarantined {
            node.quarantined_at = Some(now);
            tracing::warn!(
                node_id = %node_id,
                trust = node.trust_score,
                "Relay soft-quarantined"
            );
        }

        Some(TrustChange {
            node_id: node_id.to_string(),
            previous,
            current: node.trust_score,
            quarantined,
            timestamp: now,
        })
    }

    /// Remove quarantined nodes whose retention period has passed.
    pub fn purge_expired(&self, now: Timestamp, expiry_s: u64) -> Vec<NodeId> {
        let expiry_ms = expiry_s.saturating_mul(1_000);
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<NodeId> = nodes
            .values()
            .filter(|n| {
                n.quarantined_at
                    .is_some_and(|at| now.saturating_sub(at) >= expiry_ms)
            })
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in &expired {
            nodes.remove(node_id);
            tracing::info!(node_id = %node_id, "Quarantined relay expired from registry");
        }
        expired
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
