//! Proof-of-relay protocol driver.
//!
//! Sends a challenge probe down a selected path, collects signed hop receipts
//! for at most 1.5× the path's expected round trip, and turns the result into
//! a trust verdict. A blamed relay is forced to zero trust (which
//! soft-quarantines it) and every path is recomputed without it.
//!
//! Blame assignment, by first failing hop `k` along the path:
//!
//! - no receipt in time, or a receipt that does not verify: `k`
//! - `k` received something other than what `k-1` should have sent: the
//!   lower-trust node of `k-1` and `k`, the forwarder on a tie (`k` when
//!   `k` is the first hop, since the source is trusted)
//! - `k` rejected the correct packet, or forwarded the wrong one: `k`
//!
//! A round trip longer than the bound therefore blames the first hop whose
//! receipt had not arrived by then. Receipts that straggle in during a
//! second window of the same length do not change the verdict; they only
//! time the round trip reported back for latency monitoring.

use crate::error::{MeshError, MeshResult};
use crate::paths::{PathManager, RelayPath};
use crate::registry::{ProofOutcome, RelayRegistry, TrustChange};
use crate::store::LinkStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use swarmlink_core::{
    event_types, Clock, ConfigHandle, EventBuilder, EventBus, EventCategory, EventSeverity, NodeId,
};
use swarmlink_crypto::{
    HopReceipt, ProbeAction, ProbeExpectation, ProbeFrame, ProofFinding, PublicIdentity,
    RelayResponder,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Factor applied to a path's expected latency to bound a probe round trip.
pub const PROBE_TIMEOUT_FACTOR: f64 = 1.5;

/// Carries probes into the swarm and receipts back.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Hand `frame` to `first_hop`. Receipts from any hop are pushed to `receipts`
    /// as they arrive; the call itself must not wait for them.
    async fn launch(
        &self,
        first_hop: &str,
        frame: ProbeFrame,
        receipts: mpsc::Sender<HopReceipt>,
    ) -> MeshResult<()>;
}

/// Verdict on one probed path.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeVerdict {
    /// Every hop attested correct forwarding in time
    Verified,
    /// The named relay was blamed and excluded
    Compromised {
        /// Blamed relay
        node_id: NodeId,
        /// What went wrong
        finding: ProofFinding,
    },
}

/// Result of probing one path.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Probed path (hops after the source)
    pub path: Vec<NodeId>,
    /// Outcome
    pub verdict: ProbeVerdict,
    /// Receipts collected before the deadline
    pub receipts: usize,
    /// Time spent waiting for receipts
    pub elapsed_ms: u64,
    /// Round-trip bound applied
    pub deadline_ms: u64,
    /// Time until the last receipt arrived, late ones included. When some
    /// never arrive this is the end of the straggler window, twice the bound.
    pub round_trip_ms: u64,
}

/// Round-trip bound for a path.
pub fn probe_deadline(path: &RelayPath) -> Duration {
    let ms = (path.latency_estimate_ms as f64 * PROBE_TIMEOUT_FACTOR).ceil().max(1.0);
    Duration::from_millis(ms as u64)
}

/// Wait up to `window` for the rest of a probe's receipts. Returns whether
/// every hop has answered.
async fn collect_receipts(
    rx: &mut mpsc::Receiver<HopReceipt>,
    expectation: &ProbeExpectation,
    receipts: &mut Vec<HopReceipt>,
    window: Duration,
) -> bool {
    let wanted = expectation.hop_count();
    let _ = tokio::time::timeout(window, async {
        while receipts.len() < wanted {
            match rx.recv().await {
                Some(receipt) if receipt.probe_id == expectation.probe_id() => receipts.push(receipt),
                Some(_) => continue,
                None => break,
            }
        }
    })
    .await;
    receipts.len() >= wanted
}

/// Choose the node to blame for a failed finding.
pub fn assign_blame(
    finding: &ProofFinding,
    path: &[NodeId],
    registry: &RelayRegistry,
) -> Option<NodeId> {
    let at = |idx: usize| path.get(idx).cloned();
    match *finding {
        ProofFinding::AllAttested => None,
        ProofFinding::MissingReceipt { hop }
        | ProofFinding::InvalidSignature { hop }
        | ProofFinding::Rejected { hop }
        | ProofFinding::ForwardedMismatch { hop } => at(hop),
        ProofFinding::ReceivedMismatch { hop } => {
            if hop == 0 {
                return at(0);
            }
            let upstream = at(hop - 1)?;
            let downstream = at(hop)?;
            let trust = |id: &str| registry.trust(id).unwrap_or(0.0);
            if trust(&downstream) < trust(&upstream) {
                Some(downstream)
            } else {
                Some(upstream)
            }
        }
    }
}

/// Runs probes and applies their verdicts.
pub struct ProofOfRelay {
    paths: Arc<PathManager>,
    transport: Arc<dyn ProbeTransport>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    events: EventBus,
    store: Option<Arc<LinkStore>>,
}

impl ProofOfRelay {
    /// Create a driver.
    pub fn new(
        paths: Arc<PathManager>,
        transport: Arc<dyn ProbeTransport>,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            paths,
            transport,
            config,
            clock,
            events,
            store: None,
        }
    }

    /// Persist trust changes to `store`.
    pub fn with_store(mut self, store: Arc<LinkStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Probe one path and apply the verdict.
    pub async fn probe_path(&self, path: &RelayPath) -> MeshResult<ProbeReport> {
        let registry = self.paths.registry();
        let identities: Vec<PublicIdentity> = path
            .hops
            .iter()
            .map(|id| {
                registry
                    .get(id)
                    .map(|n| n.identity)
                    .ok_or_else(|| MeshError::UnknownNode { node_id: id.clone() })
            })
            .collect::<MeshResult<_>>()?;
        let first_hop = path
            .hops
            .first()
            .ok_or_else(|| MeshError::InvalidState("cannot probe an empty path".to_string()))?;

        let (frame, expectation) = ProbeExpectation::build(&identities)?;
        let deadline = probe_deadline(path);
        let (tx, mut rx) = mpsc::channel(expectation.hop_count().max(1) * 2);

        let started = Instant::now();
        self.transport.launch(first_hop, frame, tx).await?;

        let mut receipts = Vec::with_capacity(expectation.hop_count());
        let complete = collect_receipts(&mut rx, &expectation, &mut receipts, deadline).await;
        let elapsed = started.elapsed();
        let on_time = receipts.len();

        let finding = expectation.evaluate(&receipts);
        let verdict = match assign_blame(&finding, &path.hops, registry) {
            None => {
                self.reward(&path.hops);
                ProbeVerdict::Verified
            }
            Some(node_id) => {
                self.mark_compromised(&node_id, &finding);
                ProbeVerdict::Compromised { node_id, finding }
            }
        };

        let round_trip = if complete {
            elapsed
        } else {
            collect_receipts(&mut rx, &expectation, &mut receipts, deadline).await;
            started.elapsed()
        };

        Ok(ProbeReport {
            path: path.hops.clone(),
            verdict,
            receipts: on_time,
            elapsed_ms: elapsed.as_millis() as u64,
            deadline_ms: deadline.as_millis() as u64,
            round_trip_ms: round_trip.as_millis() as u64,
        })
    }

    /// Probe every selected path toward `target` (on demand, e.g. after a timing anomaly).
    pub async fn probe_target(&self, target: &str) -> Vec<ProbeReport> {
        let table = self.paths.current();
        let paths: Vec<RelayPath> = table
            .selection(target)
            .map(|s| s.paths.clone())
            .unwrap_or_default();
        self.probe_all(paths).await
    }

    /// Probe every path in the current table (periodic sweep).
    pub async fn sweep(&self) -> Vec<ProbeReport> {
        let paths: Vec<RelayPath> = self.paths.current().all_paths().cloned().collect();
        self.probe_all(paths).await
    }

    async fn probe_all(&self, paths: Vec<RelayPath>) -> Vec<ProbeReport> {
        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            // A node blamed earlier in this sweep is already excluded.
            let floor = self.config.snapshot().trust_floor;
            let registry = self.paths.registry();
            if path.hops.iter().any(|h| !registry.is_eligible(h, floor)) {
                continue;
            }
            match self.probe_path(&path).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(error = %e, path = ?path.hops, "Probe could not be sent"),
            }
        }
        reports
    }

    fn reward(&self, hops: &[NodeId]) {
        let config = self.config.snapshot();
        let now = self.clock.now_ms();
        for node_id in hops {
            if let Some(change) = self.paths.registry().apply_proof(
                node_id,
                ProofOutcome::Verified,
                config.trust_reward,
                config.trust_floor,
                now,
            ) {
                self.persist(&change);
            }
        }
        self.events.publish(
            EventBuilder::new(event_types::RELAY_VERIFIED, "proof-of-relay")
                .category(EventCategory::Trust)
                .at(now)
                .message(format!("Path {} verified", hops.join(" -> ")))
                .build(),
        );
    }

    fn mark_compromised(&self, node_id: &str, finding: &ProofFinding) {
        let config = self.config.snapshot();
        let now = self.clock.now_ms();
        let change = self.paths.registry().apply_proof(
            node_id,
            ProofOutcome::Compromised,
            config.trust_reward,
            config.trust_floor,
            now,
        );
        if let Some(change) = &change {
            self.persist(change);
        }

        tracing::warn!(node_id = %node_id, finding = ?finding, "Relay failed proof-of-relay");
        self.events.publish(
            EventBuilder::new(event_types::RELAY_COMPROMISED, "proof-of-relay")
                .severity(EventSeverity::Critical)
                .category(EventCategory::Trust)
                .subject(node_id)
                .at(now)
                .message(format!("Relay {node_id} compromised: {finding:?}"))
                .metadata("trust", change.map(|c| c.current).unwrap_or(0.0))
                .build(),
        );
        self.paths.recompute(now);
    }

    fn persist(&self, change: &TrustChange) {
        if let Some(store) = &self.store {
            if let Err(e) = store.record_trust(change) {
                tracing::warn!(error = %e, node_id = %change.node_id, "Failed to persist trust change");
            }
        }
    }
}

/// How a simulated relay treats probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayBehavior {
    /// Peel, attest and forward immediately
    Honest,
    /// Swallow the probe without a receipt
    Drop,
    /// Hold the probe before attesting and forwarding
    Delay(Duration),
    /// Attest honestly but corrupt the forwarded packet
    Tamper,
}

/// In-process relay network for simulations and tests.
///
/// Each registered node answers probes with its own [`RelayResponder`]; hops
/// are walked on a spawned task so `launch` returns immediately.
#[derive(Default)]
pub struct LoopbackRelayNetwork {
    nodes: RwLock<HashMap<NodeId, (RelayResponder, RelayBehavior)>>,
}

impl LoopbackRelayNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relay.
    pub fn add_relay(&self, responder: RelayResponder, behavior: RelayBehavior) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(responder.node_id().to_string(), (responder, behavior));
    }

    /// Change how a relay behaves.
    pub fn set_behavior(&self, node_id: &str, behavior: RelayBehavior) {
        if let Some(entry) = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(node_id)
        {
            entry.1 = behavior;
        }
    }

    fn lookup(&self, node_id: &str) -> Option<(RelayResponder, RelayBehavior)> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }
}

#[async_trait]
impl ProbeTransport for Arc<LoopbackRelayNetwork> {
    async fn launch(
        &self,
        first_hop: &str,
        frame: ProbeFrame,
        receipts: mpsc::Sender<HopReceipt>,
    ) -> MeshResult<()> {
        let network = Arc::clone(self);
        let mut next = Some((first_hop.to_string(), frame));

        tokio::spawn(async move {
            while let Some((node_id, frame)) = next.take() {
                let Some((responder, behavior)) = network.lookup(&node_id) else {
                    tracing::debug!(node_id = %node_id, "Probe sent to unknown relay");
                    return;
                };
                match behavior {
                    RelayBehavior::Drop => return,
                    RelayBehavior::Delay(hold) => tokio::time::sleep(hold).await,
                    RelayBehavior::Honest | RelayBehavior::Tamper => {}
                }

                let (receipt, action) = responder.respond(&frame);
                if receipts.send(receipt).await.is_err() {
                    return;
                }
                if let ProbeAction::Forward { next: hop, mut frame } = action {
                    if behavior == RelayBehavior::Tamper {
                        if let Some(byte) = frame.packet.ciphertext.first_mut() {
                            *byte ^= 0x5A;
                        }
                    }
                    next = Some((hop, frame));
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityFlags;
    use crate::topology::LinkMetrics;
    use swarmlink_core::ManualClock;
    use swarmlink_crypto::NodeIdentity;

    struct Fixture {
        network: Arc<LoopbackRelayNetwork>,
        paths: Arc<PathManager>,
        proof: ProofOfRelay,
    }

    /// S - R1 - R2 - E line plus an alternative S - R3 - E.
    fn fixture() -> Fixture {
        let registry = Arc::new(RelayRegistry::new());
        let network = Arc::new(LoopbackRelayNetwork::new());
        for id in ["R1", "R2", "R3", "E"] {
            let identity = NodeIdentity::generate(id);
            let flags = if id == "E" {
                CapabilityFlags::RELAY.with(CapabilityFlags::EGRESS_CELLULAR)
            } else {
                CapabilityFlags::RELAY
            };
            registry.upsert(identity.public(), flags, 0);
            network.add_relay(RelayResponder::new(identity), RelayBehavior::Honest);
        }
        let paths = Arc::new(PathManager::new(
            "S",
            registry,
            ConfigHandle::default(),
            EventBus::default(),
        ));
        paths.observe_link("S", "R1", LinkMetrics::new(0.99, 20, 1_000, 0));
        paths.observe_link("R1", "R2", LinkMetrics::new(0.99, 20, 1_000, 0));
        paths.observe_link("R2", "E", LinkMetrics::new(0.99, 20, 1_000, 0));
        paths.observe_link("S", "R3", LinkMetrics::new(0.9, 80, 500, 0));
        paths.observe_link("R3", "E", LinkMetrics::new(0.9, 80, 500, 0));
        paths.recompute(0);

        let proof = ProofOfRelay::new(
            Arc::clone(&paths),
            Arc::new(Arc::clone(&network)),
            ConfigHandle::default(),
            Arc::new(ManualClock::new(1_000)),
            EventBus::default(),
        );
        Fixture {
            network,
            paths,
            proof,
        }
    }

    fn line_path(paths: &PathManager) -> RelayPath {
        paths
            .current()
            .selection("E")
            .and_then(|s| s.paths.iter().find(|p| p.contains("R1")).cloned())
            .expect("line path selected")
    }

    #[tokio::test(start_paused = true)]
    async fn test_honest_path_verified_and_rewarded() {
        let f = fixture();
        let path = line_path(&f.paths);
        let report = f.proof.probe_path(&path).await.unwrap();

        assert_eq!(report.verdict, ProbeVerdict::Verified);
        assert_eq!(report.receipts, 3);
        assert!(f.paths.registry().trust("R1").unwrap() > 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_relay_blamed_and_excluded() {
        let f = fixture();
        f.network.set_behavior("R2", RelayBehavior::Drop);
        let path = line_path(&f.paths);

        let report = f.proof.probe_path(&path).await.unwrap();
        assert!(matches!(
            report.verdict,
            ProbeVerdict::Compromised { ref node_id, .. } if node_id == "R2"
        ));
        assert_eq!(f.paths.registry().trust("R2"), Some(0.0));
        assert!(!f.paths.current().all_paths().any(|p| p.contains("R2")));
        assert!(f.paths.best_path("E").unwrap().contains("R3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delaying_relay_exceeds_deadline() {
        let f = fixture();
        f.network
            .set_behavior("R1", RelayBehavior::Delay(Duration::from_millis(500)));
        let path = line_path(&f.paths);

        let report = f.proof.probe_path(&path).await.unwrap();
        assert_eq!(report.deadline_ms, 90);
        assert!(matches!(
            report.verdict,
            ProbeVerdict::Compromised { ref node_id, finding: ProofFinding::MissingReceipt { hop: 0 } }
                if node_id == "R1"
        ));
        assert_eq!(report.receipts, 0);
        assert_eq!(report.round_trip_ms, 180);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_receipts_time_the_round_trip_without_clearing_blame() {
        let f = fixture();
        f.network
            .set_behavior("R1", RelayBehavior::Delay(Duration::from_millis(120)));
        let path = line_path(&f.paths);

        let report = f.proof.probe_path(&path).await.unwrap();
        assert!(matches!(
            report.verdict,
            ProbeVerdict::Compromised { ref node_id, .. } if node_id == "R1"
        ));
        assert_eq!(report.receipts, 0);
        assert_eq!(report.elapsed_ms, 90);
        assert_eq!(report.round_trip_ms, 120);
        assert!(report.round_trip_ms as f64 > path.latency_estimate_ms as f64 * PROBE_TIMEOUT_FACTOR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_round_trip_stays_within_bound() {
        let f = fixture();
        let path = line_path(&f.paths);
        let report = f.proof.probe_path(&path).await.unwrap();
        assert_eq!(report.verdict, ProbeVerdict::Verified);
        assert_eq!(report.round_trip_ms, report.elapsed_ms);
        assert!(report.round_trip_ms <= report.deadline_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tampering_relay_blamed_over_victim() {
        let f = fixture();
        f.network.set_behavior("R1", RelayBehavior::Tamper);
        let path = line_path(&f.paths);

        let report = f.proof.probe_path(&path).await.unwrap();
        assert!(matches!(
            report.verdict,
            ProbeVerdict::Compromised { ref node_id, finding: ProofFinding::ReceivedMismatch { hop: 1 } }
                if node_id == "R1"
        ));
        assert_eq!(f.paths.registry().trust("R2"), Some(0.5));
    }

    #[test]
    fn test_blame_prefers_lower_trust_on_mismatch() {
        let registry = RelayRegistry::new();
        for id in ["A", "B"] {
            registry.upsert(NodeIdentity::generate(id).public(), CapabilityFlags::RELAY, 0);
        }
        registry.apply_threat("B", swarmlink_core::Severity::Low, 0.3, 1);
        let path = vec!["A".to_string(), "B".to_string()];

        assert_eq!(
            assign_blame(&ProofFinding::ReceivedMismatch { hop: 1 }, &path, &registry),
            Some("B".to_string())
        );
        assert_eq!(
            assign_blame(&ProofFinding::ReceivedMismatch { hop: 0 }, &path, &registry),
            Some("A".to_string())
        );
        assert_eq!(assign_blame(&ProofFinding::AllAttested, &path, &registry), None);
    }
}
