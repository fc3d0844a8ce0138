//! Proof-of-relay cryptography.
//!
//! A probe is an onion packet whose every layer carries a random 32-byte
//! challenge. Only the holder of a hop's relay key can read its challenge, and
//! the hop's receipt binds that challenge to digests of what it received and
//! what it forwarded, signed with its attestation key. The source knows the
//! exact bytes every honest hop must see, so it can check each receipt without
//! any relay learning the probe payload.
//!
//! This module is pure: it builds probes, answers them, and grades receipts.
//! Scheduling, timeouts and trust updates live in the mesh crate.

use crate::keys::{NodeIdentity, PublicIdentity};
use crate::onion::{Challenge, NextHop, OnionCodec, OnionError, OnionPacket, CHALLENGE_SIZE};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use swarmlink_core::NodeId;
use thiserror::Error;

const RECEIPT_DOMAIN: &[u8] = b"swarmlink-por-v1";
const PROBE_ID_SIZE: usize = 16;

/// Proof-of-relay errors.
#[derive(Debug, Error)]
pub enum ProofError {
    /// Probe path must contain at least the egress node
    #[error("Probe path is empty")]
    EmptyPath,

    /// Probe frame could not be parsed
    #[error("Malformed probe frame: {0}")]
    Malformed(String),

    /// Receipt could not be encoded or decoded
    #[error("Receipt encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Onion construction failed
    #[error("Onion error: {0}")]
    Onion(#[from] OnionError),
}

/// Result type for proof-of-relay operations.
pub type ProofResult<T> = Result<T, ProofError>;

/// Probe identifier.
pub type ProbeId = [u8; PROBE_ID_SIZE];

/// A probe in flight: identifier plus the onion layer for the receiving hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFrame {
    /// Random probe identifier, echoed in every receipt
    pub probe_id: ProbeId,
    /// Onion layer addressed to the receiving hop
    pub packet: OnionPacket,
}

impl ProbeFrame {
    /// Wire encoding: probe id (16) || onion packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROBE_ID_SIZE + self.packet.ciphertext.len() + 44);
        out.extend_from_slice(&self.probe_id);
        out.extend_from_slice(&self.packet.to_bytes());
        out
    }

    /// Parse the wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> ProofResult<Self> {
        if bytes.len() < PROBE_ID_SIZE {
            return Err(ProofError::Malformed("frame shorter than probe id".to_string()));
        }
        let mut probe_id = [0u8; PROBE_ID_SIZE];
        probe_id.copy_from_slice(&bytes[..PROBE_ID_SIZE]);
        let packet = OnionPacket::from_bytes(&bytes[PROBE_ID_SIZE..])?;
        Ok(Self { probe_id, packet })
    }
}

/// What a hop says it did with a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayStatus {
    /// Layer peeled; digest of the forwarded packet (or delivered payload at the egress)
    Forwarded { forwarded_digest: [u8; 32] },
    /// Layer could not be peeled with this hop's key
    Rejected,
}

/// Signed per-hop attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopReceipt {
    /// Probe this receipt answers
    pub probe_id: ProbeId,
    /// Attesting node
    pub node_id: NodeId,
    /// Digest of the probe layer this node received
    pub received_digest: [u8; 32],
    /// Forwarding outcome
    pub status: RelayStatus,
    /// Ed25519 signature by the node's attestation key
    pub signature: Vec<u8>,
}

impl HopReceipt {
    /// Encode for transport.
    pub fn to_bytes(&self) -> ProofResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from transport.
    pub fn from_bytes(bytes: &[u8]) -> ProofResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Check the signature, given the challenge the hop should have read.
    pub fn verify(&self, signer: &PublicIdentity, challenge: &Challenge) -> bool {
        if signer.node_id != self.node_id {
            return false;
        }
        let challenge = match self.status {
            RelayStatus::Forwarded { .. } => *challenge,
            RelayStatus::Rejected => [0u8; CHALLENGE_SIZE],
        };
        let message = receipt_message(
            &self.probe_id,
            &self.node_id,
            &challenge,
            &self.received_digest,
            &self.status,
        );
        signer.verify(&message, &self.signature)
    }
}

fn receipt_message(
    probe_id: &ProbeId,
    node_id: &str,
    challenge: &Challenge,
    received_digest: &[u8; 32],
    status: &RelayStatus,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(RECEIPT_DOMAIN.len() + 16 + node_id.len() + 2 + 32 * 3 + 1);
    msg.extend_from_slice(RECEIPT_DOMAIN);
    msg.extend_from_slice(probe_id);
    msg.extend_from_slice(&(node_id.len() as u16).to_be_bytes());
    msg.extend_from_slice(node_id.as_bytes());
    msg.extend_from_slice(challenge);
    msg.extend_from_slice(received_digest);
    match status {
        RelayStatus::Forwarded { forwarded_digest } => {
            msg.push(0x01);
            msg.extend_from_slice(forwarded_digest);
        }
        RelayStatus::Rejected => {
            msg.push(0x00);
            msg.extend_from_slice(&[0u8; 32]);
        }
    }
    msg
}

/// What a relay does after answering a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAction {
    /// Hand the next frame to this node
    Forward { next: NodeId, frame: ProbeFrame },
    /// This node was the egress; the probe ends here
    Delivered,
    /// The layer was not addressed to this node
    Dropped,
}

/// Answers probes on behalf of one relay node.
#[derive(Debug, Clone)]
pub struct RelayResponder {
    identity: NodeIdentity,
}

impl RelayResponder {
    pub fn new(identity: NodeIdentity) -> Self {
        Self { identity }
    }

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    /// Peel the probe layer, sign a receipt and say where the probe goes next.
    pub fn respond(&self, frame: &ProbeFrame) -> (HopReceipt, ProbeAction) {
        let received_digest = frame.packet.digest();

        let (status, challenge, action) =
            match OnionCodec::peel(&frame.packet, self.identity.relay_secret()) {
                Ok(peeled) => {
                    let challenge = peeled.challenge.unwrap_or([0u8; CHALLENGE_SIZE]);
                    match &peeled.next {
                        NextHop::Relay(next) => match peeled.forward_packet() {
                            Ok(packet) => (
                                RelayStatus::Forwarded {
                                    forwarded_digest: packet.digest(),
                                },
                                challenge,
                                ProbeAction::Forward {
                                    next: next.clone(),
                                    frame: ProbeFrame {
                                        probe_id: frame.probe_id,
                                        packet,
                                    },
                                },
                            ),
                            Err(_) => (RelayStatus::Rejected, [0u8; CHALLENGE_SIZE], ProbeAction::Dropped),
                        },
                        NextHop::Destination => (
                            RelayStatus::Forwarded {
                                forwarded_digest: *blake3::hash(&peeled.inner).as_bytes(),
                            },
                            challenge,
                            ProbeAction::Delivered,
                        ),
                    }
                }
                Err(_) => (RelayStatus::Rejected, [0u8; CHALLENGE_SIZE], ProbeAction::Dropped),
            };

        let message = receipt_message(
            &frame.probe_id,
            self.identity.node_id(),
            &challenge,
            &received_digest,
            &status,
        );
        let receipt = HopReceipt {
            probe_id: frame.probe_id,
            node_id: self.identity.node_id().to_string(),
            received_digest,
            status,
            signature: self.identity.sign(&message).to_vec(),
        };
        (receipt, action)
    }
}

#[derive(Debug, Clone)]
struct ExpectedHop {
    identity: PublicIdentity,
    challenge: Challenge,
    expected_in: [u8; 32],
    expected_out: [u8; 32],
}

/// First problem found when grading receipts, by hop index along the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofFinding {
    /// Every hop produced a valid receipt consistent with honest forwarding
    AllAttested,
    /// No receipt from this hop
    MissingReceipt { hop: usize },
    /// Receipt signature does not verify against the hop's key and challenge
    InvalidSignature { hop: usize },
    /// Hop received something other than what the previous hop should have sent
    ReceivedMismatch { hop: usize },
    /// Hop received the right packet but could not peel it
    Rejected { hop: usize },
    /// Hop forwarded something other than the honest next layer
    ForwardedMismatch { hop: usize },
}

/// What the source expects to see from each hop of one probe.
#[derive(Debug, Clone)]
pub struct ProbeExpectation {
    probe_id: ProbeId,
    hops: Vec<ExpectedHop>,
}

impl ProbeExpectation {
    /// Build a probe along `path` (relays in order, egress last).
    pub fn build(path: &[PublicIdentity]) -> ProofResult<(ProbeFrame, Self)> {
        let (egress, relays) = path.split_last().ok_or(ProofError::EmptyPath)?;

        let mut probe_id = [0u8; PROBE_ID_SIZE];
        OsRng.fill_bytes(&mut probe_id);
        let mut payload = [0u8; 32];
        OsRng.fill_bytes(&mut payload);
        let challenges: Vec<Challenge> = path
            .iter()
            .map(|_| {
                let mut c = [0u8; CHALLENGE_SIZE];
                OsRng.fill_bytes(&mut c);
                c
            })
            .collect();

        let layered = OnionCodec::wrap_with_challenges(&payload, relays, egress, &challenges)?;
        let digests = layered.hop_digests();
        let delivered = *blake3::hash(&payload).as_bytes();

        let hops = path
            .iter()
            .enumerate()
            .map(|(idx, identity)| ExpectedHop {
                identity: identity.clone(),
                challenge: challenges[idx],
                expected_in: digests[idx],
                expected_out: digests.get(idx + 1).copied().unwrap_or(delivered),
            })
            .collect();

        let outer = layered
            .outer()
            .cloned()
            .ok_or_else(|| ProofError::Malformed("probe has no layers".to_string()))?;

        Ok((
            ProbeFrame {
                probe_id,
                packet: outer,
            },
            Self { probe_id, hops },
        ))
    }

    pub fn probe_id(&self) -> ProbeId {
        self.probe_id
    }

    /// Node ids along the probed path.
    pub fn path(&self) -> Vec<NodeId> {
        self.hops.iter().map(|h| h.identity.node_id.clone()).collect()
    }

    /// Number of hops expected to answer.
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Grade collected receipts. Receipts for other probes or unknown nodes are ignored.
    pub fn evaluate(&self, receipts: &[HopReceipt]) -> ProofFinding {
        let by_node: HashMap<&str, &HopReceipt> = receipts
            .iter()
            .filter(|r| r.probe_id == self.probe_id)
            .map(|r| (r.node_id.as_str(), r))
            .collect();

        for (idx, hop) in self.hops.iter().enumerate() {
            let Some(receipt) = by_node.get(hop.identity.node_id.as_str()) else {
                return ProofFinding::MissingReceipt { hop: idx };
            };
            if !receipt.verify(&hop.identity, &hop.challenge) {
                return ProofFinding::InvalidSignature { hop: idx };
            }
            if receipt.received_digest != hop.expected_in {
                return ProofFinding::ReceivedMismatch { hop: idx };
            }
            match &receipt.status {
                RelayStatus::Rejected => return ProofFinding::Rejected { hop: idx },
                RelayStatus::Forwarded { forwarded_digest } => {
                    if *forwarded_digest != hop.expected_out {
                        return ProofFinding::ForwardedMismatch { hop: idx };
                    }
                }
            }
        }
        ProofFinding::AllAttested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_chain(ids: &[&str]) -> (Vec<RelayResponder>, Vec<PublicIdentity>) {
        let identities: Vec<NodeIdentity> = ids.iter().map(|id| NodeIdentity::generate(*id)).collect();
        let publics = identities.iter().map(NodeIdentity::public).collect();
        (identities.into_iter().map(RelayResponder::new).collect(), publics)
    }

    fn run_honest(responders: &[RelayResponder], frame: ProbeFrame) -> Vec<HopReceipt> {
        let mut receipts = Vec::new();
        let mut current = frame;
        for responder in responders {
            let (receipt, action) = responder.respond(&current);
            receipts.push(receipt);
            match action {
                ProbeAction::Forward { frame, .. } => current = frame,
                ProbeAction::Delivered | ProbeAction::Dropped => break,
            }
        }
        receipts
    }

    #[test]
    fn test_honest_path_is_attested() {
        let (responders, path) = relay_chain(&["r1", "r2", "egress"]);
        let (frame, expectation) = ProbeExpectation::build(&path).unwrap();
        let receipts = run_honest(&responders, frame);

        assert_eq!(receipts.len(), 3);
        assert_eq!(expectation.evaluate(&receipts), ProofFinding::AllAttested);
    }

    #[test]
    fn test_missing_receipt_detected() {
        let (responders, path) = relay_chain(&["r1", "r2", "egress"]);
        let (frame, expectation) = ProbeExpectation::build(&path).unwrap();
        let mut receipts = run_honest(&responders, frame);
        receipts.truncate(1);

        assert_eq!(
            expectation.evaluate(&receipts),
            ProofFinding::MissingReceipt { hop: 1 }
        );
    }

    #[test]
    fn test_tampering_relay_detected() {
        let (responders, path) = relay_chain(&["r1", "r2", "egress"]);
        let (frame, expectation) = ProbeExpectation::build(&path).unwrap();

        let (first, action) = responders[0].respond(&frame);
        let ProbeAction::Forward { frame: mut next, .. } = action else {
            panic!("first hop should forward");
        };
        if let Some(byte) = next.packet.ciphertext.first_mut() {
            *byte ^= 0xAA;
        }
        let (second, _) = responders[1].respond(&next);

        // r1 honestly attests to what it should have sent; r2 saw something else.
        assert_eq!(
            expectation.evaluate(&[first, second]),
            ProofFinding::ReceivedMismatch { hop: 1 }
        );
    }

    #[test]
    fn test_forged_receipt_rejected() {
        let (responders, path) = relay_chain(&["r1", "egress"]);
        let (frame, expectation) = ProbeExpectation::build(&path).unwrap();
        let mut receipts = run_honest(&responders, frame);
        receipts[1].status = RelayStatus::Forwarded {
            forwarded_digest: [9u8; 32],
        };

        assert_eq!(
            expectation.evaluate(&receipts),
            ProofFinding::InvalidSignature { hop: 1 }
        );
    }

    #[test]
    fn test_receipt_without_key_cannot_answer_challenge() {
        let (responders, path) = relay_chain(&["r1", "egress"]);
        let (frame, expectation) = ProbeExpectation::build(&path).unwrap();
        let imposter = RelayResponder::new(NodeIdentity::generate("r1"));

        let (receipt, action) = imposter.respond(&frame);
        assert_eq!(action, ProbeAction::Dropped);
        assert_eq!(receipt.status, RelayStatus::Rejected);

        let (_, honest_next) = responders[0].respond(&frame);
        assert!(matches!(honest_next, ProbeAction::Forward { .. }));
        assert_eq!(
            expectation.evaluate(&[receipt]),
            ProofFinding::InvalidSignature { hop: 0 }
        );
    }

    #[test]
    fn test_receipt_and_frame_encoding() {
        let (responders, path) = relay_chain(&["egress"]);
        let (frame, _) = ProbeExpectation::build(&path).unwrap();
        let parsed = ProbeFrame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(parsed, frame);

        let (receipt, action) = responders[0].respond(&parsed);
        assert_eq!(action, ProbeAction::Delivered);
        let decoded = HopReceipt::from_bytes(&receipt.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, receipt);
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(matches!(
            ProbeExpectation::build(&[]),
            Err(ProofError::EmptyPath)
        ));
    }
}
