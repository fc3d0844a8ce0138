//! Threat events and the telemetry they are derived from.

use crate::error::{ThreatError, ThreatResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use swarmlink_core::{ChannelKind, ChannelObservation, NodeId, Severity, Timestamp};

/// Kind of detected threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatKind {
    /// More base stations/peers than the area can plausibly hold
    ImsiCatcherSuspected,
    /// Negotiated encryption weaker than the last good session
    ProtocolDowngrade,
    /// Path latency well above its expectation
    TrafficAnalysisOrTampering,
    /// Fingerprint no longer matches the known-good one
    SpoofingSuspected,
}

impl ThreatKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::ImsiCatcherSuspected => "IMSI_CATCHER_SUSPECTED",
            ThreatKind::ProtocolDowngrade => "PROTOCOL_DOWNGRADE",
            ThreatKind::TrafficAnalysisOrTampering => "TRAFFIC_ANALYSIS_OR_TAMPERING",
            ThreatKind::SpoofingSuspected => "SPOOFING_SUSPECTED",
        }
    }

    /// Severity this kind is raised with.
    pub fn severity(&self) -> Severity {
        match self {
            ThreatKind::ImsiCatcherSuspected => Severity::High,
            ThreatKind::ProtocolDowngrade => Severity::Critical,
            ThreatKind::TrafficAnalysisOrTampering => Severity::Medium,
            ThreatKind::SpoofingSuspected => Severity::High,
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a threat is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Affected {
    /// A whole channel
    Channel {
        /// The channel
        channel: ChannelKind,
    },
    /// One base station or access point on a channel
    Station {
        /// Channel the station serves
        channel: ChannelKind,
        /// Station identifier (cell id, BSSID, ...)
        station_id: String,
    },
    /// One relay node
    Relay {
        /// The relay
        node_id: NodeId,
    },
    /// A relay path, listed from the first hop to the target
    Path {
        /// Hops of the path
        hops: Vec<NodeId>,
    },
}

impl Affected {
    /// Channel whose integrity is in question, if the threat is channel-level.
    ///
    /// Relay and path threats return `None`; they are handled by excluding
    /// relays rather than by abandoning the mesh.
    pub fn channel(&self) -> Option<ChannelKind> {
        match self {
            Affected::Channel { channel } | Affected::Station { channel, .. } => Some(*channel),
            Affected::Relay { .. } | Affected::Path { .. } => None,
        }
    }

    /// Relays implicated by the threat.
    pub fn relays(&self) -> &[NodeId] {
        match self {
            Affected::Relay { node_id } => std::slice::from_ref(node_id),
            Affected::Path { hops } => hops,
            Affected::Channel { .. } | Affected::Station { .. } => &[],
        }
    }
}

impl fmt::Display for Affected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affected::Channel { channel } => write!(f, "{channel}"),
            Affected::Station {
                channel,
                station_id,
            } => write!(f, "{channel}/{station_id}"),
            Affected::Relay { node_id } => write!(f, "relay {node_id}"),
            Affected::Path { hops } => write!(f, "path {}", hops.join(">")),
        }
    }
}

/// One detected threat. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    /// Generation sequence number, increasing per detector
    pub sequence: u64,
    /// Threat kind
    pub kind: ThreatKind,
    /// Severity
    pub severity: Severity,
    /// Rule that raised it
    pub rule: String,
    /// What the threat is about
    pub affected: Affected,
    /// Measured values that triggered the rule
    pub evidence: serde_json::Value,
    /// Detection time
    pub timestamp: Timestamp,
}

impl ThreatEvent {
    /// Whether this threat should preempt anything of lower severity.
    pub fn is_urgent(&self) -> bool {
        self.severity >= Severity::High
    }
}

/// Fingerprint measurement for a station or relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FingerprintSample {
    /// Raw feature vector (RF characteristics, key hash bytes, ...)
    Features(Vec<f64>),
    /// Similarity to the known-good fingerprint, already computed by the driver
    Similarity(f64),
}

/// Input to the threat rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Telemetry {
    /// Base-station/peer count seen at a position
    Density {
        /// Channel the count was taken on
        channel: ChannelKind,
        /// Latitude in degrees
        lat: f64,
        /// Longitude in degrees
        lon: f64,
        /// Visible stations or peers
        observed: u32,
        /// Sample time
        timestamp: Timestamp,
    },
    /// A session was negotiated on a channel
    SessionNegotiated {
        /// Channel
        channel: ChannelKind,
        /// Effective key strength in bits
        strength_bits: u32,
        /// Negotiation time
        timestamp: Timestamp,
    },
    /// Measured round trip over a relay path
    PathLatency {
        /// Hops from the first relay to the target
        hops: Vec<NodeId>,
        /// Latency the path was selected with
        expected_ms: u64,
        /// Measured latency
        measured_ms: u64,
        /// Measurement time
        timestamp: Timestamp,
    },
    /// Fingerprint of a station (or of a relay when `channel` is the mesh)
    Fingerprint {
        /// Channel the subject was seen on
        channel: ChannelKind,
        /// Station or relay identifier
        subject: String,
        /// Measurement
        sample: FingerprintSample,
        /// Measurement time
        timestamp: Timestamp,
    },
}

impl Telemetry {
    /// Density telemetry from a channel observation taken at a position.
    pub fn density(observation: &ChannelObservation, lat: f64, lon: f64) -> Self {
        Telemetry::Density {
            channel: observation.channel,
            lat,
            lon,
            observed: observation.peer_or_cell_count,
            timestamp: observation.timestamp,
        }
    }

    /// Time the telemetry was taken.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Telemetry::Density { timestamp, .. }
            | Telemetry::SessionNegotiated { timestamp, .. }
            | Telemetry::PathLatency { timestamp, .. }
            | Telemetry::Fingerprint { timestamp, .. } => *timestamp,
        }
    }

    /// Reject telemetry that cannot be evaluated.
    pub fn validate(&self) -> ThreatResult<()> {
        match self {
            Telemetry::Density { lat, lon, .. } => {
                if !lat.is_finite() || !lon.is_finite() {
                    return Err(ThreatError::InvalidTelemetry(format!(
                        "position ({lat}, {lon}) is not finite"
                    )));
                }
            }
            Telemetry::PathLatency { hops, .. } => {
                if hops.is_empty() {
                    return Err(ThreatError::InvalidTelemetry(
                        "path latency reported for an empty path".to_string(),
                    ));
                }
            }
            Telemetry::Fingerprint { subject, sample, .. } => {
                let finite = match sample {
                    FingerprintSample::Features(features) => features.iter().all(|f| f.is_finite()),
                    FingerprintSample::Similarity(s) => s.is_finite(),
                };
                if !finite {
                    return Err(ThreatError::InvalidTelemetry(format!(
                        "fingerprint for {subject} contains non-finite values"
                    )));
                }
            }
            Telemetry::SessionNegotiated { .. } => {}
        }
        Ok(())
    }

    /// What a threat raised from this telemetry would be about.
    pub fn affected(&self) -> Affected {
        match self {
            Telemetry::Density { channel, .. } | Telemetry::SessionNegotiated { channel, .. } => {
                Affected::Channel { channel: *channel }
            }
            Telemetry::PathLatency { hops, .. } => Affected::Path { hops: hops.clone() },
            Telemetry::Fingerprint {
                channel: ChannelKind::Mesh,
                subject,
                ..
            } => Affected::Relay {
                node_id: subject.clone(),
            },
            Telemetry::Fingerprint {
                channel, subject, ..
            } => Affected::Station {
                channel: *channel,
                station_id: subject.clone(),
            },
        }
    }
}
