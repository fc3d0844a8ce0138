//! Anomaly rules.
//!
//! Each rule looks at one telemetry item plus read-only baselines and the
//! configuration snapshot of the current evaluation, and yields at most one
//! [`ThreatEvent`]. Rules keep no state of their own; the detector updates
//! baselines after every rule has seen the item.

use crate::baseline::Baselines;
use crate::event::{FingerprintSample, Telemetry, ThreatEvent, ThreatKind};
use serde_json::json;
use swarmlink_core::LinkConfig;

/// Everything a rule may look at.
pub struct RuleContext<'a> {
    /// Item under evaluation
    pub telemetry: &'a Telemetry,
    /// Last known-good values
    pub baselines: &'a Baselines,
    /// Configuration snapshot for this evaluation
    pub config: &'a LinkConfig,
}

/// A single anomaly rule.
pub trait ThreatRule: Send + Sync {
    /// Stable rule name, recorded on every event it raises.
    fn name(&self) -> &'static str;

    /// Evaluate one telemetry item.
    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<ThreatEvent>;
}

fn raise(
    rule: &dyn ThreatRule,
    kind: ThreatKind,
    ctx: &RuleContext<'_>,
    evidence: serde_json::Value,
) -> ThreatEvent {
    ThreatEvent {
        // Assigned by the detector when the event is accepted.
        sequence: 0,
        kind,
        severity: kind.severity(),
        rule: rule.name().to_string(),
        affected: ctx.telemetry.affected(),
        evidence,
        timestamp: ctx.telemetry.timestamp(),
    }
}

/// More stations or peers in an area than its expected density allows.
pub struct ImpossibleDensityRule;

impl ThreatRule for ImpossibleDensityRule {
    fn name(&self) -> &'static str {
        "impossible_density"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<ThreatEvent> {
        let Telemetry::Density {
            lat, lon, observed, ..
        } = ctx.telemetry
        else {
            return None;
        };
        let area = ctx.config.area_key(*lat, *lon);
        let expected = ctx.config.expected_density(&area);
        // No expectation for the area means nothing to compare against.
        if expected <= 0.0 {
            return None;
        }
        let limit = expected * ctx.config.density_multiplier;
        (f64::from(*observed) > limit).then(|| {
            raise(
                self,
                ThreatKind::ImsiCatcherSuspected,
                ctx,
                json!({ "area": area, "observed": observed, "expected": expected, "limit": limit }),
            )
        })
    }
}

/// Session strength below the last good session on the same channel.
pub struct DowngradeRule;

impl ThreatRule for DowngradeRule {
    fn name(&self) -> &'static str {
        "protocol_downgrade"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<ThreatEvent> {
        let Telemetry::SessionNegotiated {
            channel,
            strength_bits,
            ..
        } = ctx.telemetry
        else {
            return None;
        };
        let previous = ctx.baselines.session_strength(*channel)?;
        (*strength_bits < previous).then(|| {
            raise(
                self,
                ThreatKind::ProtocolDowngrade,
                ctx,
                json!({ "negotiated_bits": strength_bits, "previous_bits": previous }),
            )
        })
    }
}

/// Path latency above `timing_anomaly_factor` times its expectation.
pub struct TimingAnomalyRule;

impl ThreatRule for TimingAnomalyRule {
    fn name(&self) -> &'static str {
        "timing_anomaly"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<ThreatEvent> {
        let Telemetry::PathLatency {
            expected_ms,
            measured_ms,
            ..
        } = ctx.telemetry
        else {
            return None;
        };
        if *expected_ms == 0 {
            return None;
        }
        let ratio = *measured_ms as f64 / *expected_ms as f64;
        (ratio > ctx.config.timing_anomaly_factor).then(|| {
            raise(
                self,
                ThreatKind::TrafficAnalysisOrTampering,
                ctx,
                json!({ "expected_ms": expected_ms, "measured_ms": measured_ms, "ratio": ratio }),
            )
        })
    }
}

/// Fingerprint similarity below the floor.
pub struct FingerprintRule;

impl ThreatRule for FingerprintRule {
    fn name(&self) -> &'static str {
        "fingerprint_mismatch"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<ThreatEvent> {
        let Telemetry::Fingerprint {
            channel,
            subject,
            sample,
            ..
        } = ctx.telemetry
        else {
            return None;
        };
        let similarity = match sample {
            FingerprintSample::Similarity(s) => *s,
            FingerprintSample::Features(features) => {
                let known = ctx.baselines.fingerprint(*channel, subject)?;
                cosine_similarity(known, features)
            }
        };
        (similarity < ctx.config.fingerprint_similarity_floor).then(|| {
            raise(
                self,
                ThreatKind::SpoofingSuspected,
                ctx,
                json!({
                    "similarity": similarity,
                    "floor": ctx.config.fingerprint_similarity_floor,
                }),
            )
        })
    }
}

/// Cosine similarity of two feature vectors, clamped to `[0, 1]`.
///
/// Vectors of different length, or with zero norm, have similarity 0.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    swarmlink_core::clamp_unit(dot / (norm_a * norm_b))
}

/// The four required rules.
pub fn default_rules() -> Vec<Box<dyn ThreatRule>> {
    vec![
        Box::new(ImpossibleDensityRule),
        Box::new(DowngradeRule),
        Box::new(TimingAnomalyRule),
        Box::new(FingerprintRule),
    ]
}
