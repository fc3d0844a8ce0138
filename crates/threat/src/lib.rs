//! SwarmLink Threat - rule-based detection of network-level attacks
//!
//! Turns channel and relay telemetry into [`ThreatEvent`]s:
//!
//! - `IMSI_CATCHER_SUSPECTED` when an area shows implausibly many stations
//! - `PROTOCOL_DOWNGRADE` when a session is weaker than the last good one
//! - `TRAFFIC_ANALYSIS_OR_TAMPERING` when a relay path is unexpectedly slow
//! - `SPOOFING_SUSPECTED` when a fingerprint drifts from its known-good value
//!
//! Events flow one way: detector, then dispatcher, then the mode controller
//! and path manager. Nothing calls back into the detector.

#![warn(missing_docs)]

pub mod baseline;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod log;
pub mod rules;

pub use baseline::Baselines;
pub use detector::ThreatDetector;
pub use dispatch::{by_precedence, ThreatDispatcher};
pub use error::{ThreatError, ThreatResult};
pub use event::{Affected, FingerprintSample, Telemetry, ThreatEvent, ThreatKind};
pub use log::ThreatLog;
pub use rules::{
    cosine_similarity, default_rules, DowngradeRule, FingerprintRule, ImpossibleDensityRule,
    RuleContext, ThreatRule, TimingAnomalyRule,
};
