//! Shared link-layer types.
//!
//! These are the value objects every other crate exchanges: channel
//! identities and observations, communication modes, message priorities and
//! threat severities, plus the clock abstraction used by the state machines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unique identifier for a node in the swarm
pub type NodeId = String;

/// Unix epoch milliseconds
pub type Timestamp = u64;

/// Physical medium served by one channel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Cellular / primary infrastructure network
    Cellular,
    /// Peer-to-peer mesh radio
    Mesh,
    /// Satellite uplink
    Satellite,
    /// Low-rate emergency beacon radio
    EmergencyRadio,
}

impl ChannelKind {
    /// All channel kinds, in a stable order.
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Cellular,
        ChannelKind::Mesh,
        ChannelKind::Satellite,
        ChannelKind::EmergencyRadio,
    ];

    /// Stable string key used for persistence and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Cellular => "cellular",
            ChannelKind::Mesh => "mesh",
            ChannelKind::Satellite => "satellite",
            ChannelKind::EmergencyRadio => "emergency_radio",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized link-quality sample for one channel.
///
/// Immutable once recorded. `signal_quality` and `error_rate` are always
/// within `[0, 1]`; the constructor clamps out-of-range driver values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelObservation {
    /// Channel the sample was taken on
    pub channel: ChannelKind,
    /// Signal quality (0.0 = no signal, 1.0 = perfect)
    pub signal_quality: f64,
    /// Measured round-trip latency in milliseconds
    pub measured_latency_ms: u64,
    /// Visible base stations (cellular) or peers (mesh)
    pub peer_or_cell_count: u32,
    /// Packet error rate (0.0 to 1.0)
    pub error_rate: f64,
    /// Sample timestamp (Unix epoch milliseconds)
    pub timestamp: Timestamp,
}

impl ChannelObservation {
    /// Create an observation, clamping ratios into `[0, 1]`.
    pub fn new(
        channel: ChannelKind,
        signal_quality: f64,
        measured_latency_ms: u64,
        peer_or_cell_count: u32,
        error_rate: f64,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            channel,
            signal_quality: clamp_unit(signal_quality),
            measured_latency_ms,
            peer_or_cell_count,
            error_rate: clamp_unit(error_rate),
            timestamp,
        }
    }

    /// A sample indicating the channel has no signal at all.
    pub fn no_signal(channel: ChannelKind, timestamp: Timestamp) -> Self {
        Self::new(channel, 0.0, 0, 0, 1.0, timestamp)
    }

    /// Whether this sample meets the usability floor/ceiling.
    pub fn is_usable(&self, signal_floor: f64, error_ceiling: f64) -> bool {
        self.signal_quality >= signal_floor && self.error_rate <= error_ceiling
    }
}

/// Clamp a ratio into `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Active communication mode of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Mesh/relay only
    Tactical,
    /// Mesh and infrastructure concurrently
    Hybrid,
    /// Cellular / primary network preferred
    Infrastructure,
    /// Satellite uplink
    Satcom,
    /// Last-resort broadcast beacon
    Emergency,
}

impl Mode {
    /// Modes ordered from most to least secure.
    pub const SECURITY_ORDER: [Mode; 5] = [
        Mode::Tactical,
        Mode::Hybrid,
        Mode::Infrastructure,
        Mode::Satcom,
        Mode::Emergency,
    ];

    /// Channels this mode keeps active.
    pub fn channels(&self) -> &'static [ChannelKind] {
        match self {
            Mode::Tactical => &[ChannelKind::Mesh],
            Mode::Hybrid => &[ChannelKind::Mesh, ChannelKind::Cellular],
            Mode::Infrastructure => &[ChannelKind::Cellular],
            Mode::Satcom => &[ChannelKind::Satellite],
            Mode::Emergency => &[ChannelKind::EmergencyRadio],
        }
    }

    /// Whether traffic in this mode is carried over relay paths.
    pub fn uses_relay(&self) -> bool {
        matches!(self, Mode::Tactical | Mode::Hybrid)
    }

    /// Whether this mode uses the given channel.
    pub fn uses_channel(&self, channel: ChannelKind) -> bool {
        self.channels().contains(&channel)
    }

    /// Position in [`Mode::SECURITY_ORDER`] (0 = most secure).
    pub fn security_rank(&self) -> usize {
        match self {
            Mode::Tactical => 0,
            Mode::Hybrid => 1,
            Mode::Infrastructure => 2,
            Mode::Satcom => 3,
            Mode::Emergency => 4,
        }
    }

    /// Stable string key used for persistence and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Tactical => "TACTICAL",
            Mode::Hybrid => "HYBRID",
            Mode::Infrastructure => "INFRASTRUCTURE",
            Mode::Satcom => "SATCOM",
            Mode::Emergency => "EMERGENCY",
        }
    }

    /// Parse the persistence key produced by [`Mode::as_str`].
    pub fn from_key(key: &str) -> Option<Self> {
        Mode::SECURITY_ORDER
            .iter()
            .copied()
            .find(|m| m.as_str() == key)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Bulk / best effort
    Low,
    /// Ordinary mission traffic
    Normal,
    /// Flight-critical traffic, duplicated during overlap
    Critical,
    /// Never dropped silently; queued and retried until its deadline
    Emergency,
}

impl Priority {
    /// Whether this priority is duplicated on both channel sets during an overlap.
    pub fn is_duplicated(&self) -> bool {
        matches!(self, Priority::Critical | Priority::Emergency)
    }
}

/// Threat severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Source of wall-clock time for the state machines.
///
/// The mode controller and detectors never read the system clock directly,
/// which keeps their timing behaviour reproducible under test.
pub trait Clock: Send + Sync {
    /// Current time in Unix epoch milliseconds.
    fn now_ms(&self) -> Timestamp;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        current_timestamp_ms()
    }
}

/// Manually advanced clock for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `start_ms`.
    pub fn new(start_ms: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Advance the clock.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, at_ms: Timestamp) {
        self.now.store(at_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
