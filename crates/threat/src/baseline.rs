//! Last known-good values the rules compare against.

use std::collections::HashMap;
use swarmlink_core::ChannelKind;

/// Reference values learned from telemetry that did not raise a threat.
#[derive(Debug, Clone, Default)]
pub struct Baselines {
    session_strength: HashMap<ChannelKind, u32>,
    fingerprints: HashMap<(ChannelKind, String), Vec<f64>>,
}

impl Baselines {
    /// Strength of the last successful session on `channel`.
    pub fn session_strength(&self, channel: ChannelKind) -> Option<u32> {
        self.session_strength.get(&channel).copied()
    }

    /// Remember a successful session.
    pub fn record_session(&mut self, channel: ChannelKind, strength_bits: u32) {
        self.session_strength.insert(channel, strength_bits);
    }

    /// Known-good fingerprint of a station or relay.
    pub fn fingerprint(&self, channel: ChannelKind, subject: &str) -> Option<&[f64]> {
        self.fingerprints
            .get(&(channel, subject.to_string()))
            .map(Vec::as_slice)
    }

    /// Remember a known-good fingerprint.
    pub fn record_fingerprint(&mut self, channel: ChannelKind, subject: &str, features: Vec<f64>) {
        self.fingerprints.insert((channel, subject.to_string()), features);
    }

    /// Forget everything learned about `channel`.
    pub fn reset_channel(&mut self, channel: ChannelKind) {
        self.session_strength.remove(&channel);
        self.fingerprints.retain(|(c, _), _| *c != channel);
    }
}
