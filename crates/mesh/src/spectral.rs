//! Spectral agility for the EMERGENCY beacon.
//!
//! The beacon hops across a small fixed frequency set. The order is a
//! deterministic permutation of that set derived from a shared seed, so
//! listeners that know the seed can follow the beacon by epoch. A hop happens
//! when the dwell time runs out, or immediately when the packet error rate
//! suggests jamming.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use swarmlink_core::Timestamp;

/// Frequency channel identifier
pub type FrequencyId = u32;

/// Frequency hopping pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoppingPattern {
    /// Sequence of frequencies to hop through
    pub channels: Vec<FrequencyId>,
    /// Dwell time per frequency in milliseconds
    pub dwell_time_ms: u64,
}

/// Frequency hopping state machine
#[derive(Debug)]
pub struct FrequencyHopper {
    /// Current hopping pattern
    pattern: Option<HoppingPattern>,
    /// Current index in pattern
    current_index: usize,
    /// Timestamp of last hop
    last_hop_time: Timestamp,
    /// Packet Error Rate threshold for triggering hop
    per_threshold: f64,
    /// Is jamming detected?
    jamming_detected: bool,
}

impl FrequencyHopper {
    /// Create a new frequency hopper
    pub fn new(per_threshold: f64) -> Self {
        Self {
            pattern: None,
            current_index: 0,
            last_hop_time: 0,
            per_threshold,
            jamming_detected: false,
        }
    }

    /// Set a new hopping pattern, starting on its first frequency at `now`.
    pub fn set_pattern(&mut self, pattern: HoppingPattern, now: Timestamp) {
        self.pattern = Some(pattern).filter(|p| !p.channels.is_empty());
        self.current_index = 0;
        self.last_hop_time = now;
    }

    /// Get the current frequency
    pub fn current_channel(&self) -> Option<FrequencyId> {
        self.pattern
            .as_ref()
            .and_then(|p| p.channels.get(self.current_index).copied())
    }

    /// Update Packet Error Rate measurement
    pub fn update_per(&mut self, per: f64) {
        self.jamming_detected = per > self.per_threshold;
    }

    /// Check if it's time to hop to the next frequency
    pub fn should_hop(&self, now: Timestamp) -> bool {
        match &self.pattern {
            Some(pattern) => {
                now.saturating_sub(self.last_hop_time) >= pattern.dwell_time_ms
                    || self.jamming_detected
            }
            None => false,
        }
    }

    /// Perform frequency hop to next frequency
    pub fn hop(&mut self, now: Timestamp) -> HopResult {
        let Some(pattern) = &self.pattern else {
            return HopResult::NoPattern;
        };
        self.current_index = (self.current_index + 1) % pattern.channels.len();
        self.last_hop_time = now;

        let reason = if self.jamming_detected {
            self.jamming_detected = false;
            HopReason::JammingDetected
        } else {
            HopReason::ScheduledHop
        };
        HopResult::Success {
            new_channel: pattern.channels[self.current_index],
            reason,
        }
    }

    /// Jump to the frequency for `epoch` (for receivers following by time).
    pub fn hop_at_epoch(&mut self, epoch: u64, now: Timestamp) -> HopResult {
        let Some(pattern) = &self.pattern else {
            return HopResult::NoPattern;
        };
        let index = (epoch % pattern.channels.len() as u64) as usize;
        self.current_index = index;
        self.last_hop_time = now;

        HopResult::Success {
            new_channel: pattern.channels[index],
            reason: HopReason::EpochSync,
        }
    }

    /// Check if jamming is currently detected
    pub fn is_jamming_detected(&self) -> bool {
        self.jamming_detected
    }
}

/// Result of a frequency hop
#[derive(Debug, PartialEq, Eq)]
pub enum HopResult {
    /// Hop successful
    Success {
        /// New frequency
        new_channel: FrequencyId,
        /// Reason for hop
        reason: HopReason,
    },
    /// No pattern configured
    NoPattern,
}

/// Reason for frequency hop
#[derive(Debug, PartialEq, Eq)]
pub enum HopReason {
    /// Scheduled hop (dwell time expired)
    ScheduledHop,
    /// Jamming detected (PER exceeded threshold)
    JammingDetected,
    /// Synchronized to specific epoch
    EpochSync,
}

/// Deterministic permutation of a fixed frequency set.
///
/// Uses BLAKE3 to expand the seed to 32 bytes before seeding the PRNG.
pub fn generate_hopping_pattern(
    seed: &[u8],
    channels: &[FrequencyId],
    dwell_time_ms: u64,
) -> HoppingPattern {
    let seed_hash = blake3::hash(seed);
    let mut rng = StdRng::from_seed(*seed_hash.as_bytes());

    let mut channels = channels.to_vec();
    channels.shuffle(&mut rng);

    HoppingPattern {
        channels,
        dwell_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_pattern() -> HoppingPattern {
        HoppingPattern {
            channels: vec![10, 20, 30, 40, 50],
            dwell_time_ms: 100,
        }
    }

    #[test]
    fn test_set_pattern() {
        let mut hopper = FrequencyHopper::new(0.1);
        hopper.set_pattern(create_test_pattern(), 0);
        assert_eq!(hopper.current_channel(), Some(10));
    }

    #[test]
    fn test_empty_pattern_is_ignored() {
        let mut hopper = FrequencyHopper::new(0.1);
        hopper.set_pattern(
            HoppingPattern {
                channels: vec![],
                dwell_time_ms: 10,
            },
            0,
        );
        assert_eq!(hopper.hop(5), HopResult::NoPattern);
    }

    #[test]
    fn test_scheduled_hop() {
        let mut hopper = FrequencyHopper::new(0.1);
        hopper.set_pattern(create_test_pattern(), 1_000);

        assert!(!hopper.should_hop(1_099));
        assert!(hopper.should_hop(1_100));
        assert_eq!(
            hopper.hop(1_100),
            HopResult::Success {
                new_channel: 20,
                reason: HopReason::ScheduledHop
            }
        );
        assert!(!hopper.should_hop(1_150));
    }

    #[test]
    fn test_jamming_triggered_hop() {
        let mut hopper = FrequencyHopper::new(0.1);
        hopper.set_pattern(create_test_pattern(), 0);

        hopper.update_per(0.05);
        assert!(!hopper.is_jamming_detected());
        hopper.update_per(0.5);
        assert!(hopper.should_hop(1));

        match hopper.hop(1) {
            HopResult::Success { reason, .. } => assert_eq!(reason, HopReason::JammingDetected),
            other => panic!("Expected Success, got {other:?}"),
        }
        assert!(!hopper.should_hop(2));
    }

    #[test]
    fn test_hop_wraps_around() {
        let mut hopper = FrequencyHopper::new(0.1);
        hopper.set_pattern(create_test_pattern(), 0);
        for step in 0..5 {
            hopper.hop(step);
        }
        assert_eq!(hopper.current_channel(), Some(10));
    }

    #[test]
    fn test_epoch_sync() {
        let mut hopper = FrequencyHopper::new(0.1);
        hopper.set_pattern(create_test_pattern(), 0);
        assert_eq!(
            hopper.hop_at_epoch(8, 0),
            HopResult::Success {
                new_channel: 40,
                reason: HopReason::EpochSync
            }
        );
    }

    #[test]
    fn test_pattern_is_a_deterministic_permutation() {
        let set = [11, 17, 23, 29];
        let a = generate_hopping_pattern(b"swarm-7", &set, 500);
        let b = generate_hopping_pattern(b"swarm-7", &set, 500);
        assert_eq!(a, b);

        let mut sorted = a.channels.clone();
        sorted.sort();
        assert_eq!(sorted, set.to_vec());
    }
}
