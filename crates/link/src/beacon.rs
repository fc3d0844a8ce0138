//! EMERGENCY beacon.
//!
//! Unencrypted, unsigned broadcast of the node's position and battery,
//! hopping over a small fixed frequency set. The hop order is derived from
//! the node id so receivers that know the swarm roster can follow it.

use crate::context::FlightSnapshot;
use crate::frame::{BeaconFrame, Envelope};
use swarmlink_core::{ConfigHandle, NodeId, Timestamp};
use swarmlink_mesh::{generate_hopping_pattern, FrequencyHopper, FrequencyId, HopReason, HopResult};

/// Beacon state for one node.
pub struct Beacon {
    node_id: NodeId,
    hopper: FrequencyHopper,
    sequence: u64,
    active: bool,
    config: ConfigHandle,
}

impl Beacon {
    /// Idle beacon. Error rates above the usable ceiling count as jamming.
    pub fn new(node_id: impl Into<NodeId>, config: ConfigHandle) -> Self {
        let jamming_threshold = config.snapshot().usable_error_ceiling;
        Self {
            node_id: node_id.into(),
            hopper: FrequencyHopper::new(jamming_threshold),
            sequence: 0,
            active: false,
            config,
        }
    }

    /// Start broadcasting; returns the first frequency.
    pub fn start(&mut self, now: Timestamp) -> Option<FrequencyId> {
        let config = self.config.snapshot();
        let pattern = generate_hopping_pattern(
            self.node_id.as_bytes(),
            &config.beacon_channels,
            config.beacon_dwell_ms,
        );
        self.hopper.set_pattern(pattern, now);
        self.active = true;
        tracing::info!(node_id = %self.node_id, frequency = ?self.hopper.current_channel(), "Beacon started");
        self.hopper.current_channel()
    }

    /// Stop broadcasting.
    pub fn stop(&mut self) {
        if self.active {
            tracing::info!(node_id = %self.node_id, sent = self.sequence, "Beacon stopped");
        }
        self.active = false;
    }

    /// Whether the beacon is broadcasting.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current frequency.
    pub fn frequency(&self) -> Option<FrequencyId> {
        self.hopper.current_channel()
    }

    /// Feed the emergency radio's error rate; above the threshold the next
    /// [`Beacon::retune`] hops at once.
    pub fn report_error_rate(&mut self, error_rate: f64) {
        self.hopper.update_per(error_rate);
    }

    /// Hop if the dwell time is up or jamming was reported.
    pub fn retune(&mut self, now: Timestamp) -> Option<(FrequencyId, HopReason)> {
        if !self.active || !self.hopper.should_hop(now) {
            return None;
        }
        match self.hopper.hop(now) {
            HopResult::Success { new_channel, reason } => {
                if reason == HopReason::JammingDetected {
                    tracing::warn!(frequency = new_channel, "Beacon hopped away from jammed frequency");
                }
                Some((new_channel, reason))
            }
            HopResult::NoPattern => None,
        }
    }

    /// Next beacon frame, carrying `messages` in clear.
    pub fn next_frame(&mut self, now: Timestamp, flight: &FlightSnapshot, messages: Vec<Envelope>) -> Option<BeaconFrame> {
        if !self.active {
            return None;
        }
        self.sequence += 1;
        Some(BeaconFrame {
            node_id: self.node_id.clone(),
            lat: flight.lat,
            lon: flight.lon,
            battery_pct: flight.battery_pct,
            sequence: self.sequence,
            timestamp: now,
            messages,
        })
    }
}
