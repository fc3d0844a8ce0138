//! Flight/mission context collaborator.

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use swarmlink_core::ChannelKind;

/// Read-only view of the aircraft and mission state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightSnapshot {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
    /// Northward velocity in m/s
    pub velocity_north_ms: f64,
    /// Eastward velocity in m/s
    pub velocity_east_ms: f64,
    /// Remaining battery in percent
    pub battery_pct: f64,
    /// Mission criticality in `[0, 1]`
    pub mission_criticality: f64,
    /// Mission policy demands EMERGENCY regardless of link state
    pub emergency_demanded: bool,
}

impl Default for FlightSnapshot {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            velocity_north_ms: 0.0,
            velocity_east_ms: 0.0,
            battery_pct: 100.0,
            mission_criticality: 0.5,
            emergency_demanded: false,
        }
    }
}

const METERS_PER_DEG_LAT: f64 = 111_320.0;

impl FlightSnapshot {
    /// Position after flying `seconds` on the current velocity vector.
    pub fn extrapolate(&self, seconds: f64) -> (f64, f64) {
        let lat = self.lat + self.velocity_north_ms * seconds / METERS_PER_DEG_LAT;
        let meters_per_deg_lon = METERS_PER_DEG_LAT * self.lat.to_radians().cos().abs().max(1e-6);
        let lon = self.lon + self.velocity_east_ms * seconds / meters_per_deg_lon;
        (lat, lon)
    }
}

/// Source of flight state.
pub trait FlightContext: Send + Sync {
    /// Current snapshot.
    fn snapshot(&self) -> FlightSnapshot;
}

/// Expected coverage along the flight path (terrain/coverage model).
pub trait CoverageModel: Send + Sync {
    /// Expected signal quality of `channel` at a position, if the model knows.
    fn expected_signal(&self, channel: ChannelKind, lat: f64, lon: f64) -> Option<f64>;
}

/// Flight context fed by an external autopilot bridge or a simulation.
#[derive(Debug, Default)]
pub struct SharedFlightContext {
    state: RwLock<FlightSnapshot>,
}

impl SharedFlightContext {
    /// Start from `initial`.
    pub fn new(initial: FlightSnapshot) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    /// Replace the whole snapshot.
    pub fn set(&self, snapshot: FlightSnapshot) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Apply a partial update.
    pub fn update(&self, change: impl FnOnce(&mut FlightSnapshot)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut *state);
    }
}

impl FlightContext for SharedFlightContext {
    fn snapshot(&self) -> FlightSnapshot {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extrapolate_north() {
        let snapshot = FlightSnapshot {
            velocity_north_ms: 111.32,
            ..FlightSnapshot::default()
        };
        let (lat, lon) = snapshot.extrapolate(10.0);
        assert!((lat - 0.01).abs() < 1e-9);
        assert_eq!(lon, 0.0);
    }

    #[test]
    fn test_shared_context_update() {
        let context = SharedFlightContext::default();
        context.update(|s| s.battery_pct = 9.0);
        assert_eq!(context.snapshot().battery_pct, 9.0);
    }
}
