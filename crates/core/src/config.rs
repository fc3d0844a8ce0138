//! Configuration management for SwarmLink.
//!
//! Every numeric threshold the controller acts on lives here as a default,
//! not as a constant in the code that uses it. Values are meant to be
//! field-calibrated and can be changed at runtime through [`ConfigHandle`].

use crate::error::CoreError;
use crate::types::{Mode, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Runtime configuration of the adaptive link controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Local node identifier
    pub node_id: String,
    /// Mode entered at startup
    pub initial_mode: Mode,

    /// Expected base-station/peer density keyed by area key (see [`LinkConfig::area_key`])
    pub expected_density_per_area: HashMap<String, f64>,
    /// Expected density used for areas missing from the table
    pub default_expected_density: f64,
    /// Grid cell size in degrees used to derive an area key from a position
    pub area_cell_deg: f64,
    /// Observed/expected density ratio above which an IMSI catcher is suspected
    pub density_multiplier: f64,
    /// Fingerprint similarity below which spoofing is suspected
    pub fingerprint_similarity_floor: f64,
    /// Measured/expected latency ratio above which timing is anomalous
    pub timing_anomaly_factor: f64,

    /// Trust score below which a relay is excluded from path computation
    pub trust_floor: f64,
    /// Seconds a quarantined relay is retained for audit before removal
    pub quarantine_expiry_s: u64,
    /// Trust increment for a verified proof-of-relay
    pub trust_reward: f64,

    /// Number of diverse paths selected per target
    pub path_diversity_n: usize,
    /// Maximum hop count for candidate paths
    pub max_hops: usize,
    /// Cap on candidate paths enumerated per target
    pub max_candidates: usize,

    /// Look-ahead horizon of the forecast
    pub forecast_horizon_s: u64,
    /// Step between forecast samples
    pub forecast_step_s: u64,
    /// Seconds a differing recommendation must persist before a transition is pending
    pub sustain_window_s: u64,
    /// Time-to-switch at which pre-transition authentication starts
    pub pretransition_lead_s: u64,
    /// Time-to-switch at which overlap execution starts
    pub overlap_window_s: u64,
    /// Overlap duration without delivery failure required to commit
    pub stabilization_window_s: u64,
    /// Bound on a channel authentication handshake
    pub auth_timeout_ms: u64,
    /// Cooldown a failed target stays blacklisted after rollback
    pub rollback_cooldown_s: u64,
    /// Seconds a mode stays locked out after a forcing threat on its channels
    pub threat_lockout_s: u64,

    /// Continuous blackout after which EMERGENCY is entered
    pub blackout_to_emergency_s: u64,
    /// Battery percentage at or below which EMERGENCY is demanded
    pub emergency_battery_pct: f64,

    /// Minimum signal quality for a channel to count as usable
    pub usable_signal_floor: f64,
    /// Maximum error rate for a channel to count as usable
    pub usable_error_ceiling: f64,

    /// Lowest severity that forces an immediate switch away from the active mode
    pub force_switch_severity: Severity,
    /// Maximum delay before a threat of each severity reaches the mode controller
    pub severity_response_ms: HashMap<Severity, u64>,

    /// Sliding observation window retained per channel
    pub observation_window_s: u64,
    /// Interval between periodic proof-of-relay probes
    pub probe_interval_s: u64,
    /// Mode controller scheduling tick
    pub tick_interval_ms: u64,
    /// Interval between EMERGENCY-priority delivery retries
    pub emergency_retry_interval_ms: u64,
    /// Fixed frequency set for the EMERGENCY beacon
    pub beacon_channels: Vec<u32>,
    /// Dwell time per beacon frequency
    pub beacon_dwell_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let severity_response_ms = HashMap::from([
            (Severity::Low, 1_000),
            (Severity::Medium, 1_000),
            (Severity::High, 0),
            (Severity::Critical, 0),
        ]);

        Self {
            node_id: "node-001".to_string(),
            initial_mode: Mode::Infrastructure,
            expected_density_per_area: HashMap::new(),
            default_expected_density: 4.0,
            area_cell_deg: 0.01,
            density_multiplier: 2.0,
            fingerprint_similarity_floor: 0.8,
            timing_anomaly_factor: 1.5,
            trust_floor: 0.3,
            quarantine_expiry_s: 3_600,
            trust_reward: 0.05,
            path_diversity_n: 3,
            max_hops: 6,
            max_candidates: 64,
            forecast_horizon_s: 30,
            forecast_step_s: 5,
            sustain_window_s: 3,
            pretransition_lead_s: 15,
            overlap_window_s: 5,
            stabilization_window_s: 10,
            auth_timeout_ms: 3_000,
            rollback_cooldown_s: 120,
            threat_lockout_s: 300,
            blackout_to_emergency_s: 300,
            emergency_battery_pct: 10.0,
            usable_signal_floor: 0.3,
            usable_error_ceiling: 0.5,
            force_switch_severity: Severity::High,
            severity_response_ms,
            observation_window_s: 30,
            probe_interval_s: 60,
            tick_interval_ms: 1_000,
            emergency_retry_interval_ms: 2_000,
            beacon_channels: vec![11, 17, 23, 29],
            beacon_dwell_ms: 500,
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file; missing fields take defaults.
    #[cfg(feature = "file-config")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(CoreError::Config(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("trust_floor", self.trust_floor)?;
        unit("fingerprint_similarity_floor", self.fingerprint_similarity_floor)?;
        unit("usable_signal_floor", self.usable_signal_floor)?;
        unit("usable_error_ceiling", self.usable_error_ceiling)?;

        if self.node_id.is_empty() {
            return Err(CoreError::Config("node_id must not be empty".to_string()));
        }
        if self.path_diversity_n == 0 {
            return Err(CoreError::Config("path_diversity_n must be at least 1".to_string()));
        }
        if self.max_hops == 0 {
            return Err(CoreError::Config("max_hops must be at least 1".to_string()));
        }
        if self.density_multiplier <= 0.0 || self.timing_anomaly_factor <= 0.0 {
            return Err(CoreError::Config(
                "density_multiplier and timing_anomaly_factor must be positive".to_string(),
            ));
        }
        if self.forecast_step_s == 0 || self.forecast_step_s > self.forecast_horizon_s {
            return Err(CoreError::Config(format!(
                "forecast_step_s {} must be within (0, forecast_horizon_s {}]",
                self.forecast_step_s, self.forecast_horizon_s
            )));
        }
        if self.overlap_window_s > self.pretransition_lead_s {
            return Err(CoreError::Config(
                "overlap_window_s must not exceed pretransition_lead_s".to_string(),
            ));
        }
        if self.beacon_channels.is_empty() {
            return Err(CoreError::Config("beacon_channels must not be empty".to_string()));
        }
        Ok(())
    }

    /// Area key for a position, on a grid of `area_cell_deg` degrees.
    pub fn area_key(&self, lat: f64, lon: f64) -> String {
        let cell = if self.area_cell_deg > 0.0 {
            self.area_cell_deg
        } else {
            0.01
        };
        format!("{}:{}", (lat / cell).floor() as i64, (lon / cell).floor() as i64)
    }

    /// Expected density for an area key.
    pub fn expected_density(&self, area_key: &str) -> f64 {
        self.expected_density_per_area
            .get(area_key)
            .copied()
            .unwrap_or(self.default_expected_density)
    }

    /// Allowed delay before a threat of `severity` must reach the controller.
    pub fn response_latency(&self, severity: Severity) -> Duration {
        let ms = self.severity_response_ms.get(&severity).copied().unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// Observation window as milliseconds.
    pub fn observation_window_ms(&self) -> u64 {
        self.observation_window_s.saturating_mul(1_000)
    }
}

/// Shared, runtime-tunable configuration.
///
/// Readers take a cheap snapshot per evaluation, so an update is picked up on
/// the next cycle of each component without a restart.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<LinkConfig>>,
}

impl ConfigHandle {
    /// Wrap a validated configuration.
    pub fn new(config: LinkConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
        })
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> LinkConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a change; rejected (and not applied) if the result is invalid.
    pub fn update<F>(&self, change: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut LinkConfig),
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut candidate = guard.clone();
        change(&mut candidate);
        candidate.validate()?;
        tracing::info!(node_id = %candidate.node_id, "Link configuration updated");
        *guard = candidate;
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LinkConfig::default())),
        }
    }
}
