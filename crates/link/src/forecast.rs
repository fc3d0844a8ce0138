//! Forecast stage: which mode should be active over the look-ahead horizon.
//!
//! Each channel is judged usable now from its newest fresh sample, and at
//! every forecast step from the metrics predictor, optionally capped by a
//! coverage model evaluated at the extrapolated flight position. The mesh
//! additionally needs at least one relay path. A mode is viable when all of
//! its channels are.

use crate::context::{CoverageModel, FlightSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use swarmlink_core::{ChannelKind, ConfigHandle, LinkConfig, Mode, Timestamp};
use swarmlink_mesh::MetricsCollector;

/// Preference among working modes, best first.
pub const FORECAST_PREFERENCE: [Mode; 4] =
    [Mode::Hybrid, Mode::Infrastructure, Mode::Tactical, Mode::Satcom];

/// Forecast for one mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeOutlook {
    /// Mode
    pub mode: Mode,
    /// Every channel of the mode is usable now
    pub viable_now: bool,
    /// First forecast step at which the mode stops being viable; `None` if it
    /// stays viable over the whole horizon (or is not viable now)
    pub viable_until_s: Option<u64>,
}

impl ModeOutlook {
    /// Viable now and over the whole horizon.
    pub fn is_stable(&self) -> bool {
        self.viable_now && self.viable_until_s.is_none()
    }
}

/// What the forecast recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recommendation {
    /// Mode to be in
    pub target: Mode,
    /// Seconds until the switch should happen; `None` when `target` is the current mode
    pub time_to_switch_s: Option<u64>,
}

/// Forecast over all working modes.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutlook {
    /// When the forecast was made
    pub at: Timestamp,
    /// Per mode, in [`FORECAST_PREFERENCE`] order
    pub modes: Vec<ModeOutlook>,
    /// Channels usable now
    pub usable_channels: Vec<ChannelKind>,
}

impl LinkOutlook {
    /// Outlook for `mode`.
    pub fn mode(&self, mode: Mode) -> Option<&ModeOutlook> {
        self.modes.iter().find(|o| o.mode == mode)
    }

    /// Whether any working mode is viable now.
    pub fn any_viable(&self) -> bool {
        self.modes.iter().any(|o| o.viable_now)
    }

    /// Recommend a mode given the current one, skipping `excluded` modes.
    ///
    /// Prefers the best mode that stays viable over the horizon, falling back
    /// to the best mode viable now. Returns `None` when nothing is viable.
    pub fn recommend(&self, current: Mode, excluded: impl Fn(Mode) -> bool) -> Option<Recommendation> {
        let candidates: Vec<&ModeOutlook> = self
            .modes
            .iter()
            .filter(|o| o.viable_now && !excluded(o.mode))
            .collect();
        let target = candidates
            .iter()
            .find(|o| o.is_stable())
            .or_else(|| candidates.first())?
            .mode;

        if target == current {
            return Some(Recommendation {
                target,
                time_to_switch_s: None,
            });
        }
        let time_to_switch_s = match self.mode(current) {
            Some(o) if o.viable_now && !excluded(current) => o.viable_until_s.unwrap_or(0),
            _ => 0,
        };
        Some(Recommendation {
            target,
            time_to_switch_s: Some(time_to_switch_s),
        })
    }

    /// Most secure viable mode not using `avoid`, skipping `excluded` modes.
    pub fn most_secure_avoiding(
        &self,
        avoid: ChannelKind,
        excluded: impl Fn(Mode) -> bool,
    ) -> Option<Mode> {
        Mode::SECURITY_ORDER
            .iter()
            .copied()
            .filter(|m| *m != Mode::Emergency && !m.uses_channel(avoid) && !excluded(*m))
            .find(|m| self.mode(*m).is_some_and(|o| o.viable_now))
    }
}

/// Builds [`LinkOutlook`]s.
pub struct Forecaster {
    metrics: Arc<MetricsCollector>,
    config: ConfigHandle,
    coverage: Option<Arc<dyn CoverageModel>>,
}

impl Forecaster {
    /// Forecaster over `metrics`.
    pub fn new(metrics: Arc<MetricsCollector>, config: ConfigHandle) -> Self {
        Self {
            metrics,
            config,
            coverage: None,
        }
    }

    /// Cap predictions by a coverage model along the flight path.
    pub fn with_coverage(mut self, coverage: Arc<dyn CoverageModel>) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Forecast every working mode.
    pub fn outlook(&self, now: Timestamp, flight: &FlightSnapshot, relay_paths: bool) -> LinkOutlook {
        let config = self.config.snapshot();
        let steps: Vec<u64> = (1..)
            .map(|i| i * config.forecast_step_s)
            .take_while(|s| *s <= config.forecast_horizon_s)
            .collect();

        let mut now_usable = HashMap::new();
        let mut first_loss = HashMap::new();
        for channel in ChannelKind::ALL {
            if channel == ChannelKind::EmergencyRadio {
                continue;
            }
            let gated = channel == ChannelKind::Mesh && !relay_paths;
            let usable = !gated && self.usable_now(channel, now, &config);
            now_usable.insert(channel, usable);
            if usable {
                let loss = steps
                    .iter()
                    .copied()
                    .find(|s| !self.usable_at(channel, *s, flight, &config));
                first_loss.insert(channel, loss);
            }
        }

        let modes = FORECAST_PREFERENCE
            .iter()
            .map(|mode| {
                let viable_now = mode
                    .channels()
                    .iter()
                    .all(|c| now_usable.get(c).copied().unwrap_or(false));
                let viable_until_s = if viable_now {
                    mode.channels()
                        .iter()
                        .filter_map(|c| first_loss.get(c).copied().flatten())
                        .min()
                } else {
                    None
                };
                ModeOutlook {
                    mode: *mode,
                    viable_now,
                    viable_until_s,
                }
            })
            .collect();

        let mut usable_channels: Vec<ChannelKind> = now_usable
            .into_iter()
            .filter_map(|(c, usable)| usable.then_some(c))
            .collect();
        usable_channels.sort();

        LinkOutlook {
            at: now,
            modes,
            usable_channels,
        }
    }

    fn usable_now(&self, channel: ChannelKind, now: Timestamp, config: &LinkConfig) -> bool {
        self.metrics.latest(channel).is_some_and(|o| {
            now.saturating_sub(o.timestamp) <= config.observation_window_ms()
                && o.is_usable(config.usable_signal_floor, config.usable_error_ceiling)
        })
    }

    fn usable_at(&self, channel: ChannelKind, step_s: u64, flight: &FlightSnapshot, config: &LinkConfig) -> bool {
        let Some(mut forecast) = self.metrics.predict(channel, step_s) else {
            return false;
        };
        if let Some(coverage) = &self.coverage {
            let (lat, lon) = flight.extrapolate(step_s as f64);
            if let Some(expected) = coverage.expected_signal(channel, lat, lon) {
                forecast.signal_quality = forecast.signal_quality.min(expected);
            }
        }
        forecast.is_usable(config.usable_signal_floor, config.usable_error_ceiling)
    }
}
